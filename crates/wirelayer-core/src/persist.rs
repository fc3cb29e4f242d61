use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::models::*;
use crate::store::CaptureStore;
use crate::views::{state_label, Alert, FlowSummary, ProtocolStat};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    filter TEXT,
    link_type TEXT NOT NULL,
    state TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    packet_count INTEGER NOT NULL,
    out_of_order_packets INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS packets (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    frame_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    size INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (session_id, frame_number)
);
CREATE TABLE IF NOT EXISTS transport_records (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    frame_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    protocol TEXT NOT NULL,
    ip_number INTEGER,
    src_endpoint TEXT,
    dst_endpoint TEXT,
    ttl INTEGER,
    tcp_flags TEXT,
    tcp_seq INTEGER,
    tcp_ack INTEGER,
    payload_size INTEGER NOT NULL,
    checksum_valid INTEGER,
    decode_error TEXT,
    FOREIGN KEY (session_id, frame_number) REFERENCES packets(session_id, frame_number)
);
CREATE TABLE IF NOT EXISTS flows (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    protocol TEXT NOT NULL,
    endpoint_a TEXT NOT NULL,
    endpoint_b TEXT NOT NULL,
    state TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    first_frame INTEGER NOT NULL,
    last_frame INTEGER NOT NULL,
    packet_count INTEGER NOT NULL,
    bytes_sent INTEGER NOT NULL,
    bytes_received INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    midstream INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS encoding_records (
    id TEXT PRIMARY KEY,
    transport_id TEXT NOT NULL REFERENCES transport_records(id),
    encoding_type TEXT NOT NULL,
    version TEXT,
    headers TEXT NOT NULL,
    raw_body BLOB NOT NULL,
    decoded_body BLOB,
    body_complete INTEGER NOT NULL,
    is_compressed INTEGER NOT NULL,
    encryption_detected INTEGER NOT NULL,
    entropy REAL NOT NULL,
    encoding_errors TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS extracted_files (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    content_hash TEXT NOT NULL,
    md5 TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    source_content_id TEXT NOT NULL,
    data BLOB NOT NULL,
    UNIQUE (session_id, content_hash)
);
CREATE TABLE IF NOT EXISTS content_records (
    id TEXT PRIMARY KEY,
    encoding_id TEXT NOT NULL REFERENCES encoding_records(id),
    content_type TEXT NOT NULL,
    text TEXT,
    binary BLOB,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    is_extracted INTEGER NOT NULL,
    file_id TEXT REFERENCES extracted_files(id)
);
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    target_layer TEXT NOT NULL,
    definition TEXT NOT NULL,
    severity TEXT NOT NULL,
    enabled INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS matches (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    rule_id TEXT NOT NULL REFERENCES rules(id),
    rule_name TEXT NOT NULL,
    layer TEXT NOT NULL,
    record_id TEXT NOT NULL,
    frame_number INTEGER NOT NULL,
    severity TEXT NOT NULL,
    severity_rank INTEGER NOT NULL,
    matched_data TEXT NOT NULL,
    tags TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_matches_session ON matches(session_id, severity_rank);

CREATE VIEW IF NOT EXISTS flow_summary AS
    SELECT session_id, id AS flow_id, protocol, endpoint_a, endpoint_b, state,
           packet_count, bytes_sent, bytes_received,
           bytes_sent + bytes_received AS total_bytes, duration_ms
    FROM flows
    ORDER BY session_id, first_frame, id;

CREATE VIEW IF NOT EXISTS high_severity_alerts AS
    SELECT m.session_id, s.name AS session_name, m.id AS match_id, m.rule_id, m.rule_name,
           m.severity, m.layer, t.src_endpoint, t.dst_endpoint, m.matched_data, m.timestamp
    FROM matches m
    JOIN sessions s ON s.id = m.session_id
    LEFT JOIN transport_records t
           ON t.session_id = m.session_id AND t.frame_number = m.frame_number
    WHERE m.severity_rank >= 2
    ORDER BY m.severity_rank DESC, m.timestamp, m.id;

CREATE VIEW IF NOT EXISTS protocol_distribution AS
    SELECT * FROM (
        SELECT t.session_id, 'TRANSPORT' AS layer, t.protocol,
               COUNT(*) AS packets, SUM(p.size) AS bytes
        FROM transport_records t
        JOIN packets p ON p.session_id = t.session_id AND p.frame_number = t.frame_number
        GROUP BY t.session_id, t.protocol
        UNION ALL
        SELECT t.session_id, 'ENCODING' AS layer, e.encoding_type AS protocol,
               COUNT(*) AS packets, SUM(p.size) AS bytes
        FROM encoding_records e
        JOIN transport_records t ON t.id = e.transport_id
        JOIN packets p ON p.session_id = t.session_id AND p.frame_number = t.frame_number
        GROUP BY t.session_id, e.encoding_type
    )
    ORDER BY session_id, layer DESC, protocol;
";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportCounts {
    pub packets: usize,
    pub transport: usize,
    pub flows: usize,
    pub encoding: usize,
    pub content: usize,
    pub files: usize,
    pub matches: usize,
}

/// SQLite copy of one or more analyzed sessions.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot create database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA).context("cannot create schema")?;
        Ok(Self { conn })
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("database not found at {}", path.display());
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Write one session and everything derived from it. Records are
    /// immutable and keyed by stable ids, so re-exporting only refreshes the
    /// session row, the flows and the rule definitions.
    pub fn export_session(&self, store: &CaptureStore, session: SessionId, rules: &[Rule]) -> Result<ExportCounts> {
        let sess = store
            .session(session)
            .with_context(|| format!("unknown session {}", session))?;
        let sid = session.to_string();
        let mut counts = ExportCounts::default();

        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO sessions
             (id, name, filter, link_type, state, opened_at, start_time, end_time, packet_count, out_of_order_packets)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state, start_time = excluded.start_time, end_time = excluded.end_time,
                packet_count = excluded.packet_count, out_of_order_packets = excluded.out_of_order_packets",
            params![
                sid,
                sess.name,
                sess.filter,
                format!("{:?}", sess.link_type),
                format!("{:?}", sess.state),
                sess.opened_at.to_rfc3339(),
                sess.start_time.map(|t| t.to_rfc3339()),
                sess.end_time.map(|t| t.to_rfc3339()),
                sess.packet_count as i64,
                sess.out_of_order_packets as i64,
            ],
        )?;

        for packet in store.packets(session) {
            tx.execute(
                "INSERT OR IGNORE INTO packets (session_id, frame_number, timestamp, size, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sid,
                    packet.id.frame_number as i64,
                    packet.timestamp.to_rfc3339(),
                    packet.size,
                    packet.data,
                ],
            )?;
            counts.packets += 1;
        }

        for record in store.transport_records(session) {
            let endpoint = |ip: Option<std::net::IpAddr>, port: u16| ip.map(|ip| Endpoint { ip, port }.to_string());
            let ip_number = match record.protocol {
                TransportProtocol::Other(n) => Some(n),
                _ => None,
            };
            tx.execute(
                "INSERT OR IGNORE INTO transport_records
                 (id, session_id, frame_number, timestamp, protocol, ip_number, src_endpoint, dst_endpoint,
                  ttl, tcp_flags, tcp_seq, tcp_ack, payload_size, checksum_valid, decode_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    record.id.to_string(),
                    sid,
                    record.packet.frame_number as i64,
                    record.timestamp.to_rfc3339(),
                    record.protocol.label(),
                    ip_number,
                    endpoint(record.src_ip, record.src_port),
                    endpoint(record.dst_ip, record.dst_port),
                    record.ttl,
                    record.tcp_flags.map(|f| f.to_string()),
                    record.tcp_seq,
                    record.tcp_ack,
                    record.payload_size,
                    record.checksum_valid,
                    record.decode_error.map(|e| e.to_string()),
                ],
            )?;
            counts.transport += 1;
        }

        for flow in store.flows().flows(session) {
            tx.execute(
                "INSERT OR REPLACE INTO flows
                 (id, session_id, protocol, endpoint_a, endpoint_b, state, start_time, end_time,
                  first_frame, last_frame, packet_count, bytes_sent, bytes_received, duration_ms, midstream)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    flow.id.to_string(),
                    sid,
                    flow.key.protocol.label(),
                    flow.key.first.to_string(),
                    flow.key.second.to_string(),
                    state_label(flow.state),
                    flow.start_time.to_rfc3339(),
                    flow.end_time.map(|t| t.to_rfc3339()),
                    flow.first_frame as i64,
                    flow.last_frame as i64,
                    flow.packet_count as i64,
                    flow.bytes_sent as i64,
                    flow.bytes_received as i64,
                    flow.duration_ms(),
                    flow.flags.midstream,
                ],
            )?;
            counts.flows += 1;
        }

        for record in store.encoding_records(session) {
            tx.execute(
                "INSERT OR IGNORE INTO encoding_records
                 (id, transport_id, encoding_type, version, headers, raw_body, decoded_body,
                  body_complete, is_compressed, encryption_detected, entropy, encoding_errors)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    record.transport.to_string(),
                    record.encoding_type.label(),
                    record.version,
                    serde_json::to_string(&record.headers)?,
                    record.raw_body,
                    record.decoded_body,
                    record.body_complete,
                    record.is_compressed,
                    record.encryption_detected,
                    record.entropy,
                    serde_json::to_string(&record.encoding_errors)?,
                ],
            )?;
            counts.encoding += 1;
        }

        for file in store.files(session) {
            tx.execute(
                "INSERT OR IGNORE INTO extracted_files
                 (id, session_id, content_hash, md5, mime_type, name, size_bytes, source_content_id, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    file.id.to_string(),
                    sid,
                    file.content_hash,
                    file.md5,
                    file.mime_type,
                    file.name,
                    file.size_bytes as i64,
                    file.source.to_string(),
                    file.data,
                ],
            )?;
            counts.files += 1;
        }

        for record in store.content_records(session) {
            tx.execute(
                "INSERT OR IGNORE INTO content_records
                 (id, encoding_id, content_type, text, binary, content_hash, size_bytes, is_extracted, file_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.encoding.to_string(),
                    record.content_type,
                    record.text,
                    record.binary,
                    record.content_hash,
                    record.size_bytes as i64,
                    record.is_extracted,
                    record.file.map(|f| f.to_string()),
                ],
            )?;
            counts.content += 1;
        }

        let mut seen = HashSet::new();
        for rule in rules {
            if !seen.insert(rule.id.as_str()) {
                tracing::warn!(rule = %rule.id, name = %rule.name, "duplicate rule id not exported");
                continue;
            }
            tx.execute(
                "INSERT INTO rules (id, name, target_layer, definition, severity, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, target_layer = excluded.target_layer,
                    definition = excluded.definition, severity = excluded.severity,
                    enabled = excluded.enabled",
                params![
                    rule.id,
                    rule.name,
                    rule.target_layer.to_string(),
                    serde_json::to_string(&rule.condition)?,
                    rule.severity.to_string(),
                    rule.enabled,
                ],
            )?;
        }

        for m in store.matches(session) {
            tx.execute(
                "INSERT OR IGNORE INTO matches
                 (id, session_id, rule_id, rule_name, layer, record_id, frame_number,
                  severity, severity_rank, matched_data, tags, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    m.id.to_string(),
                    sid,
                    m.rule_id,
                    m.rule_name,
                    m.record.layer().to_string(),
                    m.record.to_string(),
                    m.record.packet().frame_number as i64,
                    m.severity.to_string(),
                    m.severity as i64,
                    m.matched_data,
                    m.tags.join(","),
                    m.timestamp.to_rfc3339(),
                ],
            )?;
            counts.matches += 1;
        }

        tx.commit()?;
        tracing::info!(
            session = %sid,
            packets = counts.packets,
            flows = counts.flows,
            matches = counts.matches,
            "session exported"
        );
        Ok(counts)
    }

    pub fn flow_summary(&self) -> Result<Vec<FlowSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, flow_id, protocol, endpoint_a, endpoint_b, state,
                    packet_count, bytes_sent, bytes_received, total_bytes, duration_ms
             FROM flow_summary",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FlowSummary {
                session: row.get(0)?,
                flow_id: row.get(1)?,
                protocol: row.get(2)?,
                endpoint_a: row.get(3)?,
                endpoint_b: row.get(4)?,
                state: row.get(5)?,
                packets: get_u64(row, 6)?,
                bytes_a_to_b: get_u64(row, 7)?,
                bytes_b_to_a: get_u64(row, 8)?,
                total_bytes: get_u64(row, 9)?,
                duration_ms: row.get(10)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("cannot read flow_summary")
    }

    pub fn high_severity_alerts(&self) -> Result<Vec<Alert>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, session_name, match_id, rule_id, rule_name, severity, layer,
                    src_endpoint, dst_endpoint, matched_data, timestamp
             FROM high_severity_alerts",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Alert {
                session: row.get(0)?,
                session_name: row.get(1)?,
                match_id: row.get(2)?,
                rule_id: row.get(3)?,
                rule_name: row.get(4)?,
                severity: parse_column(row, 5)?,
                layer: parse_column(row, 6)?,
                src: row.get(7)?,
                dst: row.get(8)?,
                matched_data: row.get(9)?,
                timestamp: get_time(row, 10)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("cannot read high_severity_alerts")
    }

    pub fn protocol_distribution(&self) -> Result<Vec<ProtocolStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, layer, protocol, packets, bytes FROM protocol_distribution",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProtocolStat {
                session: row.get(0)?,
                layer: parse_column(row, 1)?,
                protocol: row.get(2)?,
                packets: get_u64(row, 3)?,
                bytes: get_u64(row, 4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("cannot read protocol_distribution")
    }
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|v| v.max(0) as u64)
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::views;

    fn sample_store() -> (CaptureStore, SessionId, Vec<Rule>) {
        let store = CaptureStore::new(120);
        let s = store.open_session("export", None);
        let frames = [
            tcp_frame([10, 0, 0, 1], 4000, [10, 0, 0, 2], 80, Tcp::syn(1), b""),
            tcp_frame([10, 0, 0, 2], 80, [10, 0, 0, 1], 4000, Tcp::syn_ack(9, 2), b""),
            udp_frame([10, 0, 0, 1], 5000, [10, 0, 0, 53], 53, &dns_query(1, "x.example")),
        ];
        for (i, frame) in frames.iter().enumerate() {
            store.ingest_packet(s, i as u64 + 1, ts(i as i64), frame.clone()).unwrap();
        }
        store.close_session(s).unwrap();

        let rule = Rule {
            id: "syn".into(),
            name: "SYN seen".into(),
            description: None,
            target_layer: Layer::Transport,
            condition: RuleCondition::Pattern { pattern: "flags=\\[SYN\\]".into(), case_insensitive: false },
            severity: Severity::High,
            enabled: true,
            tags: vec!["recon".into()],
        };
        let engine = crate::rules::RuleEngine::new(vec![rule.clone()], &crate::config::AnalysisConfig::default());

        let mut transport = Vec::new();
        for packet in store.packets(s) {
            transport.push(store.insert_transport(crate::transport::decode_or_degrade(&packet, LinkType::Ethernet)).unwrap());
        }
        store.flows().reconstruct(s, &transport);
        for record in &transport {
            let (matches, _) = engine.evaluate_record(crate::rules::LayerRecord::Transport(record));
            for m in matches {
                store.insert_match(m).unwrap();
            }
        }
        (store, s, vec![rule])
    }

    #[test]
    fn test_export_and_views_agree() -> Result<()> {
        let (store, s, rules) = sample_store();
        let dir = tempfile::tempdir()?;
        let db = Database::create(&dir.path().join("capture.db"))?;

        let counts = db.export_session(&store, s, &rules)?;
        assert_eq!(counts.packets, 3);
        assert_eq!(counts.flows, 2);
        assert_eq!(counts.matches, 1);

        assert_eq!(db.flow_summary()?, views::flow_summary(&store, s));
        assert_eq!(db.high_severity_alerts()?, views::high_severity_alerts(&store, s));

        let mut sql = db.protocol_distribution()?;
        let mut rust = views::protocol_distribution(&store, s);
        sql.sort_by(|a, b| (a.layer, &a.protocol).cmp(&(b.layer, &b.protocol)));
        rust.sort_by(|a, b| (a.layer, &a.protocol).cmp(&(b.layer, &b.protocol)));
        assert_eq!(sql, rust);
        Ok(())
    }

    #[test]
    fn test_reexport_is_idempotent() -> Result<()> {
        let (store, s, rules) = sample_store();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("capture.db");
        let db = Database::create(&path)?;
        db.export_session(&store, s, &rules)?;
        db.export_session(&store, s, &rules)?;

        let reopened = Database::open(&path)?;
        assert_eq!(reopened.flow_summary()?.len(), 2);
        assert_eq!(reopened.high_severity_alerts()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_rule_id_keeps_first_definition() -> Result<()> {
        let (store, s, mut rules) = sample_store();
        let mut shadow = rules[0].clone();
        shadow.name = "shadowed".into();
        shadow.severity = Severity::Low;
        rules.push(shadow);

        let dir = tempfile::tempdir()?;
        let db = Database::create(&dir.path().join("capture.db"))?;
        db.export_session(&store, s, &rules)?;

        let stored: Vec<(String, String)> = db
            .conn
            .prepare("SELECT name, severity FROM rules WHERE id = 'syn'")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(stored, vec![("SYN seen".to_string(), Severity::High.to_string())]);
        Ok(())
    }

    #[test]
    fn test_open_missing_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Database::open(&dir.path().join("absent.db")).is_err());
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{IngestionError, IntegrityError};
use crate::flow::FlowTable;
use crate::models::*;

/// Extracted-file payload proposed by the content decoder.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub mime_type: String,
    pub name: String,
    pub md5: String,
    pub data: Vec<u8>,
}

/// In-memory system of record for capture sessions and every layer derived
/// from them.
///
/// Sessions and packets are written through the ingestion API; layer
/// records are append-only and validated against their parent on insert.
/// The flow table is the only structure mutated after creation.
pub struct CaptureStore {
    sessions: DashMap<SessionId, Session>,
    packets: DashMap<PacketId, Arc<Packet>>,
    transport: DashMap<TransportId, Arc<TransportRecord>>,
    encoding: DashMap<EncodingId, Arc<EncodingRecord>>,
    content: DashMap<ContentId, Arc<ContentRecord>>,
    files: DashMap<FileId, Arc<ExtractedFile>>,
    files_by_hash: DashMap<(SessionId, String), FileId>,
    matches: DashMap<MatchId, Arc<Match>>,
    flows: FlowTable,
}

impl CaptureStore {
    pub fn new(flow_idle_timeout_secs: i64) -> Self {
        Self {
            sessions: DashMap::new(),
            packets: DashMap::new(),
            transport: DashMap::new(),
            encoding: DashMap::new(),
            content: DashMap::new(),
            files: DashMap::new(),
            files_by_hash: DashMap::new(),
            matches: DashMap::new(),
            flows: FlowTable::new(flow_idle_timeout_secs),
        }
    }

    // -----------------------------------------------------------------------
    // Sessions + ingestion
    // -----------------------------------------------------------------------

    pub fn open_session(&self, name: impl Into<String>, filter: Option<String>) -> SessionId {
        self.open_session_with_link(name, filter, LinkType::Ethernet)
    }

    pub fn open_session_with_link(
        &self,
        name: impl Into<String>,
        filter: Option<String>,
        link_type: LinkType,
    ) -> SessionId {
        let id = SessionId::new();
        let session = Session {
            id,
            name: name.into(),
            filter,
            link_type,
            state: SessionState::Open,
            opened_at: Utc::now(),
            start_time: None,
            end_time: None,
            packet_count: 0,
            out_of_order_packets: 0,
            last_frame: None,
        };
        tracing::info!(session = %id, name = %session.name, link = ?link_type, "session opened");
        self.sessions.insert(id, session);
        id
    }

    pub fn ingest_packet(
        &self,
        session: SessionId,
        frame_number: u64,
        timestamp: DateTime<Utc>,
        data: Vec<u8>,
    ) -> Result<PacketReceipt, IngestionError> {
        let size = data.len() as u32;
        self.ingest_frame(session, CapturedFrame { frame_number, timestamp, data, size })
    }

    /// Store one captured frame. The session entry stays locked for the
    /// duration, so duplicate detection and counters are atomic per session.
    pub fn ingest_frame(&self, session: SessionId, frame: CapturedFrame) -> Result<PacketReceipt, IngestionError> {
        let mut sess = self
            .sessions
            .get_mut(&session)
            .ok_or(IngestionError::UnknownSession { session })?;

        if sess.state != SessionState::Open {
            return Err(IngestionError::SessionClosed { session });
        }

        let id = PacketId { session, frame_number: frame.frame_number };
        match self.packets.entry(id) {
            Entry::Occupied(_) => {
                return Err(IngestionError::DuplicateFrame { session, frame_number: frame.frame_number });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Packet {
                    id,
                    timestamp: frame.timestamp,
                    size: frame.size,
                    data: frame.data,
                }));
            }
        }

        let warning = ordering_warning(&sess, frame.frame_number, frame.timestamp);
        if let Some(IngestWarning::OutOfOrderTimestamp { previous }) = warning {
            sess.out_of_order_packets += 1;
            tracing::warn!(
                %session,
                frame = frame.frame_number,
                timestamp = %frame.timestamp,
                previous = %previous,
                "out-of-order timestamp"
            );
        }

        sess.packet_count += 1;
        if sess.last_frame.map_or(true, |(n, _)| frame.frame_number > n) {
            sess.last_frame = Some((frame.frame_number, frame.timestamp));
        }
        if sess.start_time.map_or(true, |t| frame.timestamp < t) {
            sess.start_time = Some(frame.timestamp);
        }

        Ok(PacketReceipt { id, warning })
    }

    /// Finalize the packet count and end time. Further ingestion fails.
    pub fn close_session(&self, session: SessionId) -> Result<Session, IngestionError> {
        let mut sess = self
            .sessions
            .get_mut(&session)
            .ok_or(IngestionError::UnknownSession { session })?;
        if sess.state != SessionState::Open {
            return Err(IngestionError::SessionClosed { session });
        }

        let (count, end) = self
            .packets
            .iter()
            .filter(|p| p.key().session == session)
            .fold((0u64, None::<DateTime<Utc>>), |(n, end), p| {
                let ts = p.value().timestamp;
                (n + 1, Some(end.map_or(ts, |e| e.max(ts))))
            });
        sess.packet_count = count;
        sess.end_time = end;
        sess.state = SessionState::Closed;

        tracing::info!(%session, packets = count, out_of_order = sess.out_of_order_packets, "session closed");
        Ok(sess.clone())
    }

    /// Stop ingestion and signal running analysis to stop between stages.
    pub fn abort_session(&self, session: SessionId) -> Result<(), IngestionError> {
        let mut sess = self
            .sessions
            .get_mut(&session)
            .ok_or(IngestionError::UnknownSession { session })?;
        sess.state = SessionState::Aborted;
        tracing::warn!(%session, "session aborted");
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.opened_at);
        all
    }

    pub fn is_aborted(&self, id: SessionId) -> bool {
        self.sessions.get(&id).map_or(false, |s| s.state == SessionState::Aborted)
    }

    pub fn packet(&self, id: PacketId) -> Option<Arc<Packet>> {
        self.packets.get(&id).map(|p| Arc::clone(p.value()))
    }

    /// Packets of a session in frame order.
    pub fn packets(&self, session: SessionId) -> Vec<Arc<Packet>> {
        let mut packets = collect_session(&self.packets, session, |id| id.session);
        packets.sort_by_key(|p| p.id.frame_number);
        packets
    }

    // -----------------------------------------------------------------------
    // Layer records
    // -----------------------------------------------------------------------

    pub fn insert_transport(&self, record: TransportRecord) -> Result<Arc<TransportRecord>, IntegrityError> {
        if record.id.packet() != record.packet {
            return Err(IntegrityError::SessionMismatch {
                child: record.id.to_string(),
                child_session: record.id.session(),
                parent_session: record.packet.session,
            });
        }
        if !self.packets.contains_key(&record.packet) {
            return Err(IntegrityError::MissingParent {
                child: record.id.to_string(),
                parent: format!("packet {}", record.packet),
            });
        }
        Ok(insert_once(&self.transport, record.id, record))
    }

    pub fn insert_encoding(&self, record: EncodingRecord) -> Result<Arc<EncodingRecord>, IntegrityError> {
        check_parent(
            &record.id.to_string(),
            record.id.session(),
            record.transport.session(),
            self.transport.contains_key(&record.transport),
            || record.transport.to_string(),
        )?;
        Ok(insert_once(&self.encoding, record.id, record))
    }

    /// Insert a content record, creating or reusing the session's extracted
    /// file for its hash when `file` is given.
    pub fn insert_content(
        &self,
        mut record: ContentRecord,
        file: Option<FileCandidate>,
    ) -> Result<Arc<ContentRecord>, IntegrityError> {
        check_parent(
            &record.id.to_string(),
            record.id.session(),
            record.encoding.session(),
            self.encoding.contains_key(&record.encoding),
            || record.encoding.to_string(),
        )?;

        if let Some(existing) = self.content.get(&record.id) {
            return Ok(Arc::clone(existing.value()));
        }

        if let Some(candidate) = file {
            let (file_id, created) = self.link_file(&record, candidate);
            record.file = Some(file_id);
            record.is_extracted = true;
            tracing::debug!(content = %record.id, file = %file_id, created, "content linked to file");
        }

        Ok(insert_once(&self.content, record.id, record))
    }

    fn link_file(&self, record: &ContentRecord, candidate: FileCandidate) -> (FileId, bool) {
        let session = record.id.session();
        match self.files_by_hash.entry((session, record.content_hash.clone())) {
            Entry::Occupied(slot) => (*slot.get(), false),
            Entry::Vacant(slot) => {
                let id = FileId(derive_id(&[session.0.as_bytes(), record.content_hash.as_bytes()]));
                let file = ExtractedFile {
                    id,
                    session,
                    content_hash: record.content_hash.clone(),
                    md5: candidate.md5,
                    mime_type: candidate.mime_type,
                    name: candidate.name,
                    size_bytes: candidate.data.len() as u64,
                    source: record.id,
                    data: candidate.data,
                };
                self.files.insert(id, Arc::new(file));
                slot.insert(id);
                (id, true)
            }
        }
    }

    /// Matches are keyed by a digest of (rule, record, excerpt), so storing
    /// the same match twice keeps one copy.
    pub fn insert_match(&self, m: Match) -> Result<Arc<Match>, IntegrityError> {
        let exists = match m.record {
            RecordRef::Transport(id) => self.transport.contains_key(&id),
            RecordRef::Encoding(id) => self.encoding.contains_key(&id),
            RecordRef::Content(id) => self.content.contains_key(&id),
        };
        check_parent(
            &m.id.to_string(),
            m.session,
            m.record.packet().session,
            exists,
            || m.record.to_string(),
        )?;
        Ok(insert_once(&self.matches, m.id, m))
    }

    pub fn transport(&self, id: TransportId) -> Option<Arc<TransportRecord>> {
        self.transport.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn encoding(&self, id: EncodingId) -> Option<Arc<EncodingRecord>> {
        self.encoding.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn content(&self, id: ContentId) -> Option<Arc<ContentRecord>> {
        self.content.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn file(&self, id: FileId) -> Option<Arc<ExtractedFile>> {
        self.files.get(&id).map(|f| Arc::clone(f.value()))
    }

    pub fn file_by_hash(&self, session: SessionId, content_hash: &str) -> Option<Arc<ExtractedFile>> {
        let id = *self.files_by_hash.get(&(session, content_hash.to_string()))?;
        self.file(id)
    }

    pub fn transport_records(&self, session: SessionId) -> Vec<Arc<TransportRecord>> {
        let mut records = collect_session(&self.transport, session, |id| id.session());
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn encoding_records(&self, session: SessionId) -> Vec<Arc<EncodingRecord>> {
        let mut records = collect_session(&self.encoding, session, |id| id.session());
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn content_records(&self, session: SessionId) -> Vec<Arc<ContentRecord>> {
        let mut records = collect_session(&self.content, session, |id| id.session());
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn files(&self, session: SessionId) -> Vec<Arc<ExtractedFile>> {
        let mut files: Vec<Arc<ExtractedFile>> = self
            .files
            .iter()
            .filter(|f| f.value().session == session)
            .map(|f| Arc::clone(f.value()))
            .collect();
        files.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        files
    }

    pub fn matches(&self, session: SessionId) -> Vec<Arc<Match>> {
        let mut matches: Vec<Arc<Match>> = self
            .matches
            .iter()
            .filter(|m| m.value().session == session)
            .map(|m| Arc::clone(m.value()))
            .collect();
        matches.sort_by(|a, b| (a.record, &a.rule_id, a.id).cmp(&(b.record, &b.rule_id, b.id)));
        matches
    }

    /// Vulnerability tags of a content record, derived from the CONTENT
    /// matches recorded against it.
    pub fn vulnerability_tags(&self, id: ContentId) -> Vec<String> {
        let tags: BTreeSet<String> = self
            .matches
            .iter()
            .filter(|m| m.value().record == RecordRef::Content(id))
            .flat_map(|m| m.value().tags.clone())
            .collect();
        tags.into_iter().collect()
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }
}

fn ordering_warning(session: &Session, frame_number: u64, timestamp: DateTime<Utc>) -> Option<IngestWarning> {
    match session.last_frame {
        Some((last, previous)) if frame_number > last && timestamp < previous => {
            Some(IngestWarning::OutOfOrderTimestamp { previous })
        }
        _ => None,
    }
}

fn check_parent(
    child: &str,
    child_session: SessionId,
    parent_session: SessionId,
    parent_exists: bool,
    parent: impl FnOnce() -> String,
) -> Result<(), IntegrityError> {
    if child_session != parent_session {
        tracing::warn!(child, %child_session, %parent_session, "cross-session reference");
        return Err(IntegrityError::SessionMismatch {
            child: child.to_string(),
            child_session,
            parent_session,
        });
    }
    if !parent_exists {
        let parent = parent();
        tracing::warn!(child, parent = %parent, "orphaned record");
        return Err(IntegrityError::MissingParent { child: child.to_string(), parent });
    }
    Ok(())
}

/// Records are immutable: a second insert under the same id returns the
/// stored copy untouched.
fn insert_once<K, V>(map: &DashMap<K, Arc<V>>, key: K, value: V) -> Arc<V>
where
    K: std::hash::Hash + Eq,
{
    match map.entry(key) {
        Entry::Occupied(slot) => Arc::clone(slot.get()),
        Entry::Vacant(slot) => {
            let value = Arc::new(value);
            slot.insert(Arc::clone(&value));
            value
        }
    }
}

fn collect_session<K, V>(map: &DashMap<K, Arc<V>>, session: SessionId, session_of: impl Fn(&K) -> SessionId) -> Vec<Arc<V>>
where
    K: std::hash::Hash + Eq,
{
    map.iter()
        .filter(|e| session_of(e.key()) == session)
        .map(|e| Arc::clone(e.value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ts;

    fn store() -> CaptureStore {
        CaptureStore::new(120)
    }

    #[test]
    fn test_duplicate_frame_is_rejected() {
        let store = store();
        let s = store.open_session("dup", None);
        store.ingest_packet(s, 1, ts(0), vec![1, 2, 3]).unwrap();
        assert_eq!(
            store.ingest_packet(s, 1, ts(1), vec![4]),
            Err(IngestionError::DuplicateFrame { session: s, frame_number: 1 })
        );
        assert_eq!(store.session(s).unwrap().packet_count, 1);
    }

    #[test]
    fn test_same_frame_number_in_other_session_is_fine() {
        let store = store();
        let a = store.open_session("a", None);
        let b = store.open_session("b", Some("tcp port 80".into()));
        store.ingest_packet(a, 1, ts(0), vec![0]).unwrap();
        store.ingest_packet(b, 1, ts(0), vec![0]).unwrap();
        assert_eq!(store.session(b).unwrap().filter.as_deref(), Some("tcp port 80"));
    }

    #[test]
    fn test_out_of_order_timestamp_is_a_warning() {
        let store = store();
        let s = store.open_session("ooo", None);
        store.ingest_packet(s, 1, ts(10), vec![0]).unwrap();
        let receipt = store.ingest_packet(s, 2, ts(5), vec![0]).unwrap();
        assert_eq!(receipt.warning, Some(IngestWarning::OutOfOrderTimestamp { previous: ts(10) }));
        assert_eq!(store.session(s).unwrap().out_of_order_packets, 1);
    }

    #[test]
    fn test_close_finalizes_and_blocks_ingest() {
        let store = store();
        let s = store.open_session("close", None);
        store.ingest_packet(s, 2, ts(20), vec![0]).unwrap();
        store.ingest_packet(s, 1, ts(3), vec![0]).unwrap();
        let closed = store.close_session(s).unwrap();
        assert_eq!(closed.packet_count, 2);
        assert_eq!(closed.start_time, Some(ts(3)));
        assert_eq!(closed.end_time, Some(ts(20)));
        assert_eq!(
            store.ingest_packet(s, 3, ts(30), vec![0]),
            Err(IngestionError::SessionClosed { session: s })
        );
        assert_eq!(store.packets(s).iter().map(|p| p.id.frame_number).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_unknown_session() {
        let store = store();
        let ghost = SessionId::new();
        assert_eq!(
            store.ingest_packet(ghost, 1, ts(0), vec![]),
            Err(IngestionError::UnknownSession { session: ghost })
        );
    }

    #[test]
    fn test_orphan_transport_record_is_an_integrity_error() {
        let store = store();
        let s = store.open_session("orphan", None);
        let pkt = crate::testutil::packet_in(s, 9, &[0u8; 4]);
        let record = crate::transport::decode_or_degrade(&pkt, LinkType::Ethernet);
        assert!(matches!(
            store.insert_transport(record),
            Err(IntegrityError::MissingParent { .. })
        ));
    }

    #[test]
    fn test_parent_from_other_session_is_rejected() {
        let store = store();
        let a = store.open_session("a", None);
        let b = store.open_session("b", None);
        let frame = crate::testutil::tcp_frame(
            [10, 0, 0, 1],
            40000,
            [10, 0, 0, 2],
            80,
            crate::testutil::Tcp::psh_ack(1, 1),
            b"GET / HTTP/1.1\r\n\r\n",
        );
        store.ingest_packet(a, 1, ts(0), frame.clone()).unwrap();
        store.ingest_packet(b, 1, ts(0), frame).unwrap();

        let pkt_a = store.packet(PacketId { session: a, frame_number: 1 }).unwrap();
        let pkt_b = store.packet(PacketId { session: b, frame_number: 1 }).unwrap();
        let parent = store
            .insert_transport(crate::transport::decode_or_degrade(&pkt_a, LinkType::Ethernet))
            .unwrap();
        let own = crate::transport::decode_or_degrade(&pkt_b, LinkType::Ethernet);

        let mut record = crate::encoding::decode(
            &own,
            own.payload(&pkt_b),
            &crate::config::AnalysisConfig::default(),
        );
        assert_eq!(record.id.session(), b);
        record.transport = parent.id;

        assert_eq!(
            store.insert_encoding(record),
            Err(IntegrityError::SessionMismatch {
                child: EncodingId(pkt_b.id).to_string(),
                child_session: b,
                parent_session: a,
            })
        );
        assert!(store.encoding_records(a).is_empty());
        assert!(store.encoding_records(b).is_empty());
    }
}

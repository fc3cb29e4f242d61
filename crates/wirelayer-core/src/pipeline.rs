//! Orchestrates the layered decode for one closed session:
//! transport, flows, encoding, content, then rules.
//!
//! Every stage reads only what the previous stages stored and inserts
//! immutable records, so stages fan out over the worker pool and a second
//! run over the same session reproduces the same records and matches.

use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::error::{IngestionError, PipelineError, Result};
use crate::models::*;
use crate::rules::{LayerRecord, RuleEngine};
use crate::store::CaptureStore;
use crate::{content, encoding, transport};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub packets: usize,
    pub transport_records: usize,
    pub transport_errors: usize,
    pub flows: usize,
    pub encoding_records: usize,
    pub unknown_encodings: usize,
    pub content_records: usize,
    pub extracted_files: usize,
    pub matches: usize,
    pub rule_failures: usize,
    pub integrity_errors: usize,
    /// The session was aborted; later stages did not run.
    pub aborted: bool,
}

pub struct Pipeline {
    store: Arc<CaptureStore>,
    rules: RuleEngine,
    config: AnalysisConfig,
    pool: rayon::ThreadPool,
}

impl Pipeline {
    pub fn new(store: Arc<CaptureStore>, rules: Vec<Rule>, config: AnalysisConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("wirelayer-worker-{}", i))
            .build()?;
        let rules = RuleEngine::new(rules, &config);
        Ok(Self { store, rules, config, pool })
    }

    pub fn store(&self) -> &Arc<CaptureStore> {
        &self.store
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run every stage over a closed session.
    pub fn analyze_session(&self, session: SessionId) -> Result<PipelineSummary> {
        let sess = self
            .store
            .session(session)
            .ok_or(IngestionError::UnknownSession { session })?;

        match sess.state {
            SessionState::Open => return Err(PipelineError::SessionOpen { session }),
            SessionState::Aborted => {
                tracing::warn!(%session, "session aborted before analysis");
                return Ok(PipelineSummary { aborted: true, ..Default::default() });
            }
            SessionState::Closed => {}
        }

        let started = std::time::Instant::now();
        tracing::info!(%session, name = %sess.name, packets = sess.packet_count, "analysis started");

        let summary = self.pool.install(|| self.run(&sess));

        tracing::info!(
            %session,
            flows = summary.flows,
            encodings = summary.encoding_records,
            contents = summary.content_records,
            files = summary.extracted_files,
            matches = summary.matches,
            aborted = summary.aborted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );
        Ok(summary)
    }

    fn run(&self, sess: &Session) -> PipelineSummary {
        let session = sess.id;
        let mut summary = PipelineSummary::default();

        let packets = self.store.packets(session);
        summary.packets = packets.len();
        let (transport, failed) = self.transport_stage(sess, &packets);
        summary.transport_records = transport.len();
        summary.transport_errors = transport.iter().filter(|r| r.decode_error.is_some()).count();
        summary.integrity_errors += failed;
        if self.stop(session, "transport", &mut summary) {
            return summary;
        }

        let flows = self.store.flows();
        flows.reconstruct(session, &transport);
        if let Some(end) = sess.end_time {
            let expired = flows.expire_idle(session, end);
            tracing::debug!(%session, expired, "idle flows archived");
        }
        summary.flows = flows.flows(session).len();
        if self.stop(session, "flow", &mut summary) {
            return summary;
        }

        let (encodings, failed) = self.encoding_stage(&transport);
        summary.encoding_records = encodings.len();
        summary.unknown_encodings = encodings
            .iter()
            .filter(|r| r.encoding_type == EncodingType::Unknown)
            .count();
        summary.integrity_errors += failed;
        if self.stop(session, "encoding", &mut summary) {
            return summary;
        }

        let (contents, failed) = self.content_stage(&encodings);
        summary.content_records = contents.len();
        summary.extracted_files = self.store.files(session).len();
        summary.integrity_errors += failed;
        if self.stop(session, "content", &mut summary) {
            return summary;
        }

        let failed = self.rule_stage(session, &transport, &encodings, &contents, &mut summary);
        summary.integrity_errors += failed;
        summary.matches = self.store.matches(session).len();

        if summary.integrity_errors > 0 {
            tracing::warn!(%session, errors = summary.integrity_errors, "records excluded by integrity checks");
        }
        summary
    }

    fn stop(&self, session: SessionId, stage: &str, summary: &mut PipelineSummary) -> bool {
        if self.store.is_aborted(session) {
            tracing::warn!(%session, stage, "session aborted, stopping after stage");
            summary.aborted = true;
            return true;
        }
        false
    }

    fn transport_stage(&self, sess: &Session, packets: &[Arc<Packet>]) -> (Vec<Arc<TransportRecord>>, usize) {
        let results: Vec<_> = packets
            .par_iter()
            .map(|packet| {
                let record = transport::decode_or_degrade(packet, sess.link_type);
                self.store.insert_transport(record)
            })
            .collect();
        let out = split_results(results);
        tracing::info!(session = %sess.id, records = out.0.len(), "transport stage complete");
        out
    }

    fn encoding_stage(&self, transport: &[Arc<TransportRecord>]) -> (Vec<Arc<EncodingRecord>>, usize) {
        let results: Vec<_> = transport
            .par_iter()
            .filter_map(|record| {
                let packet = self.store.packet(record.packet)?;
                let decoded = encoding::decode(record, record.payload(&packet), &self.config);
                Some(self.store.insert_encoding(decoded))
            })
            .collect();
        let out = split_results(results);
        tracing::info!(records = out.0.len(), "encoding stage complete");
        out
    }

    fn content_stage(&self, encodings: &[Arc<EncodingRecord>]) -> (Vec<Arc<ContentRecord>>, usize) {
        let results: Vec<_> = encodings
            .par_iter()
            .filter_map(|record| content::decode(record))
            .map(|decoded| self.store.insert_content(decoded.record, decoded.file))
            .collect();
        let out = split_results(results);
        tracing::info!(records = out.0.len(), "content stage complete");
        out
    }

    fn rule_stage(
        &self,
        session: SessionId,
        transport: &[Arc<TransportRecord>],
        encodings: &[Arc<EncodingRecord>],
        contents: &[Arc<ContentRecord>],
        summary: &mut PipelineSummary,
    ) -> usize {
        let records: Vec<LayerRecord<'_>> = transport
            .iter()
            .map(|r| LayerRecord::Transport(r.as_ref()))
            .chain(encodings.iter().map(|r| LayerRecord::Encoding(r.as_ref())))
            .chain(contents.iter().map(|r| LayerRecord::Content(r.as_ref())))
            .collect();

        let (matches, failures) = self.rules.evaluate_all(&records);
        summary.rule_failures = failures;
        if failures > 0 {
            tracing::warn!(%session, failures, "unhealthy rules skipped evaluations");
        }

        let failed = matches
            .into_par_iter()
            .filter(|m| self.store.insert_match(m.clone()).is_err())
            .count();
        tracing::info!(%session, records = records.len(), "rule stage complete");
        failed
    }
}

/// Keep the stored records in id order; count integrity failures.
fn split_results<T, E>(results: Vec<std::result::Result<Arc<T>, E>>) -> (Vec<Arc<T>>, usize) {
    let mut ok = Vec::with_capacity(results.len());
    let mut failed = 0;
    for result in results {
        match result {
            Ok(record) => ok.push(record),
            Err(_) => failed += 1,
        }
    }
    (ok, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    const CLIENT: [u8; 4] = [192, 168, 1, 100];
    const SERVER: [u8; 4] = [93, 184, 216, 34];

    fn rule(id: &str, layer: Layer, pattern: &str, severity: Severity) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            target_layer: layer,
            condition: RuleCondition::Pattern { pattern: pattern.to_string(), case_insensitive: false },
            severity,
            enabled: true,
            tags: vec!["xss".to_string()],
        }
    }

    fn ingest(frames: &[Vec<u8>]) -> (Arc<CaptureStore>, SessionId) {
        let store = Arc::new(CaptureStore::new(120));
        let s = store.open_session("test", None);
        for (i, frame) in frames.iter().enumerate() {
            store.ingest_packet(s, i as u64 + 1, ts(i as i64), frame.clone()).unwrap();
        }
        store.close_session(s).unwrap();
        (store, s)
    }

    fn analyze(frames: &[Vec<u8>], rules: Vec<Rule>) -> (Pipeline, SessionId, PipelineSummary) {
        let (store, s) = ingest(frames);
        let config = AnalysisConfig { workers: 2, ..Default::default() };
        let pipeline = Pipeline::new(store, rules, config).unwrap();
        let summary = pipeline.analyze_session(s).unwrap();
        (pipeline, s, summary)
    }

    fn http_response(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_scenario_a_handshake_is_one_flow() {
        let frames = vec![
            tcp_frame(CLIENT, 54321, SERVER, 80, Tcp::syn(100), b""),
            tcp_frame(SERVER, 80, CLIENT, 54321, Tcp::syn_ack(500, 101), b""),
        ];
        let (pipeline, s, summary) = analyze(&frames, Vec::new());
        assert_eq!(summary.flows, 1);

        let flows = pipeline.store().flows().flows(s);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].packet_count, 2);
        assert_eq!(flows[0].state, FlowState::Established);
        assert!(flows[0].flags.syn && flows[0].flags.syn_ack);
        assert!(!flows[0].flags.midstream);
    }

    #[test]
    fn test_scenario_b_script_in_response_body() {
        let frames = vec![tcp_frame(
            SERVER,
            80,
            CLIENT,
            54321,
            Tcp::psh_ack(1, 1),
            &http_response("<html><script>alert(1)</script></html>"),
        )];
        let rules = vec![rule("xss", Layer::Content, "<script[^>]*>.*</script>", Severity::Critical)];
        let (pipeline, s, summary) = analyze(&frames, rules);

        assert_eq!(summary.matches, 1);
        let matches = pipeline.store().matches(s);
        assert_eq!(matches[0].severity, Severity::Critical);
        assert_eq!(matches[0].matched_data, "<script>alert(1)</script>");

        let RecordRef::Content(content_id) = matches[0].record else {
            panic!("expected a content match");
        };
        assert_eq!(pipeline.store().vulnerability_tags(content_id), vec!["xss".to_string()]);
    }

    #[test]
    fn test_scenario_c_same_body_two_flows_one_file() {
        let body = "{\"user\":\"admin\",\"id\":42}";
        let post = format!(
            "POST /api HTTP/1.1\r\nHost: api\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let frames = vec![
            tcp_frame(CLIENT, 50001, SERVER, 80, Tcp::psh_ack(1, 1), post.as_bytes()),
            tcp_frame(CLIENT, 50002, SERVER, 80, Tcp::psh_ack(1, 1), post.as_bytes()),
        ];
        let (pipeline, s, summary) = analyze(&frames, Vec::new());

        assert_eq!(summary.flows, 2);
        assert_eq!(summary.content_records, 2);
        assert_eq!(summary.extracted_files, 1);

        let contents = pipeline.store().content_records(s);
        assert!(contents.iter().all(|c| c.is_extracted));
        assert_eq!(contents[0].file, contents[1].file);
        let file = pipeline.store().file(contents[0].file.unwrap()).unwrap();
        assert_eq!(file.content_hash, contents[1].content_hash);
        assert_eq!(file.data, body.as_bytes());
    }

    #[test]
    fn test_scenario_d_fin_closes_and_reuse_starts_new_flow() {
        let frames = vec![
            tcp_frame(CLIENT, 54321, SERVER, 80, Tcp::syn(100), b""),
            tcp_frame(SERVER, 80, CLIENT, 54321, Tcp::syn_ack(500, 101), b""),
            tcp_frame(CLIENT, 54321, SERVER, 80, Tcp::fin_ack(101, 501), b""),
            tcp_frame(CLIENT, 54321, SERVER, 80, Tcp::syn(9000), b""),
        ];
        let (pipeline, s, summary) = analyze(&frames, Vec::new());
        assert_eq!(summary.flows, 2);

        let flows = pipeline.store().flows().flows(s);
        assert_eq!(flows[0].state, FlowState::Closed);
        assert_eq!(flows[0].end_time, Some(ts(2)));
        assert_eq!(flows[0].packet_count, 3);
        assert_eq!(flows[1].state, FlowState::Established);
        assert_eq!(flows[1].packet_count, 1);
        assert_ne!(flows[0].id, flows[1].id);
    }

    #[test]
    fn test_disabled_rule_produces_nothing() {
        let frames = vec![tcp_frame(
            SERVER,
            80,
            CLIENT,
            54321,
            Tcp::psh_ack(1, 1),
            &http_response("<script>x</script>"),
        )];
        let mut disabled = rule("xss", Layer::Content, "<script", Severity::High);
        disabled.enabled = false;
        let (_, _, summary) = analyze(&frames, vec![disabled]);
        assert_eq!(summary.matches, 0);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let frames = vec![
            tcp_frame(CLIENT, 54321, SERVER, 80, Tcp::syn(100), b""),
            tcp_frame(SERVER, 80, CLIENT, 54321, Tcp::psh_ack(1, 1), &http_response("<script>a</script>")),
            udp_frame(CLIENT, 5353, [8, 8, 8, 8], 53, &dns_query(3, "evil.example")),
        ];
        let rules = vec![
            rule("xss", Layer::Content, "<script", Severity::High),
            rule("dns", Layer::Encoding, "evil", Severity::Medium),
            rule("tcp", Layer::Transport, "TCP", Severity::Low),
        ];
        let (pipeline, s, first) = analyze(&frames, rules);
        let before = pipeline.store().matches(s);

        let second = pipeline.analyze_session(s).unwrap();
        let after = pipeline.store().matches(s);

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(first.matches, 4);
    }

    #[test]
    fn test_open_session_is_rejected() {
        let store = Arc::new(CaptureStore::new(120));
        let s = store.open_session("live", None);
        let pipeline = Pipeline::new(store, Vec::new(), AnalysisConfig::default()).unwrap();
        assert!(matches!(
            pipeline.analyze_session(s),
            Err(PipelineError::SessionOpen { session }) if session == s
        ));
    }

    #[test]
    fn test_aborted_session_stops_before_decoding() {
        let store = Arc::new(CaptureStore::new(120));
        let s = store.open_session("aborted", None);
        store
            .ingest_packet(s, 1, ts(0), tcp_frame(CLIENT, 1, SERVER, 2, Tcp::syn(1), b""))
            .unwrap();
        store.abort_session(s).unwrap();
        assert_eq!(
            store.ingest_packet(s, 2, ts(1), vec![0]),
            Err(IngestionError::SessionClosed { session: s })
        );

        let pipeline = Pipeline::new(store, Vec::new(), AnalysisConfig::default()).unwrap();
        let summary = pipeline.analyze_session(s).unwrap();
        assert!(summary.aborted);
        assert!(pipeline.store().transport_records(s).is_empty());
    }

    #[test]
    fn test_abort_during_analysis_leaves_complete_chains() {
        let frames = vec![
            tcp_frame(CLIENT, 40000, SERVER, 80, Tcp::syn(1), b""),
            tcp_frame(CLIENT, 40000, SERVER, 80, Tcp::psh_ack(2, 1), b"GET /?q=<script> HTTP/1.1\r\n\r\n"),
        ];
        let (store, s) = ingest(&frames);
        let sess = store.session(s).unwrap();
        let rules = vec![rule("xss", Layer::Encoding, "<script>", Severity::High)];
        let pipeline = Pipeline::new(Arc::clone(&store), rules, AnalysisConfig::default()).unwrap();

        // Abort lands once the run is underway: analyze_session already saw a closed session.
        store.abort_session(s).unwrap();
        let summary = pipeline.run(&sess);

        assert!(summary.aborted);
        assert_eq!(summary.transport_records, 2);
        assert_eq!(summary.encoding_records, 0);
        assert_eq!(summary.matches, 0);
        assert_eq!(summary.integrity_errors, 0);

        for record in store.transport_records(s) {
            assert!(store.packet(record.packet).is_some());
        }
        assert!(store.flows().flows(s).is_empty());
        assert!(store.encoding_records(s).is_empty());
        assert!(store.content_records(s).is_empty());
        assert!(store.matches(s).is_empty());
    }

    #[test]
    fn test_undecodable_frames_still_reach_every_layer() {
        let frames = vec![vec![0xffu8; 10]];
        let (pipeline, s, summary) = analyze(&frames, Vec::new());
        assert_eq!(summary.transport_errors, 1);
        assert_eq!(summary.flows, 0);
        assert_eq!(summary.unknown_encodings, 1);
        let enc = pipeline.store().encoding_records(s);
        assert!(!enc[0].encoding_errors.is_empty());
    }
}

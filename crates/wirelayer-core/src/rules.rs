//! Rule engine: evaluates declarative rules against layer records.
//!
//! Rules are compiled once. A rule whose pattern does not compile is kept
//! and reported as unhealthy; its evaluations fail with
//! [`RuleEvaluationError::Unhealthy`] while every other rule keeps running.
//! Evaluation is a pure function of `(rule, record)`, so records can be
//! sharded across workers in any order.

use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use rayon::prelude::*;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::encoding::tls;
use crate::error::RuleEvaluationError;
use crate::models::*;

const DEFAULT_RULES: &str = include_str!("../../../rules/default.json");

pub fn default_rules() -> anyhow::Result<Vec<Rule>> {
    serde_json::from_str(DEFAULT_RULES).context("bundled rule pack is invalid")
}

pub fn load_rules(path: &Path) -> anyhow::Result<Vec<Rule>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read rules {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid rules file {}", path.display()))
}

/// A record of any layer, borrowed for evaluation.
#[derive(Debug, Clone, Copy)]
pub enum LayerRecord<'a> {
    Transport(&'a TransportRecord),
    Encoding(&'a EncodingRecord),
    Content(&'a ContentRecord),
}

impl LayerRecord<'_> {
    pub fn layer(&self) -> Layer {
        self.record_ref().layer()
    }

    pub fn record_ref(&self) -> RecordRef {
        match self {
            Self::Transport(r) => RecordRef::Transport(r.id),
            Self::Encoding(r) => RecordRef::Encoding(r.id),
            Self::Content(r) => RecordRef::Content(r.id),
        }
    }

    pub fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        match self {
            Self::Transport(r) => r.timestamp,
            Self::Encoding(r) => r.timestamp,
            Self::Content(r) => r.timestamp,
        }
    }

    /// The text a pattern rule is applied to.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Self::Transport(r) => Cow::Owned(r.summary()),
            Self::Encoding(r) => Cow::Owned(r.match_text()),
            Self::Content(r) => match &r.text {
                Some(text) => Cow::Borrowed(text.as_str()),
                None => Cow::Owned(r.match_text()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RuleHealth {
    Healthy,
    Unhealthy(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub id: String,
    pub name: String,
    pub target_layer: Layer,
    pub enabled: bool,
    pub health: RuleHealth,
}

enum Matcher {
    Pattern(Regex),
    Predicate(Predicate),
    Broken(String),
}

pub struct CompiledRule {
    rule: Rule,
    matcher: Matcher,
}

impl CompiledRule {
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn health(&self) -> RuleHealth {
        match &self.matcher {
            Matcher::Broken(reason) => RuleHealth::Unhealthy(reason.clone()),
            _ => RuleHealth::Healthy,
        }
    }

    /// Evaluate against one record. Disabled rules and records of another
    /// layer never match.
    pub fn evaluate(&self, record: LayerRecord<'_>, max_excerpt_chars: usize) -> Result<Option<Match>, RuleEvaluationError> {
        if !self.rule.enabled || record.layer() != self.rule.target_layer {
            return Ok(None);
        }

        let hit = match &self.matcher {
            Matcher::Broken(reason) => {
                return Err(RuleEvaluationError::Unhealthy {
                    rule_id: self.rule.id.clone(),
                    reason: reason.clone(),
                })
            }
            Matcher::Pattern(re) => re.find(&record.text()).map(|m| m.as_str().to_string()),
            Matcher::Predicate(predicate) => check_predicate(predicate, record),
        };

        Ok(hit.map(|data| self.to_match(record, excerpt(&data, max_excerpt_chars))))
    }

    fn to_match(&self, record: LayerRecord<'_>, matched_data: String) -> Match {
        let record_ref = record.record_ref();
        let id = MatchId(derive_id(&[
            self.rule.id.as_bytes(),
            record_ref.to_string().as_bytes(),
            matched_data.as_bytes(),
        ]));
        Match {
            id,
            rule_id: self.rule.id.clone(),
            rule_name: self.rule.name.clone(),
            session: record_ref.packet().session,
            record: record_ref,
            severity: self.rule.severity,
            matched_data,
            tags: self.rule.tags.clone(),
            timestamp: record.timestamp(),
        }
    }
}

pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    max_excerpt_chars: usize,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, config: &AnalysisConfig) -> Self {
        let mut seen = HashSet::new();
        let rules: Vec<CompiledRule> = rules
            .into_iter()
            .map(|rule| {
                let matcher = if !seen.insert(rule.id.clone()) {
                    Matcher::Broken("duplicate rule id".to_string())
                } else {
                    compile(&rule, config.regex_size_limit)
                };
                if let Matcher::Broken(reason) = &matcher {
                    tracing::warn!(rule = %rule.id, reason = %reason, "rule marked unhealthy");
                }
                CompiledRule { rule, matcher }
            })
            .collect();

        tracing::info!(
            rules = rules.len(),
            enabled = rules.iter().filter(|r| r.rule.enabled).count(),
            unhealthy = rules.iter().filter(|r| matches!(r.matcher, Matcher::Broken(_))).count(),
            "rule set compiled"
        );

        Self {
            rules,
            max_excerpt_chars: config.max_excerpt_chars,
        }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn health(&self) -> Vec<RuleStatus> {
        self.rules
            .iter()
            .map(|c| RuleStatus {
                id: c.rule.id.clone(),
                name: c.rule.name.clone(),
                target_layer: c.rule.target_layer,
                enabled: c.rule.enabled,
                health: c.health(),
            })
            .collect()
    }

    pub fn evaluate(&self, rule: &CompiledRule, record: LayerRecord<'_>) -> Result<Option<Match>, RuleEvaluationError> {
        rule.evaluate(record, self.max_excerpt_chars)
    }

    /// All enabled rules targeting the record's layer.
    pub fn evaluate_record(&self, record: LayerRecord<'_>) -> (Vec<Match>, Vec<RuleEvaluationError>) {
        let mut matches = Vec::new();
        let mut errors = Vec::new();
        for rule in self.rules.iter().filter(|r| r.rule.enabled && r.rule.target_layer == record.layer()) {
            match rule.evaluate(record, self.max_excerpt_chars) {
                Ok(Some(m)) => matches.push(m),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        (matches, errors)
    }

    /// Evaluate every record in parallel. Returns the matches and the number
    /// of failed evaluations (unhealthy rules).
    pub fn evaluate_all(&self, records: &[LayerRecord<'_>]) -> (Vec<Match>, usize) {
        let (mut matches, failures) = records
            .par_iter()
            .map(|record| {
                let (matches, errors) = self.evaluate_record(*record);
                (matches, errors.len())
            })
            .reduce(
                || (Vec::new(), 0),
                |(mut a, ea), (b, eb)| {
                    a.extend(b);
                    (a, ea + eb)
                },
            );
        matches.sort_by(|a, b| (a.record, &a.rule_id, a.id).cmp(&(b.record, &b.rule_id, b.id)));
        (matches, failures)
    }
}

fn compile(rule: &Rule, size_limit: usize) -> Matcher {
    match &rule.condition {
        RuleCondition::Pattern { pattern, case_insensitive } => {
            match RegexBuilder::new(pattern)
                .case_insensitive(*case_insensitive)
                .size_limit(size_limit)
                .build()
            {
                Ok(re) => Matcher::Pattern(re),
                Err(e) => Matcher::Broken(
                    RuleEvaluationError::InvalidPattern {
                        rule_id: rule.id.clone(),
                        reason: e.to_string(),
                    }
                    .to_string(),
                ),
            }
        }
        RuleCondition::Predicate { predicate } => Matcher::Predicate(predicate.clone()),
    }
}

fn check_predicate(predicate: &Predicate, record: LayerRecord<'_>) -> Option<String> {
    match (predicate, record) {
        (Predicate::LargeTransfer { min_bytes }, record) => {
            let size = match record {
                LayerRecord::Transport(r) => r.payload_size as u64,
                LayerRecord::Encoding(r) => r.body().len() as u64,
                LayerRecord::Content(r) => r.size_bytes,
            };
            (size > *min_bytes).then(|| format!("size={} bytes", size))
        }
        (Predicate::WeakTls, LayerRecord::Encoding(r)) => {
            let version = r.version.as_deref()?;
            (r.encoding_type == EncodingType::Tls && tls::is_weak_version(version)).then(|| version.to_string())
        }
        (Predicate::EncryptedPayload, LayerRecord::Encoding(r)) => {
            r.encryption_detected
                .then(|| format!("{} entropy={:.2}", r.encoding_type, r.entropy))
        }
        (Predicate::DecodeErrors, LayerRecord::Transport(r)) => r.decode_error.map(|e| e.to_string()),
        (Predicate::DecodeErrors, LayerRecord::Encoding(r)) => {
            (!r.encoding_errors.is_empty()).then(|| r.encoding_errors.join("; "))
        }
        (Predicate::ExtractedFile, LayerRecord::Content(r)) => r.file.map(|f| f.to_string()),
        _ => None,
    }
}

/// Truncate to `max` characters on a char boundary.
fn excerpt(data: &str, max: usize) -> String {
    match data.char_indices().nth(max) {
        Some((idx, _)) => data[..idx].to_string(),
        None => data.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::transport::decode_packet;

    fn pattern_rule(id: &str, layer: Layer, pattern: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: None,
            target_layer: layer,
            condition: RuleCondition::Pattern { pattern: pattern.to_string(), case_insensitive: false },
            severity: Severity::High,
            enabled: true,
            tags: vec!["xss".to_string()],
        }
    }

    fn predicate_rule(id: &str, layer: Layer, predicate: Predicate) -> Rule {
        Rule {
            condition: RuleCondition::Predicate { predicate },
            severity: Severity::Medium,
            tags: Vec::new(),
            ..pattern_rule(id, layer, "")
        }
    }

    fn content(text: &str) -> ContentRecord {
        let packet = packet(4, b"");
        ContentRecord {
            id: ContentId(packet.id),
            encoding: EncodingId(packet.id),
            timestamp: packet.timestamp,
            content_type: "text/html".to_string(),
            text: Some(text.to_string()),
            binary: None,
            content_hash: String::new(),
            size_bytes: text.len() as u64,
            is_extracted: false,
            file: None,
        }
    }

    #[test]
    fn test_pattern_match_on_content() {
        let engine = RuleEngine::new(
            vec![pattern_rule("xss", Layer::Content, r"<script[^>]*>.*</script>")],
            &AnalysisConfig::default(),
        );
        let record = content("<p>hi</p><script>alert(1)</script>");
        let (matches, errors) = engine.evaluate_record(LayerRecord::Content(&record));
        assert!(errors.is_empty());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_data, "<script>alert(1)</script>");
        assert_eq!(matches[0].severity, Severity::High);
        assert_eq!(matches[0].tags, vec!["xss".to_string()]);
        assert_eq!(matches[0].timestamp, record.timestamp);
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut rule = pattern_rule("xss", Layer::Content, "<script");
        rule.enabled = false;
        let engine = RuleEngine::new(vec![rule], &AnalysisConfig::default());
        let record = content("<script>");
        let compiled = &engine.rules()[0];
        assert_eq!(engine.evaluate(compiled, LayerRecord::Content(&record)), Ok(None));
    }

    #[test]
    fn test_bad_pattern_is_isolated_and_reported() {
        let engine = RuleEngine::new(
            vec![
                pattern_rule("broken", Layer::Content, "(unclosed"),
                pattern_rule("ok", Layer::Content, "alert"),
            ],
            &AnalysisConfig::default(),
        );
        let record = content("alert(1)");
        let (matches, errors) = engine.evaluate_record(LayerRecord::Content(&record));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, "ok");
        assert!(matches!(&errors[..], [RuleEvaluationError::Unhealthy { rule_id, .. }] if rule_id == "broken"));

        let health = engine.health();
        assert!(matches!(health[0].health, RuleHealth::Unhealthy(_)));
        assert_eq!(health[1].health, RuleHealth::Healthy);
    }

    #[test]
    fn test_large_transfer_predicate_on_transport() {
        let frame = tcp_frame([10, 0, 0, 1], 5000, [10, 0, 0, 2], 443, Tcp::psh_ack(1, 1), &[0u8; 1500]);
        let pkt = packet(1, &frame);
        let transport = decode_packet(&pkt, LinkType::Ethernet).unwrap();
        let engine = RuleEngine::new(
            vec![
                predicate_rule("big", Layer::Transport, Predicate::LargeTransfer { min_bytes: 1000 }),
                predicate_rule("huge", Layer::Transport, Predicate::LargeTransfer { min_bytes: 10_000 }),
            ],
            &AnalysisConfig::default(),
        );
        let (matches, _) = engine.evaluate_record(LayerRecord::Transport(&transport));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, "big");
        assert_eq!(matches[0].matched_data, "size=1500 bytes");
    }

    #[test]
    fn test_weak_tls_predicate() {
        let frame = tcp_frame([10, 0, 0, 1], 5001, [10, 0, 0, 2], 443, Tcp::psh_ack(1, 1), &tls_client_hello("old.example", 0x0301));
        let pkt = packet(1, &frame);
        let transport = decode_packet(&pkt, LinkType::Ethernet).unwrap();
        let enc = crate::encoding::decode(&transport, transport.payload(&pkt), &AnalysisConfig::default());
        let engine = RuleEngine::new(
            vec![predicate_rule("weak-tls", Layer::Encoding, Predicate::WeakTls)],
            &AnalysisConfig::default(),
        );
        let (matches, _) = engine.evaluate_record(LayerRecord::Encoding(&enc));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_data, "TLS 1.0");
    }

    #[test]
    fn test_rule_only_sees_its_layer() {
        let engine = RuleEngine::new(
            vec![pattern_rule("tcp", Layer::Transport, "TCP")],
            &AnalysisConfig::default(),
        );
        let record = content("TCP TCP TCP");
        let (matches, _) = engine.evaluate_record(LayerRecord::Content(&record));
        assert!(matches.is_empty());
    }

    #[test]
    fn test_evaluation_is_idempotent_and_order_free() {
        let rules = vec![
            pattern_rule("a", Layer::Content, "alert"),
            pattern_rule("b", Layer::Content, "script"),
        ];
        let mut reversed = rules.clone();
        reversed.reverse();
        let record = content("<script>alert(1)</script>");
        let records = [LayerRecord::Content(&record)];

        let first = RuleEngine::new(rules, &AnalysisConfig::default()).evaluate_all(&records);
        let second = RuleEngine::new(reversed, &AnalysisConfig::default()).evaluate_all(&records);
        assert_eq!(first, second);
        assert_eq!(first.0.len(), 2);
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("abc", 10), "abc");
    }

    #[test]
    fn test_default_rule_pack_parses_and_compiles() {
        let rules = default_rules().unwrap();
        assert!(rules.len() >= 5);
        let engine = RuleEngine::new(rules, &AnalysisConfig::default());
        assert!(engine.health().iter().all(|s| s.health == RuleHealth::Healthy));
    }
}

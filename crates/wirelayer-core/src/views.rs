//! Read-only aggregate views, recomputed from the store on every call.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::*;
use crate::store::CaptureStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub session: String,
    pub flow_id: String,
    pub protocol: String,
    pub endpoint_a: String,
    pub endpoint_b: String,
    pub state: String,
    pub packets: u64,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub total_bytes: u64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub session: String,
    pub session_name: String,
    pub match_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub layer: Layer,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub matched_data: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStat {
    pub session: String,
    pub layer: Layer,
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
}

pub fn flow_summary(store: &CaptureStore, session: SessionId) -> Vec<FlowSummary> {
    store
        .flows()
        .flows(session)
        .into_iter()
        .map(|flow| FlowSummary {
            session: session.to_string(),
            flow_id: flow.id.to_string(),
            protocol: flow.key.protocol.label().to_string(),
            endpoint_a: flow.key.first.to_string(),
            endpoint_b: flow.key.second.to_string(),
            state: state_label(flow.state).to_string(),
            packets: flow.packet_count,
            bytes_a_to_b: flow.bytes_sent,
            bytes_b_to_a: flow.bytes_received,
            total_bytes: flow.bytes_sent + flow.bytes_received,
            duration_ms: flow.duration_ms(),
        })
        .collect()
}

/// Matches at or above `min_severity`, most severe first, joined to the
/// session and the packet's endpoints.
pub fn alerts(store: &CaptureStore, session: SessionId, min_severity: Severity) -> Vec<Alert> {
    let Some(sess) = store.session(session) else {
        return Vec::new();
    };

    let mut alerts: Vec<Alert> = store
        .matches(session)
        .into_iter()
        .filter(|m| m.severity >= min_severity)
        .map(|m| {
            let transport = store.transport(TransportId(m.record.packet()));
            let endpoint = |ip: Option<std::net::IpAddr>, port: u16| ip.map(|ip| Endpoint { ip, port }.to_string());
            Alert {
                session: session.to_string(),
                session_name: sess.name.clone(),
                match_id: m.id.to_string(),
                rule_id: m.rule_id.clone(),
                rule_name: m.rule_name.clone(),
                severity: m.severity,
                layer: m.record.layer(),
                src: transport.as_ref().and_then(|t| endpoint(t.src_ip, t.src_port)),
                dst: transport.as_ref().and_then(|t| endpoint(t.dst_ip, t.dst_port)),
                matched_data: m.matched_data.clone(),
                timestamp: m.timestamp,
            }
        })
        .collect();

    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.match_id.cmp(&b.match_id))
    });
    alerts
}

pub fn high_severity_alerts(store: &CaptureStore, session: SessionId) -> Vec<Alert> {
    alerts(store, session, Severity::High)
}

/// Packet and wire-byte counts per transport protocol and per encoding type.
pub fn protocol_distribution(store: &CaptureStore, session: SessionId) -> Vec<ProtocolStat> {
    let mut counts: BTreeMap<(Layer, String), (u64, u64)> = BTreeMap::new();
    let packet_size = |id: PacketId| store.packet(id).map_or(0, |p| p.size as u64);

    for record in store.transport_records(session) {
        let entry = counts
            .entry((Layer::Transport, record.protocol.label().to_string()))
            .or_default();
        entry.0 += 1;
        entry.1 += packet_size(record.packet);
    }
    for record in store.encoding_records(session) {
        let entry = counts
            .entry((Layer::Encoding, record.encoding_type.label().to_string()))
            .or_default();
        entry.0 += 1;
        entry.1 += packet_size(record.id.packet());
    }

    counts
        .into_iter()
        .map(|((layer, protocol), (packets, bytes))| ProtocolStat {
            session: session.to_string(),
            layer,
            protocol,
            packets,
            bytes,
        })
        .collect()
}

pub(crate) fn state_label(state: FlowState) -> &'static str {
    match state {
        FlowState::Established => "ESTABLISHED",
        FlowState::Completed => "COMPLETED",
        FlowState::Closed => "CLOSED",
    }
}

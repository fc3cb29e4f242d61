use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rayon::prelude::*;

use crate::models::*;

/// Keyed flow store.
///
/// Live flows sit in `active`, one per canonical tuple; the dashmap entry
/// lock serializes every read-modify-write on a key while distinct keys
/// update concurrently. Closed and expired flows move to `finished` and
/// never change again.
pub struct FlowTable {
    active: DashMap<FlowKey, Flow>,
    finished: DashMap<FlowId, Flow>,
    reconstructed: DashMap<SessionId, ()>,
    idle_timeout: Duration,
}

impl FlowTable {
    pub fn new(idle_timeout_secs: i64) -> Self {
        Self {
            active: DashMap::new(),
            finished: DashMap::new(),
            reconstructed: DashMap::new(),
            idle_timeout: Duration::seconds(idle_timeout_secs),
        }
    }

    /// Apply one transport record. Returns the flow it was counted in, or
    /// `None` for records without usable addressing.
    pub fn observe(&self, record: &TransportRecord) -> Option<FlowId> {
        let key = key_of(record)?;
        let from_first = record.src_ip == Some(key.first.ip) && record.src_port == key.first.port;

        match self.active.entry(key) {
            Entry::Occupied(mut slot) => {
                let idle = !key.protocol.is_stateful()
                    && record.timestamp.signed_duration_since(slot.get().last_seen) > self.idle_timeout;

                if idle {
                    let mut expired = slot.insert(new_flow(key, record));
                    expired.end_time = Some(expired.last_seen);
                    tracing::debug!(flow = %expired.id, "flow idle, starting a new one");
                    self.finished.insert(expired.id, expired);
                }

                let flow = slot.get_mut();
                update_flow(flow, record, from_first);
                let id = flow.id;

                if flow.state == FlowState::Closed {
                    let closed = slot.remove();
                    self.finished.insert(closed.id, closed);
                }
                Some(id)
            }
            Entry::Vacant(slot) => {
                let mut flow = new_flow(key, record);
                update_flow(&mut flow, record, from_first);
                let id = flow.id;

                if flow.state == FlowState::Closed {
                    self.finished.insert(id, flow);
                } else {
                    slot.insert(flow);
                }
                Some(id)
            }
        }
    }

    /// Build the flows of a session from its transport records.
    ///
    /// Records are applied in `frame_number` order per tuple regardless of
    /// timestamps, so the outcome is deterministic. Distinct tuples run in
    /// parallel. A session is only reconstructed once.
    pub fn reconstruct(&self, session: SessionId, records: &[Arc<TransportRecord>]) -> usize {
        if self.reconstructed.insert(session, ()).is_some() {
            tracing::debug!(%session, "flows already reconstructed");
            return 0;
        }

        let mut ordered: Vec<&Arc<TransportRecord>> = records
            .iter()
            .filter(|r| r.packet.session == session)
            .collect();
        ordered.sort_by_key(|r| r.packet.frame_number);

        let mut groups: HashMap<Option<FlowKey>, Vec<&TransportRecord>> = HashMap::new();
        for record in ordered {
            groups.entry(key_of(record)).or_default().push(record.as_ref());
        }
        groups.remove(&None);

        groups.into_par_iter().for_each(|(_, records)| {
            for record in records {
                self.observe(record);
            }
        });

        let count = self.flows(session).len();
        tracing::info!(%session, flows = count, "flow reconstruction complete");
        count
    }

    /// Archive non-TCP flows of `session` idle since before `now - timeout`.
    pub fn expire_idle(&self, session: SessionId, now: DateTime<Utc>) -> usize {
        let stale: Vec<FlowKey> = self
            .active
            .iter()
            .filter(|entry| {
                let flow = entry.value();
                flow.key.session == session
                    && !flow.key.protocol.is_stateful()
                    && now.signed_duration_since(flow.last_seen) > self.idle_timeout
            })
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for key in stale {
            // Re-check under the entry lock; a packet may have arrived meanwhile.
            if let Some((_, mut flow)) = self
                .active
                .remove_if(&key, |_, f| now.signed_duration_since(f.last_seen) > self.idle_timeout)
            {
                flow.end_time = Some(flow.last_seen);
                self.finished.insert(flow.id, flow);
                expired += 1;
            }
        }
        expired
    }

    /// All flows of a session, live and finished, ordered by first frame.
    pub fn flows(&self, session: SessionId) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self
            .active
            .iter()
            .filter(|e| e.value().key.session == session)
            .map(|e| e.value().clone())
            .collect();
        flows.extend(
            self.finished
                .iter()
                .filter(|e| e.value().key.session == session)
                .map(|e| e.value().clone()),
        );
        flows.sort_by_key(|f| (f.first_frame, f.id));
        flows
    }

    pub fn get(&self, id: FlowId) -> Option<Flow> {
        if let Some(flow) = self.finished.get(&id) {
            return Some(flow.clone());
        }
        self.active.iter().find(|e| e.value().id == id).map(|e| e.value().clone())
    }

    /// The live flow for a tuple, if any.
    pub fn active(&self, key: &FlowKey) -> Option<Flow> {
        self.active.get(key).map(|f| f.clone())
    }
}

fn key_of(record: &TransportRecord) -> Option<FlowKey> {
    if record.decode_error.is_some() {
        return None;
    }
    let src = Endpoint { ip: record.src_ip?, port: record.src_port };
    let dst = Endpoint { ip: record.dst_ip?, port: record.dst_port };
    Some(FlowKey::canonical(record.packet.session, record.protocol, src, dst))
}

fn new_flow(key: FlowKey, record: &TransportRecord) -> Flow {
    let id = FlowId(derive_id(&[
        key.session.0.as_bytes(),
        key.protocol.label().as_bytes(),
        key.first.to_string().as_bytes(),
        key.second.to_string().as_bytes(),
        &record.packet.frame_number.to_be_bytes(),
    ]));

    let state = if key.protocol.is_stateful() {
        FlowState::Established
    } else {
        FlowState::Completed
    };

    let midstream = key.protocol.is_stateful()
        && !record.tcp_flags.map(|f| f.syn).unwrap_or(false);

    Flow {
        id,
        key,
        state,
        start_time: record.timestamp,
        end_time: None,
        last_seen: record.timestamp,
        first_frame: record.packet.frame_number,
        last_frame: record.packet.frame_number,
        packet_count: 0,
        bytes_sent: 0,
        bytes_received: 0,
        flags: FlowFlags { midstream, ..FlowFlags::default() },
    }
}

fn update_flow(flow: &mut Flow, record: &TransportRecord, from_first: bool) {
    flow.packet_count += 1;
    if from_first {
        flow.bytes_sent += record.payload_size as u64;
    } else {
        flow.bytes_received += record.payload_size as u64;
    }

    // Timestamps are not guaranteed sorted; keep the window covering all.
    if record.timestamp < flow.start_time {
        flow.start_time = record.timestamp;
    }
    if record.timestamp > flow.last_seen {
        flow.last_seen = record.timestamp;
    }
    flow.last_frame = flow.last_frame.max(record.packet.frame_number);

    if let Some(flags) = record.tcp_flags {
        if flags.is_syn_only() {
            flow.flags.syn = true;
        }
        if flags.is_syn_ack() {
            flow.flags.syn_ack = true;
        }
        flow.flags.fin |= flags.fin;
        flow.flags.rst |= flags.rst;

        if flags.terminates() {
            flow.state = FlowState::Closed;
            flow.end_time = Some(record.timestamp);
        }
    }
}

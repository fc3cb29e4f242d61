use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportDecodeError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d0c_3a51_9b7e_4f0a_a2c4_51e8_07b3_d91f);

/// Stable UUIDv5 over the given key parts. Equal keys always yield equal ids,
/// which keeps re-runs of the pipeline idempotent.
pub(crate) fn derive_id(parts: &[&[u8]]) -> Uuid {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        buf.extend_from_slice(part);
        buf.push(0x1f);
    }
    Uuid::new_v5(&ID_NAMESPACE, &buf)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0.as_simple())
    }
}

/// Natural key of a captured frame: unique per session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId {
    pub session: SessionId,
    pub frame_number: u64,
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.frame_number)
    }
}

macro_rules! layer_id {
    ($name:ident, $prefix:literal) => {
        /// Layer record id. Layers are one-to-one down the chain, so the id
        /// wraps the originating packet's key.
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub PacketId);

        impl $name {
            pub fn packet(&self) -> PacketId {
                self.0
            }

            pub fn session(&self) -> SessionId {
                self.0.session
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", $prefix, self.0)
            }
        }
    };
}

layer_id!(TransportId, "TR");
layer_id!(EncodingId, "EN");
layer_id!(ContentId, "CT");

macro_rules! uuid_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0.as_simple())
            }
        }
    };
}

uuid_id!(FlowId, "FL");
uuid_id!(FileId, "AR");
uuid_id!(MatchId, "M");

// ---------------------------------------------------------------------------
// Session + packets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Ethernet,
    RawIp,
    LinuxSll,
    Null,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub filter: Option<String>,
    pub link_type: LinkType,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub packet_count: u64,
    pub out_of_order_packets: u64,
    /// Timestamp of the highest frame number seen so far.
    pub(crate) last_frame: Option<(u64, DateTime<Utc>)>,
}

/// One frame as handed over by the capture collaborator.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    /// Original on-the-wire length; may exceed `data.len()` when truncated.
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,
    pub timestamp: DateTime<Utc>,
    pub size: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestWarning {
    /// The frame's timestamp precedes a frame with a lower number.
    OutOfOrderTimestamp { previous: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReceipt {
    pub id: PacketId,
    pub warning: Option<IngestWarning>,
}

// ---------------------------------------------------------------------------
// Transport layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl TransportProtocol {
    pub fn is_stateful(&self) -> bool {
        matches!(self, Self::Tcp)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Other(_) => "OTHER",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn is_syn_only(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    pub fn terminates(&self) -> bool {
        self.fin || self.rst
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.urg, "URG"),
            (self.ece, "ECE"),
            (self.cwr, "CWR"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        f.write_str(&set.join(","))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportRecord {
    pub id: TransportId,
    pub packet: PacketId,
    pub timestamp: DateTime<Utc>,
    pub protocol: TransportProtocol,
    pub ip_version: Option<u8>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: Option<u8>,
    pub tcp_flags: Option<TcpFlags>,
    pub tcp_seq: Option<u32>,
    pub tcp_ack: Option<u32>,
    pub tcp_window: Option<u16>,
    /// Offset of the L4 payload inside the captured frame.
    pub payload_offset: usize,
    pub payload_size: u32,
    /// Advisory only; `None` when not computed.
    pub checksum_valid: Option<bool>,
    pub decode_error: Option<TransportDecodeError>,
}

impl TransportRecord {
    /// Slice this record's L4 payload out of its packet.
    pub fn payload<'a>(&self, packet: &'a Packet) -> &'a [u8] {
        let end = self.payload_offset.saturating_add(self.payload_size as usize);
        packet.data.get(self.payload_offset..end).unwrap_or(&[])
    }

    /// One-line header/flag rendering used for TRANSPORT rule matching.
    pub fn summary(&self) -> String {
        let endpoint = |ip: Option<IpAddr>, port: u16| match ip {
            Some(ip) => format!("{}:{}", ip, port),
            None => "?".to_string(),
        };
        let mut line = format!(
            "{} {} -> {}",
            self.protocol,
            endpoint(self.src_ip, self.src_port),
            endpoint(self.dst_ip, self.dst_port),
        );
        if let Some(flags) = self.tcp_flags {
            line.push_str(&format!(" flags=[{}]", flags));
        }
        if let Some(seq) = self.tcp_seq {
            line.push_str(&format!(" seq={}", seq));
        }
        if let Some(ack) = self.tcp_ack {
            line.push_str(&format!(" ack={}", ack));
        }
        line.push_str(&format!(" len={}", self.payload_size));
        if let Some(err) = self.decode_error {
            line.push_str(&format!(" error={}", err));
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Direction-independent flow identity: endpoints ordered by (ip, port).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub session: SessionId,
    pub protocol: TransportProtocol,
    pub first: Endpoint,
    pub second: Endpoint,
}

impl FlowKey {
    pub fn canonical(
        session: SessionId,
        protocol: TransportProtocol,
        src: Endpoint,
        dst: Endpoint,
    ) -> Self {
        let (first, second) = if src <= dst { (src, dst) } else { (dst, src) };
        Self { session, protocol, first, second }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Established,
    Completed,
    Closed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowFlags {
    pub syn: bool,
    pub syn_ack: bool,
    pub fin: bool,
    pub rst: bool,
    /// TCP flow whose first observed packet was not a SYN.
    pub midstream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: FlowId,
    pub key: FlowKey,
    pub state: FlowState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub first_frame: u64,
    pub last_frame: u64,
    pub packet_count: u64,
    /// Payload bytes sent by `key.first`.
    pub bytes_sent: u64,
    /// Payload bytes sent by `key.second`.
    pub bytes_received: u64,
    pub flags: FlowFlags,
}

impl Flow {
    pub fn duration_ms(&self) -> i64 {
        self.end_time
            .unwrap_or(self.last_seen)
            .signed_duration_since(self.start_time)
            .num_milliseconds()
    }
}

// ---------------------------------------------------------------------------
// Encoding layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncodingType {
    Http,
    Dns,
    Tls,
    Ssh,
    Unknown,
}

impl EncodingType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Dns => "DNS",
            Self::Tls => "TLS",
            Self::Ssh => "SSH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EncodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingRecord {
    pub id: EncodingId,
    pub transport: TransportId,
    pub timestamp: DateTime<Utc>,
    pub encoding_type: EncodingType,
    pub version: Option<String>,
    /// Flat, lowercase-keyed header map. Start-line fields use `:`-prefixed keys.
    pub headers: HashMap<String, String>,
    pub raw_body: Vec<u8>,
    /// Body after transfer/content decoding, when it differs from `raw_body`.
    pub decoded_body: Option<Vec<u8>>,
    /// The body carried a complete, length-delimited payload.
    pub body_complete: bool,
    pub is_compressed: bool,
    pub encryption_detected: bool,
    pub entropy: f64,
    pub encoding_errors: Vec<String>,
}

impl EncodingRecord {
    pub fn body(&self) -> &[u8] {
        self.decoded_body.as_deref().unwrap_or(&self.raw_body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Headers (sorted) followed by the body, used for ENCODING rule matching.
    pub fn match_text(&self) -> String {
        let mut keys: Vec<&String> = self.headers.keys().collect();
        keys.sort();
        let mut text = match &self.version {
            Some(v) => format!("{} {}\n", self.encoding_type, v),
            None => format!("{}\n", self.encoding_type),
        };
        for key in keys {
            text.push_str(key);
            text.push_str(": ");
            text.push_str(&self.headers[key]);
            text.push('\n');
        }
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(self.body()));
        text
    }
}

// ---------------------------------------------------------------------------
// Content layer + extracted files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRecord {
    pub id: ContentId,
    pub encoding: EncodingId,
    pub timestamp: DateTime<Utc>,
    pub content_type: String,
    pub text: Option<String>,
    pub binary: Option<Vec<u8>>,
    /// Hex SHA-256 over the decoded bytes.
    pub content_hash: String,
    pub size_bytes: u64,
    pub is_extracted: bool,
    pub file: Option<FileId>,
}

impl ContentRecord {
    pub fn match_text(&self) -> String {
        match (&self.text, &self.binary) {
            (Some(text), _) => text.clone(),
            (None, Some(bin)) => String::from_utf8_lossy(bin).into_owned(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedFile {
    pub id: FileId,
    pub session: SessionId,
    pub content_hash: String,
    pub md5: String,
    pub mime_type: String,
    pub name: String,
    pub size_bytes: u64,
    /// Content record that first produced this file.
    pub source: ContentId,
    #[serde(skip)]
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Rules + matches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Layer {
    Transport,
    Encoding,
    Content,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Transport => "TRANSPORT",
            Self::Encoding => "ENCODING",
            Self::Content => "CONTENT",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRANSPORT" => Ok(Self::Transport),
            "ENCODING" => Ok(Self::Encoding),
            "CONTENT" => Ok(Self::Content),
            other => Err(format!("unknown layer: {}", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        })
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Fixed set of structural checks a rule may name instead of a pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Predicate {
    /// Payload, body or content size strictly above `min_bytes`.
    LargeTransfer { min_bytes: u64 },
    /// TLS negotiated below 1.2.
    WeakTls,
    EncryptedPayload,
    DecodeErrors,
    ExtractedFile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    Pattern {
        pattern: String,
        #[serde(default)]
        case_insensitive: bool,
    },
    Predicate { predicate: Predicate },
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_layer: Layer,
    pub condition: RuleCondition,
    pub severity: Severity,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Vulnerability tags attached to every match of this rule.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "layer", content = "id", rename_all = "UPPERCASE")]
pub enum RecordRef {
    Transport(TransportId),
    Encoding(EncodingId),
    Content(ContentId),
}

impl RecordRef {
    pub fn packet(&self) -> PacketId {
        match self {
            Self::Transport(id) => id.packet(),
            Self::Encoding(id) => id.packet(),
            Self::Content(id) => id.packet(),
        }
    }

    pub fn layer(&self) -> Layer {
        match self {
            Self::Transport(_) => Layer::Transport,
            Self::Encoding(_) => Layer::Encoding,
            Self::Content(_) => Layer::Content,
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(id) => id.fmt(f),
            Self::Encoding(id) => id.fmt(f),
            Self::Content(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Match {
    pub id: MatchId,
    pub rule_id: String,
    pub rule_name: String,
    pub session: SessionId,
    pub record: RecordRef,
    pub severity: Severity,
    pub matched_data: String,
    pub tags: Vec<String>,
    /// Timestamp of the packet behind the matched record.
    pub timestamp: DateTime<Utc>,
}

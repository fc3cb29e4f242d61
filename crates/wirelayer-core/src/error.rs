//! Error taxonomy for the analysis pipeline.
//!
//! Ingestion and integrity errors surface to the caller. Decode errors are
//! carried as data on the records they degrade, and rule errors stay
//! isolated to the rule that raised them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::SessionId;

/// Rejected at the ingestion boundary; the caller must correct and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestionError {
    #[error("frame {frame_number} already ingested in session {session}")]
    DuplicateFrame { session: SessionId, frame_number: u64 },

    #[error("session {session} is closed")]
    SessionClosed { session: SessionId },

    #[error("unknown session {session}")]
    UnknownSession { session: SessionId },
}

/// Tag recorded on a transport record whose header could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum TransportDecodeError {
    #[error("malformed header")]
    MalformedHeader,

    #[error("unsupported protocol")]
    UnsupportedProtocol,
}

/// A record whose parent chain does not resolve. Fatal to that chain only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("{child} references missing {parent}")]
    MissingParent { child: String, parent: String },

    #[error("{child} belongs to session {child_session} but its parent is in {parent_session}")]
    SessionMismatch {
        child: String,
        child_session: SessionId,
        parent_session: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleEvaluationError {
    #[error("rule {rule_id}: invalid pattern: {reason}")]
    InvalidPattern { rule_id: String, reason: String },

    #[error("rule {rule_id} is unhealthy: {reason}")]
    Unhealthy { rule_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error("session {session} is still open; close it before analysis")]
    SessionOpen { session: SessionId },

    #[error("cannot build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

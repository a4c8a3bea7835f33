use std::io;
use thiserror::Error;

/// Represent all replichat errors
#[derive(Error, Debug)]
#[error("...")]
pub enum ChatError {
    /// Any Error
    Any(#[from] anyhow::Error),

    /// IO Error
    Io(#[from] io::Error),

    /// Serde Error
    Serde(#[from] serde_json::Error),

    /// No leader is known or the write could not reach a majority;
    /// safe for the caller to retry
    #[error("transient: {0}")]
    Transient(String),

    /// Request rejected before replication
    #[error("{reason}: {detail}")]
    Validation { reason: String, detail: String },

    /// A write landed on a non-leader
    #[error("not the leader")]
    NotLeader { leader_hint: Option<String> },

    /// Peer closed the connection mid-exchange
    #[error("connection closed")]
    ConnectionClosed,

    /// Inbound frame exceeded the wire limit
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(u32),
}

impl ChatError {
    pub fn validation(reason: &str, detail: impl Into<String>) -> Self {
        ChatError::Validation {
            reason: reason.to_string(),
            detail: detail.into(),
        }
    }
}

/// Handle Result<T, ChatError>
pub type Result<T> = anyhow::Result<T, ChatError>;

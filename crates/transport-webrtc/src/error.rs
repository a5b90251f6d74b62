use std::time::Duration;

use thiserror::Error;
use transport_bus::BusError;

/// Opaque failure reported by the connection primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PeerError(pub String);

impl PeerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("negotiation failed during {stage}: {source}")]
    Negotiation {
        stage: &'static str,
        #[source]
        source: PeerError,
    },
    #[error("candidate could not be applied: {0}")]
    StaleCandidate(#[source] PeerError),
    #[error("no data channel within {0:?}")]
    AttemptTimeout(Duration),
    #[error("peer connection failed: {0}")]
    ConnectionFailed(String),
    #[error("frame {sent} of {total} failed to send: {source}")]
    TransportWrite {
        sent: usize,
        total: usize,
        #[source]
        source: PeerError,
    },
    #[error("data channel closed")]
    ChannelClosed,
    #[error("connection attempt already started")]
    AlreadyStarted,
    #[error("no connection attempt in progress")]
    NotStarted,
    #[error("signaling bus: {0}")]
    Bus(#[from] BusError),
    #[error("signaling payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl RtcError {
    pub(crate) fn negotiation(stage: &'static str, source: PeerError) -> Self {
        RtcError::Negotiation { stage, source }
    }

    /// Whether the error aborts the attempt it came from.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RtcError::StaleCandidate(_))
    }
}

pub type RtcResult<T> = Result<T, RtcError>;

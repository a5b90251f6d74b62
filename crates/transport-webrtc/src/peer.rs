//! The seam between the coordinator and the ICE/DTLS/SCTP engine.
//!
//! Notifications from the engine (candidates, channel open, state changes)
//! arrive as [`PeerEvent`] values on the channel handed out by
//! [`ConnectionFactory::connect`], in the order the engine produced them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

/// A candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Reads the `typ` attribute of the candidate line.
    pub fn kind(&self) -> CandidateKind {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return match tokens.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::ServerReflexive,
                    Some("prflx") => CandidateKind::PeerReflexive,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }

    pub fn is_host(&self) -> bool {
        self.kind() == CandidateKind::Host
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
}

/// Data channel parameters negotiated by the offering side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParams {
    pub label: String,
    pub ordered: bool,
    /// Sub-protocol carried over the channel.
    pub protocol: String,
    /// Pre-negotiated stream id. When set, the channel is negotiated out of
    /// band and the answering engine will not announce it.
    pub id: Option<u16>,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            label: "data".to_string(),
            ordered: true,
            protocol: String::new(),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub type MessageHandler = Box<dyn FnMut(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;
pub type CloseHandler = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send(&self, datagram: Bytes) -> Result<(), PeerError>;
    /// The engine awaits the returned future before delivering the next
    /// message.
    fn on_message(&self, handler: MessageHandler);
    fn on_close(&self, handler: CloseHandler);
    async fn close(&self) -> Result<(), PeerError>;
}

pub enum PeerEvent {
    Candidate(IceCandidate),
    GatheringComplete,
    ChannelOpen(Arc<dyn DataChannel>),
    StateChanged(ConnectionState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Candidate(candidate) => f.debug_tuple("Candidate").field(candidate).finish(),
            PeerEvent::GatheringComplete => f.write_str("GatheringComplete"),
            PeerEvent::ChannelOpen(channel) => {
                f.debug_tuple("ChannelOpen").field(&channel.label()).finish()
            }
            PeerEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn create_data_channel(
        &self,
        params: &ChannelParams,
    ) -> Result<Arc<dyn DataChannel>, PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

pub struct PeerHandle {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, config: &PeerConfig) -> Result<PeerHandle, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn candidate_kind_from_typ_token() {
        let host = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host");
        let srflx = IceCandidate::new(
            "candidate:2 1 udp 1694498815 203.0.113.7 50001 typ srflx raddr 10.0.0.2 rport 50000",
        );
        let relay = IceCandidate::new("candidate:3 1 udp 16777215 198.51.100.1 3478 typ relay");
        let junk = IceCandidate::new("candidate:4 1 udp 1 10.0.0.2 1 typ");
        assert_eq!(host.kind(), CandidateKind::Host);
        assert!(host.is_host());
        assert_eq!(srflx.kind(), CandidateKind::ServerReflexive);
        assert_eq!(relay.kind(), CandidateKind::Relay);
        assert_eq!(junk.kind(), CandidateKind::Unknown);
        assert!(!junk.is_host());
    }

    #[test_timeout::timeout]
    fn candidate_json_matches_browser_shape() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 1 typ host");
        let value = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());

        let parsed: IceCandidate =
            serde_json::from_str(r#"{"candidate":"candidate:9 1 udp 1 1.2.3.4 5 typ relay"}"#)
                .expect("deserialize");
        assert_eq!(parsed.sdp_mid, None);
        assert_eq!(parsed.kind(), CandidateKind::Relay);
    }

    #[test_timeout::timeout]
    fn description_json_uses_type_field() {
        let desc = SessionDescription::offer("v=0");
        let value = serde_json::to_value(&desc).expect("serialize");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
    }
}

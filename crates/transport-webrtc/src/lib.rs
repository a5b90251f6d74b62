//! Trickle-ICE signaling over a pub/sub + RPC bus, and message framing for
//! MTU-limited data channels.
//!
//! The offering side runs [`client::connect`]; the answering side runs an
//! [`RtcProvider`]. Both talk to the ICE engine through the traits in
//! [`peer`], with a `webrtc`-crate backend in [`rtc`].

pub mod adapter;
pub mod answerer;
pub mod assembler;
pub mod client;
pub mod config;
pub mod error;
pub mod offerer;
pub mod peer;
pub mod provider;
pub mod ready;
pub mod registry;
pub mod rtc;
pub mod signaling;

pub use adapter::PeerAdapter;
pub use answerer::{Answerer, CandidateCallback, Regime};
pub use assembler::{Chunks, Frame, FrameError, MessageAssembler, chunk};
pub use client::{RtcSession, connect, connect_peer};
pub use config::{AnswerConfig, ClientConfig, OfferConfig, ProviderConfig, default_ice_servers};
pub use error::{PeerError, RtcError, RtcResult};
pub use offerer::{Offerer, OffererPhase};
pub use peer::{
    ChannelParams, ConnectionFactory, ConnectionState, DataChannel, IceCandidate, IceServer,
    PeerConfig, PeerConnection, PeerEvent, PeerHandle, SdpKind, SessionDescription,
};
pub use provider::{AcceptedPeer, RtcProvider};
pub use ready::ReadySlot;
pub use registry::{AnswererHook, AnswererRegistry};
pub use rtc::WebRtcFactory;
pub use signaling::{Answer, CandidateEnvelope, Negotiation, Offer, OfferRequest};

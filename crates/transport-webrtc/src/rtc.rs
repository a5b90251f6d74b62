//! [`ConnectionFactory`] backed by the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::PeerError;
use crate::peer::{
    ChannelParams, CloseHandler, ConnectionFactory, ConnectionState, DataChannel, IceCandidate,
    MessageHandler, PeerConfig, PeerConnection, PeerEvent, PeerHandle, SdpKind,
    SessionDescription,
};

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

fn to_peer_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::new(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_peer_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_peer_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcFactory {
    api: API,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );
        Self::with_settings(setting)
    }

    pub fn with_settings(setting: SettingEngine) -> Result<Self, PeerError> {
        Ok(Self {
            api: build_api(setting)?,
        })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn connect(&self, config: &PeerConfig) -> Result<PeerHandle, PeerError> {
        let configuration = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: config.candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(configuration)
                .await
                .map_err(to_peer_error)?,
        );
        let (events_tx, events) = mpsc::unbounded_channel();
        install_handlers(&pc, events_tx.clone());
        trace!(
            target = "webrtc",
            ice_servers = config.ice_servers.len(),
            "peer connection constructed"
        );
        Ok(PeerHandle {
            connection: Arc::new(WebRtcConnection { pc, events: events_tx }),
            events,
        })
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => PeerEvent::Candidate(from_candidate_init(init)),
                    Err(err) => {
                        warn!(
                            target = "webrtc",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                        return;
                    }
                },
                None => PeerEvent::GatheringComplete,
            };
            let _ = events.send(event);
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::StateChanged(connection_state(state)));
        })
    }));

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let events = events.clone();
        Box::pin(async move {
            debug!(target = "webrtc", label = %dc.label(), "remote data channel announced");
            announce_on_open(dc, events);
        })
    }));
}

fn announce_on_open(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel { dc: Arc::clone(&dc) });
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            trace!(target = "webrtc", label = %channel.label(), "data channel open");
            let _ = events.send(PeerEvent::ChannelOpen(channel));
        })
    }));
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
    }
    .map_err(to_peer_error)
}

fn from_rtc_description(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, PeerError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => return Err(PeerError::new(format!("unsupported sdp type {other}"))),
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(to_peer_error)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(to_peer_error)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_peer_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_peer_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(to_peer_error)
    }

    async fn create_data_channel(
        &self,
        params: &ChannelParams,
    ) -> Result<Arc<dyn DataChannel>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(params.ordered),
            protocol: Some(params.protocol.clone()),
            negotiated: params.id,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&params.label, Some(init))
            .await
            .map_err(to_peer_error)?;
        announce_on_open(Arc::clone(&dc), self.events.clone());
        Ok(Arc::new(WebRtcChannel { dc }))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(to_peer_error)
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    async fn send(&self, datagram: Bytes) -> Result<(), PeerError> {
        self.dc.send(&datagram).await.map(|_| ()).map_err(to_peer_error)
    }

    fn on_message(&self, mut handler: MessageHandler) {
        self.dc
            .on_message(Box::new(move |msg: DataChannelMessage| handler(msg.data)));
    }

    fn on_close(&self, mut handler: CloseHandler) {
        self.dc.on_close(Box::new(move || handler()));
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.dc.close().await.map_err(to_peer_error)
    }
}

//! Offering side wired to the signaling bus.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport_bus::{Bus, BusMessage};
use uuid::Uuid;

use crate::adapter::PeerAdapter;
use crate::config::ClientConfig;
use crate::error::RtcResult;
use crate::offerer::Offerer;
use crate::peer::{ConnectionFactory, DataChannel};
use crate::signaling::{self, Answer, CandidateEnvelope, OfferRequest};

/// An offering attempt whose data channel is open.
pub struct RtcSession {
    session_id: String,
    offerer: Arc<Offerer>,
    channel: Arc<dyn DataChannel>,
    config: ClientConfig,
    listener: Option<JoinHandle<()>>,
}

impl RtcSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channel(&self) -> Arc<dyn DataChannel> {
        Arc::clone(&self.channel)
    }

    pub fn offerer(&self) -> &Arc<Offerer> {
        &self.offerer
    }

    /// Wraps the channel as a message stream that owns the connection. Late
    /// remote candidates keep being applied until the stream is closed.
    pub fn into_peer(mut self, max_segment_size: usize) -> PeerAdapter {
        let peer = PeerAdapter::with_partial_timeout(
            Arc::clone(&self.channel),
            max_segment_size,
            self.config.partial_timeout,
        );
        let peer = match self.offerer.connection() {
            Some(connection) => peer.with_connection(connection),
            None => peer,
        };
        match self.listener.take() {
            Some(listener) => peer.with_listener(listener),
            None => peer,
        }
    }

    pub async fn close(mut self) -> RtcResult<()> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.offerer.close().await
    }
}

impl Drop for RtcSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

pub async fn connect(
    config: ClientConfig,
    bus: Arc<dyn Bus>,
    factory: Arc<dyn ConnectionFactory>,
) -> RtcResult<RtcSession> {
    config.validate()?;

    let session_id = Uuid::new_v4().to_string();
    let offerer = Arc::new(Offerer::new(factory));
    let candidates = bus.subscribe(&config.topic_offerer_on_candidate);
    let listener = tokio::spawn(apply_remote_candidates(
        Arc::clone(&offerer),
        candidates,
        session_id.clone(),
    ));

    match negotiate(&config, &bus, &offerer, &session_id).await {
        Ok(channel) => {
            debug!(target = "webrtc", session_id = %session_id, "rtc session established");
            Ok(RtcSession {
                session_id,
                offerer,
                channel,
                config,
                listener: Some(listener),
            })
        }
        Err(err) => {
            listener.abort();
            if let Err(close_err) = offerer.close().await {
                trace!(target = "webrtc", error = %close_err, "closing failed offerer");
            }
            warn!(target = "webrtc", session_id = %session_id, error = %err, "rtc connect failed");
            Err(err)
        }
    }
}

/// [`connect`], then wrap the channel with the configured segment size.
pub async fn connect_peer(
    config: ClientConfig,
    bus: Arc<dyn Bus>,
    factory: Arc<dyn ConnectionFactory>,
) -> RtcResult<PeerAdapter> {
    let max_segment_size = config.max_segment_size;
    let session = connect(config, bus, factory).await?;
    Ok(session.into_peer(max_segment_size))
}

async fn negotiate(
    config: &ClientConfig,
    bus: &Arc<dyn Bus>,
    offerer: &Offerer,
    session_id: &str,
) -> RtcResult<Arc<dyn DataChannel>> {
    let offer = offerer
        .offer(&config.offer_config(), Arc::clone(bus), session_id)
        .await?;
    let request = signaling::encode(&OfferRequest {
        session_id: session_id.to_string(),
        offer,
    })?;
    let response = bus.call(&config.procedure_offer, request).await?;
    let answer: Answer = signaling::decode(&response)?;
    debug!(
        target = "webrtc",
        session_id,
        candidates = answer.candidates.len(),
        "answer received"
    );
    offerer.handle_answer(answer).await?;
    offerer.wait_ready(config.ready_timeout).await
}

async fn apply_remote_candidates(
    offerer: Arc<Offerer>,
    mut candidates: broadcast::Receiver<BusMessage>,
    session_id: String,
) {
    loop {
        let message = match candidates.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    target = "webrtc",
                    session_id = %session_id,
                    skipped,
                    "remote candidate subscriber lagged"
                );
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let envelope: CandidateEnvelope = match signaling::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    target = "webrtc",
                    session_id = %session_id,
                    error = %err,
                    "malformed candidate envelope"
                );
                continue;
            }
        };
        if envelope.session_id != session_id {
            continue;
        }
        if let Err(err) = offerer.add_ice_candidate(envelope.candidate).await {
            warn!(
                target = "webrtc",
                session_id = %session_id,
                error = %err,
                "remote candidate not applied"
            );
        }
    }
}

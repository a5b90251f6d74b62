//! Answering side wired to the signaling bus.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transport_bus::{Bus, BusError, BusResult, Procedure};

use crate::adapter::PeerAdapter;
use crate::answerer::Answerer;
use crate::config::{AnswerConfig, ProviderConfig};
use crate::error::{RtcError, RtcResult};
use crate::peer::ConnectionFactory;
use crate::registry::AnswererRegistry;
use crate::signaling::{self, CandidateEnvelope, OfferRequest};

/// A peer whose data channel opened within the ready timeout.
pub struct AcceptedPeer {
    pub session_id: String,
    pub peer: PeerAdapter,
}

pub struct RtcProvider {
    config: ProviderConfig,
    bus: Arc<dyn Bus>,
    registry: Arc<AnswererRegistry>,
    accepted: AsyncMutex<mpsc::UnboundedReceiver<AcceptedPeer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcProvider {
    /// Registers the offer procedure and starts listening for remote
    /// candidates. Must be called from within a tokio runtime.
    pub fn setup(
        config: ProviderConfig,
        bus: Arc<dyn Bus>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> RtcResult<Self> {
        config.validate()?;

        let registry = Arc::new(AnswererRegistry::new(factory, config.trickle_window));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        install_answerer_hook(&registry, &config, Arc::clone(&bus), accept_tx);

        // subscribe before the procedure exists so no early candidate is missed
        let candidates = bus.subscribe(&config.topic_handle_remote_candidates);
        bus.register(
            &config.procedure_handle_offer,
            Arc::new(OfferProcedure {
                registry: Arc::clone(&registry),
                answer_config: config.answer_config(),
            }),
        )?;

        let listener = tokio::spawn(dispatch_candidates(
            Arc::clone(&registry),
            candidates,
            config.topic_handle_remote_candidates.clone(),
        ));
        let sweeper = tokio::spawn(sweep_sessions(Arc::downgrade(&registry), config.session_ttl));

        info!(
            target = "webrtc",
            procedure = %config.procedure_handle_offer,
            candidates = %config.topic_handle_remote_candidates,
            "rtc provider ready"
        );
        Ok(Self {
            config,
            bus,
            registry,
            accepted: AsyncMutex::new(accept_rx),
            tasks: Mutex::new(vec![listener, sweeper]),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AnswererRegistry> {
        &self.registry
    }

    /// Next accepted peer, or `None` after [`RtcProvider::shutdown`].
    pub async fn accept(&self) -> Option<AcceptedPeer> {
        self.accepted.lock().await.recv().await
    }

    pub async fn shutdown(&self) {
        self.stop_tasks();
        if !self.bus.unregister(&self.config.procedure_handle_offer) {
            debug!(target = "webrtc", "offer procedure was already unregistered");
        }
        let mut accepted = self.accepted.lock().await;
        accepted.close();
        while let Ok(pending) = accepted.try_recv() {
            if let Err(err) = pending.peer.close().await {
                debug!(
                    target = "webrtc",
                    session_id = %pending.session_id,
                    error = %err,
                    "closing unclaimed peer failed"
                );
            }
        }
        debug!(target = "webrtc", "rtc provider shut down");
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RtcProvider {
    fn drop(&mut self) {
        self.stop_tasks();
        // the registered procedure holds the registry alive
        self.bus.unregister(&self.config.procedure_handle_offer);
    }
}

fn install_answerer_hook(
    registry: &Arc<AnswererRegistry>,
    config: &ProviderConfig,
    bus: Arc<dyn Bus>,
    accept_tx: mpsc::UnboundedSender<AcceptedPeer>,
) {
    let weak_registry = Arc::downgrade(registry);
    let topic = config.topic_publish_local_candidate.clone();
    let ready_timeout = config.ready_timeout;
    let max_segment_size = config.max_segment_size;
    let partial_timeout = config.partial_timeout;

    registry.on_answerer(move |session_id, answerer| {
        let publish_bus = Arc::clone(&bus);
        let publish_topic = topic.clone();
        let publish_session = session_id.to_string();
        answerer.on_ice_candidate(move |candidate| {
            let envelope = CandidateEnvelope {
                session_id: publish_session.clone(),
                candidate,
            };
            let result = signaling::encode(&envelope)
                .and_then(|payload| {
                    publish_bus
                        .publish(&publish_topic, payload)
                        .map_err(RtcError::from)
                });
            if let Err(err) = result {
                warn!(
                    target = "webrtc",
                    session_id = %publish_session,
                    topic = %publish_topic,
                    error = %err,
                    "failed to publish local candidate"
                );
            }
        });

        tokio::spawn(await_ready(
            session_id.to_string(),
            Arc::clone(answerer),
            weak_registry.clone(),
            accept_tx.clone(),
            ready_timeout,
            max_segment_size,
            partial_timeout,
        ));
    });
}

async fn await_ready(
    session_id: String,
    answerer: Arc<Answerer>,
    registry: Weak<AnswererRegistry>,
    accept_tx: mpsc::UnboundedSender<AcceptedPeer>,
    ready_timeout: Duration,
    max_segment_size: usize,
    partial_timeout: Duration,
) {
    match answerer.wait_ready(ready_timeout).await {
        Ok(channel) => {
            let mut peer =
                PeerAdapter::with_partial_timeout(channel, max_segment_size, partial_timeout);
            if let Some(connection) = answerer.connection() {
                peer = peer.with_connection(connection);
            }
            debug!(target = "webrtc", session_id = %session_id, "peer accepted");
            if let Err(unclaimed) = accept_tx.send(AcceptedPeer { session_id, peer }) {
                let unclaimed = unclaimed.0;
                debug!(
                    target = "webrtc",
                    session_id = %unclaimed.session_id,
                    "provider gone; closing peer"
                );
                let _ = unclaimed.peer.close().await;
            }
        }
        Err(err) => {
            error!(target = "webrtc", session_id = %session_id, error = %err, "rtc attempt failed");
            if let Err(close_err) = answerer.close().await {
                debug!(
                    target = "webrtc",
                    session_id = %session_id,
                    error = %close_err,
                    "closing failed attempt"
                );
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_same(&session_id, &answerer);
            }
        }
    }
}

async fn dispatch_candidates(
    registry: Arc<AnswererRegistry>,
    mut candidates: broadcast::Receiver<transport_bus::BusMessage>,
    topic: String,
) {
    loop {
        let message = match candidates.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "webrtc", %topic, skipped, "remote candidate subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let envelope: CandidateEnvelope = match signaling::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target = "webrtc", %topic, error = %err, "malformed candidate envelope");
                continue;
            }
        };
        if let Err(err) = registry
            .add_candidate(&envelope.session_id, envelope.candidate)
            .await
        {
            warn!(
                target = "webrtc",
                session_id = %envelope.session_id,
                error = %err,
                "remote candidate not applied"
            );
        }
    }
    debug!(target = "webrtc", %topic, "remote candidate subscription closed");
}

async fn sweep_sessions(registry: Weak<AnswererRegistry>, ttl: Duration) {
    let mut interval = tokio::time::interval(ttl);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else { break };
        let evicted = registry.evict_older_than(ttl);
        if !evicted.is_empty() {
            debug!(target = "webrtc", sessions = ?evicted, "session ttl sweep");
        }
    }
}

struct OfferProcedure {
    registry: Arc<AnswererRegistry>,
    answer_config: AnswerConfig,
}

#[async_trait]
impl Procedure for OfferProcedure {
    async fn invoke(&self, payload: Bytes) -> BusResult<Bytes> {
        let request: OfferRequest = signaling::decode(&payload)
            .map_err(|err| BusError::Invocation(err.to_string()))?;
        let session_id = request.session_id;
        debug!(target = "webrtc", session_id = %session_id, "offer received");
        let answer = self
            .registry
            .handle_offer(&session_id, request.offer, &self.answer_config)
            .await
            .map_err(|err| {
                warn!(target = "webrtc", session_id = %session_id, error = %err, "offer rejected");
                BusError::Invocation(err.to_string())
            })?;
        signaling::encode(&answer).map_err(|err| BusError::Invocation(err.to_string()))
    }
}

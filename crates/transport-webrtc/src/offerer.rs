//! Initiating side of a connection attempt.
//!
//! Local candidates are trickled to the answerer one at a time as soon as the
//! engine reports them. Remote candidates that arrive before the answer has
//! been applied are held and replayed once it has.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport_bus::Bus;

use crate::config::OfferConfig;
use crate::error::{RtcError, RtcResult};
use crate::peer::{
    ConnectionFactory, ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerEvent,
};
use crate::ready::ReadySlot;
use crate::signaling::{self, Answer, CandidateEnvelope, Negotiation, Offer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffererPhase {
    Created,
    ConnectionEstablished,
    OfferSent,
    AnswerReceived,
    DataChannelReady,
    Failed,
}

impl OffererPhase {
    fn is_terminal(self) -> bool {
        matches!(self, OffererPhase::DataChannelReady | OffererPhase::Failed)
    }
}

impl fmt::Display for OffererPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OffererPhase::Created => "created",
            OffererPhase::ConnectionEstablished => "connection_established",
            OffererPhase::OfferSent => "offer_sent",
            OffererPhase::AnswerReceived => "answer_received",
            OffererPhase::DataChannelReady => "data_channel_ready",
            OffererPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct OffererState {
    connection: Option<Arc<dyn PeerConnection>>,
    phase: OffererPhase,
    started: bool,
    answered: bool,
    early_candidates: Vec<IceCandidate>,
}

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<OffererState>,
    ready: ReadySlot<Arc<dyn DataChannel>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn advance(&self, to: OffererPhase) {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return;
        }
        trace!(target = "webrtc", from = %state.phase, %to, "offerer phase");
        state.phase = to;
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

pub struct Offerer {
    inner: Arc<Inner>,
}

impl Offerer {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                state: Mutex::new(OffererState {
                    connection: None,
                    phase: OffererPhase::Created,
                    started: false,
                    answered: false,
                    early_candidates: Vec::new(),
                }),
                ready: ReadySlot::new(),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> OffererPhase {
        self.inner.state.lock().phase
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.inner.state.lock().connection.clone()
    }

    /// Builds the connection and data channel and returns the local offer.
    /// Candidates are published to `config.topic_answerer_on_candidate` as
    /// they are gathered, tagged with `correlation_id`.
    pub async fn offer(
        &self,
        config: &OfferConfig,
        bus: Arc<dyn Bus>,
        correlation_id: &str,
    ) -> RtcResult<Offer> {
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(RtcError::AlreadyStarted);
            }
            state.started = true;
        }

        let handle = match self.inner.factory.connect(&config.peer_config()).await {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail(None, RtcError::negotiation("connect", err)).await),
        };
        let connection = handle.connection;
        {
            let mut state = self.inner.state.lock();
            state.connection = Some(Arc::clone(&connection));
        }
        self.inner.advance(OffererPhase::ConnectionEstablished);
        debug!(target = "webrtc", session_id = correlation_id, "offerer connection constructed");

        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            handle.events,
            CandidateSink {
                bus,
                topic: config.topic_answerer_on_candidate.clone(),
                session_id: correlation_id.to_string(),
            },
        ));
        *self.inner.pump.lock() = Some(pump);

        if let Err(err) = connection.create_data_channel(&config.channel).await {
            let err = RtcError::negotiation("create_data_channel", err);
            return Err(self.fail(Some(connection), err).await);
        }
        let description = match connection.create_offer().await {
            Ok(description) => description,
            Err(err) => {
                let err = RtcError::negotiation("create_offer", err);
                return Err(self.fail(Some(connection), err).await);
            }
        };
        if let Err(err) = connection.set_local_description(description.clone()).await {
            let err = RtcError::negotiation("set_local_description", err);
            return Err(self.fail(Some(connection), err).await);
        }

        self.inner.advance(OffererPhase::OfferSent);
        debug!(
            target = "webrtc",
            session_id = correlation_id,
            label = %config.channel.label,
            "offer created"
        );
        Ok(Negotiation::new(description))
    }

    /// Applies the remote answer and its candidate batch, then replays any
    /// candidates that were trickled in before it.
    pub async fn handle_answer(&self, answer: Answer) -> RtcResult<()> {
        let connection = self.connection().ok_or(RtcError::NotStarted)?;

        if let Err(err) = connection.set_remote_description(answer.description).await {
            let err = RtcError::negotiation("set_remote_description", err);
            return Err(self.fail(Some(connection), err).await);
        }
        let batch = answer.candidates.len();
        for candidate in answer.candidates {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                let err = RtcError::negotiation("add_ice_candidate", err);
                return Err(self.fail(Some(connection), err).await);
            }
        }

        let early = {
            let mut state = self.inner.state.lock();
            state.answered = true;
            std::mem::take(&mut state.early_candidates)
        };
        self.inner.advance(OffererPhase::AnswerReceived);
        debug!(
            target = "webrtc",
            batch,
            replayed = early.len(),
            "answer applied"
        );
        for candidate in early {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                warn!(
                    target = "webrtc",
                    error = %RtcError::StaleCandidate(err),
                    "replaying early remote candidate failed"
                );
            }
        }
        Ok(())
    }

    /// Applies a trickled remote candidate. Failures are
    /// [`RtcError::StaleCandidate`] and do not abort the attempt.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> RtcResult<()> {
        let connection = {
            let mut state = self.inner.state.lock();
            let Some(connection) = state.connection.clone() else {
                return Err(RtcError::NotStarted);
            };
            if !state.answered {
                trace!(
                    target = "webrtc",
                    candidate = %candidate.candidate,
                    "holding remote candidate until answer"
                );
                state.early_candidates.push(candidate);
                return Ok(());
            }
            connection
        };
        trace!(target = "webrtc", candidate = %candidate.candidate, "applying remote candidate");
        connection
            .add_ice_candidate(candidate)
            .await
            .map_err(RtcError::StaleCandidate)
    }

    pub async fn wait_ready(&self, timeout: Duration) -> RtcResult<Arc<dyn DataChannel>> {
        self.inner.ready.wait(timeout).await
    }

    pub async fn close(&self) -> RtcResult<()> {
        self.inner.stop_pump();
        self.inner.ready.fail("offerer closed");
        let connection = self.inner.state.lock().connection.take();
        if let Some(connection) = connection {
            connection
                .close()
                .await
                .map_err(|err| RtcError::negotiation("close", err))?;
        }
        Ok(())
    }

    async fn fail(&self, connection: Option<Arc<dyn PeerConnection>>, err: RtcError) -> RtcError {
        {
            let mut state = self.inner.state.lock();
            state.phase = OffererPhase::Failed;
        }
        self.inner.ready.fail(err.to_string());
        self.inner.stop_pump();
        if let Some(connection) = connection {
            close_quietly(connection.as_ref()).await;
        }
        debug!(target = "webrtc", error = %err, "offer attempt failed");
        err
    }
}

impl fmt::Debug for Offerer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offerer")
            .field("phase", &self.phase())
            .field("ready", &self.inner.ready.is_settled())
            .finish()
    }
}

struct CandidateSink {
    bus: Arc<dyn Bus>,
    topic: String,
    session_id: String,
}

impl CandidateSink {
    fn publish(&self, candidate: IceCandidate) {
        let envelope = CandidateEnvelope {
            session_id: self.session_id.clone(),
            candidate,
        };
        let result = signaling::encode(&envelope)
            .and_then(|payload| self.bus.publish(&self.topic, payload).map_err(RtcError::from));
        match result {
            Ok(()) => trace!(
                target = "webrtc",
                session_id = %self.session_id,
                candidate = %envelope.candidate.candidate,
                "local candidate published"
            ),
            Err(err) => warn!(
                target = "webrtc",
                session_id = %self.session_id,
                topic = %self.topic,
                error = %err,
                "failed to publish local candidate"
            ),
        }
    }
}

async fn pump_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    sink: CandidateSink,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Candidate(candidate) => sink.publish(candidate),
            PeerEvent::GatheringComplete => {
                debug!(
                    target = "webrtc",
                    session_id = %sink.session_id,
                    "offerer gathering complete"
                );
            }
            PeerEvent::ChannelOpen(channel) => {
                let Some(inner) = inner.upgrade() else { break };
                if inner.ready.set(channel) {
                    inner.advance(OffererPhase::DataChannelReady);
                    debug!(
                        target = "webrtc",
                        session_id = %sink.session_id,
                        "offerer data channel ready"
                    );
                } else {
                    trace!(target = "webrtc", "ignoring repeated channel open");
                }
            }
            PeerEvent::StateChanged(state) => {
                debug!(
                    target = "webrtc",
                    session_id = %sink.session_id,
                    %state,
                    "offerer connection state"
                );
                if matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                    let Some(inner) = inner.upgrade() else { break };
                    if inner.ready.fail(format!("peer connection {state}")) {
                        inner.advance(OffererPhase::Failed);
                    }
                }
            }
        }
    }
}

pub(crate) async fn close_quietly(connection: &dyn PeerConnection) {
    if let Err(err) = connection.close().await {
        trace!(target = "webrtc", error = %err, "closing connection failed");
    }
}

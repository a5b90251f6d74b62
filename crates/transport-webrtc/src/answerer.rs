//! Responding side of a connection attempt.
//!
//! Remote candidates may reach the answerer before its connection exists;
//! they are buffered and replayed the moment the connection is published.
//! Locally gathered candidates are batched into the answer for a short
//! window, then streamed one at a time through the callback registered with
//! [`Answerer::on_ice_candidate`].

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::AnswerConfig;
use crate::error::{RtcError, RtcResult};
use crate::offerer::close_quietly;
use crate::peer::{
    ConnectionFactory, ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerEvent,
};
use crate::ready::ReadySlot;
use crate::signaling::{Answer, Negotiation, Offer};

/// How locally gathered candidates are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Appended to the batch returned with the answer.
    Batching,
    /// Handed to the candidate callback one at a time.
    Streaming,
}

pub type CandidateCallback = Arc<dyn Fn(IceCandidate) + Send + Sync>;

struct AnswererState {
    connection: Option<Arc<dyn PeerConnection>>,
    on_candidate: Option<CandidateCallback>,
    pending: Vec<IceCandidate>,
    batch: Vec<IceCandidate>,
    regime: Regime,
    deadline: Option<Instant>,
    started: bool,
}

impl AnswererState {
    fn start_streaming(&mut self, cause: &'static str, session_id: &str) -> bool {
        if self.regime == Regime::Streaming {
            return false;
        }
        self.regime = Regime::Streaming;
        debug!(
            target = "webrtc",
            session_id,
            cause,
            batched = self.batch.len(),
            "answerer switched to streaming candidates"
        );
        true
    }
}

struct Inner {
    session_id: String,
    factory: Arc<dyn ConnectionFactory>,
    created_at: Instant,
    state: Mutex<AnswererState>,
    streaming: Notify,
    ready: ReadySlot<Arc<dyn DataChannel>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    fn on_local_candidate(&self, candidate: IceCandidate) {
        let callback = {
            let mut state = self.state.lock();
            if state.regime == Regime::Batching {
                let expired = state.deadline.is_some_and(|deadline| Instant::now() >= deadline);
                if !expired {
                    let host = candidate.is_host();
                    trace!(
                        target = "webrtc",
                        session_id = %self.session_id,
                        candidate = %candidate.candidate,
                        "batching local candidate"
                    );
                    state.batch.push(candidate);
                    if !host && state.start_streaming("non_host_candidate", &self.session_id) {
                        self.streaming.notify_one();
                    }
                    return;
                }
                if state.start_streaming("window_elapsed", &self.session_id) {
                    self.streaming.notify_one();
                }
            }
            state.on_candidate.clone()
        };
        match callback {
            Some(callback) => {
                trace!(
                    target = "webrtc",
                    session_id = %self.session_id,
                    candidate = %candidate.candidate,
                    "streaming local candidate"
                );
                callback(candidate);
            }
            None => warn!(
                target = "webrtc",
                session_id = %self.session_id,
                candidate = %candidate.candidate,
                "no candidate callback registered; dropping local candidate"
            ),
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

pub struct Answerer {
    inner: Arc<Inner>,
}

impl Answerer {
    pub fn new(session_id: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id: session_id.into(),
                factory,
                created_at: Instant::now(),
                state: Mutex::new(AnswererState {
                    connection: None,
                    on_candidate: None,
                    pending: Vec::new(),
                    batch: Vec::new(),
                    regime: Regime::Batching,
                    deadline: None,
                    started: false,
                }),
                streaming: Notify::new(),
                ready: ReadySlot::new(),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn regime(&self) -> Regime {
        self.inner.state.lock().regime
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.inner.state.lock().connection.clone()
    }

    /// Registers the delivery target for candidates gathered after the
    /// batching window. Must be installed before [`Answerer::answer`].
    pub fn on_ice_candidate<F>(&self, callback: F)
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        self.inner.state.lock().on_candidate = Some(Arc::new(callback));
    }

    /// Applies `offer`, produces the local answer and waits up to `window`
    /// for the startup candidates, which are returned with it. Gathering
    /// continues in the background after this returns.
    pub async fn answer(
        &self,
        config: &AnswerConfig,
        offer: Offer,
        window: Duration,
    ) -> RtcResult<Answer> {
        let deadline = Instant::now() + window;
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(RtcError::AlreadyStarted);
            }
            state.started = true;
            state.deadline = Some(deadline);
        }
        let session_id = self.inner.session_id.as_str();

        let handle = match self.inner.factory.connect(&config.peer_config()).await {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail(None, RtcError::negotiation("connect", err)).await),
        };
        let connection = handle.connection;
        debug!(target = "webrtc", session_id, "answerer connection constructed");
        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), handle.events));
        *self.inner.pump.lock() = Some(pump);

        if let Err(err) = connection.set_remote_description(offer.description).await {
            let err = RtcError::negotiation("set_remote_description", err);
            return Err(self.fail(Some(connection), err).await);
        }
        for candidate in offer.candidates {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                let err = RtcError::negotiation("add_ice_candidate", err);
                return Err(self.fail(Some(connection), err).await);
            }
        }

        let pending = {
            let mut state = self.inner.state.lock();
            state.connection = Some(Arc::clone(&connection));
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(
                target = "webrtc",
                session_id,
                count = pending.len(),
                "replaying buffered remote candidates"
            );
        }
        for candidate in pending {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                warn!(
                    target = "webrtc",
                    session_id,
                    error = %RtcError::StaleCandidate(err),
                    "buffered remote candidate rejected"
                );
            }
        }

        let description = match connection.create_answer().await {
            Ok(description) => description,
            Err(err) => {
                let err = RtcError::negotiation("create_answer", err);
                return Err(self.fail(Some(connection), err).await);
            }
        };
        if let Err(err) = connection.set_local_description(description.clone()).await {
            let err = RtcError::negotiation("set_local_description", err);
            return Err(self.fail(Some(connection), err).await);
        }

        let switched = self.inner.streaming.notified();
        if self.regime() == Regime::Batching {
            let _ = tokio::time::timeout_at(deadline, switched).await;
        }
        let batch = {
            let mut state = self.inner.state.lock();
            state.start_streaming("window_elapsed", session_id);
            std::mem::take(&mut state.batch)
        };
        debug!(target = "webrtc", session_id, candidates = batch.len(), "answer ready");
        Ok(Negotiation::new(description).with_candidates(batch))
    }

    /// Applies a remote candidate, or buffers it if the connection has not
    /// been published yet.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> RtcResult<()> {
        let connection = {
            let mut state = self.inner.state.lock();
            match state.connection.clone() {
                Some(connection) => connection,
                None => {
                    trace!(
                        target = "webrtc",
                        session_id = %self.inner.session_id,
                        candidate = %candidate.candidate,
                        "buffering remote candidate"
                    );
                    state.pending.push(candidate);
                    return Ok(());
                }
            }
        };
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
        self.inner.ready.fail("answerer closed");
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
        self.inner.ready.fail(err.to_string());
        self.inner.stop_pump();
        if let Some(connection) = connection {
            close_quietly(connection.as_ref()).await;
        }
        debug!(
            target = "webrtc",
            session_id = %self.inner.session_id,
            error = %err,
            "answer attempt failed"
        );
        err
    }
}

impl fmt::Debug for Answerer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Answerer")
            .field("session_id", &self.inner.session_id)
            .field("regime", &self.regime())
            .field("ready", &self.inner.ready.is_settled())
            .finish()
    }
}

async fn pump_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            PeerEvent::Candidate(candidate) => inner.on_local_candidate(candidate),
            PeerEvent::GatheringComplete => {
                debug!(
                    target = "webrtc",
                    session_id = %inner.session_id,
                    elapsed = ?inner.created_at.elapsed(),
                    "answerer gathering complete"
                );
            }
            PeerEvent::ChannelOpen(channel) => {
                let label = channel.label();
                if inner.ready.set(channel) {
                    debug!(
                        target = "webrtc",
                        session_id = %inner.session_id,
                        %label,
                        "answerer data channel ready"
                    );
                } else {
                    trace!(
                        target = "webrtc",
                        session_id = %inner.session_id,
                        %label,
                        "ignoring repeated channel open"
                    );
                }
            }
            PeerEvent::StateChanged(state) => {
                debug!(
                    target = "webrtc",
                    session_id = %inner.session_id,
                    %state,
                    "answerer connection state"
                );
                if matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                    inner.ready.fail(format!("peer connection {state}"));
                }
            }
        }
    }
}

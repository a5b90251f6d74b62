#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use transport_webrtc::peer::{CloseHandler, MessageHandler};
use transport_webrtc::{
    ChannelParams, ConnectionFactory, ConnectionState, DataChannel, IceCandidate, PeerConfig,
    PeerConnection, PeerError, PeerEvent, PeerHandle, SdpKind, SessionDescription,
};

pub fn host(n: u8) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 2130706431 10.0.0.{n} {} typ host",
        50000 + u16::from(n)
    ))
}

pub fn srflx(n: u8) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 1694498815 203.0.113.{n} {} typ srflx raddr 10.0.0.{n} rport 50000",
        51000 + u16::from(n)
    ))
}

pub fn relay(n: u8) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 16777215 198.51.100.{n} 3478 typ relay raddr 0.0.0.0 rport 0"
    ))
}

/// Behaviour of every connection a [`FakeFactory`] hands out.
#[derive(Clone, Default)]
pub struct Script {
    /// Emitted after `set_local_description`, each at its offset from that call.
    pub local_candidates: Vec<(Duration, IceCandidate)>,
    /// Primitive step that fails: `connect`, `create_offer`, `create_answer`,
    /// `set_local_description`, `set_remote_description`,
    /// `add_ice_candidate` or `create_data_channel`.
    pub fail_stage: Option<&'static str>,
    /// Candidate lines that `add_ice_candidate` rejects.
    pub reject: Vec<String>,
}

impl Script {
    pub fn candidate_at(mut self, millis: u64, candidate: IceCandidate) -> Self {
        self.local_candidates
            .push((Duration::from_millis(millis), candidate));
        self
    }

    pub fn fail_at(mut self, stage: &'static str) -> Self {
        self.fail_stage = Some(stage);
        self
    }

    pub fn reject(mut self, candidate: &IceCandidate) -> Self {
        self.reject.push(candidate.candidate.clone());
        self
    }
}

pub struct FakeFactory {
    script: Script,
    network: Option<Arc<FakeNetwork>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            network: None,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn on_network(script: Script, network: &Arc<FakeNetwork>) -> Arc<Self> {
        Arc::new(Self {
            script,
            network: Some(Arc::clone(network)),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub fn only(&self) -> Arc<FakeConnection> {
        let connections = self.connections.lock();
        assert_eq!(connections.len(), 1, "expected exactly one connection");
        Arc::clone(&connections[0])
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, config: &PeerConfig) -> Result<PeerHandle, PeerError> {
        if self.script.fail_stage == Some("connect") {
            return Err(PeerError::new("connect rejected"));
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        let connection = FakeConnection::new(
            self.script.clone(),
            events_tx,
            self.network.clone(),
            config.clone(),
        );
        self.connections.lock().push(Arc::clone(&connection));
        Ok(PeerHandle { connection, events })
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct FakeConnection {
    pub id: u64,
    pub config: PeerConfig,
    me: Weak<FakeConnection>,
    script: Script,
    events: mpsc::UnboundedSender<PeerEvent>,
    network: Option<Arc<FakeNetwork>>,
    applied: Mutex<Vec<IceCandidate>>,
    calls: Mutex<Vec<String>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    channel: Mutex<Option<Arc<FakeChannel>>>,
    closed: AtomicBool,
}

impl FakeConnection {
    fn new(
        script: Script,
        events: mpsc::UnboundedSender<PeerEvent>,
        network: Option<Arc<FakeNetwork>>,
        config: PeerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            me: me.clone(),
            script,
            events,
            network,
            applied: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn applied(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_channel(&self) -> Option<Arc<FakeChannel>> {
        self.channel.lock().clone()
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// Announces a fresh open channel and returns it.
    pub fn open_channel(&self, label: &str) -> Arc<FakeChannel> {
        let channel = FakeChannel::new(label);
        self.emit(PeerEvent::ChannelOpen(channel.clone()));
        channel
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    fn step(&self, stage: &str) -> Result<(), PeerError> {
        self.calls.lock().push(stage.to_string());
        if self.is_closed() {
            return Err(PeerError::new("connection closed"));
        }
        if self.script.fail_stage == Some(stage) {
            return Err(PeerError::new(format!("{stage} rejected")));
        }
        Ok(())
    }

    fn start_gathering(&self) {
        let events = self.events.clone();
        let candidates = self.script.local_candidates.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for (offset, candidate) in candidates {
                if !offset.is_zero() {
                    tokio::time::sleep_until(start + offset).await;
                }
                if events.send(PeerEvent::Candidate(candidate)).is_err() {
                    return;
                }
            }
            let _ = events.send(PeerEvent::GatheringComplete);
        });
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.step("create_offer")?;
        Ok(SessionDescription::offer(format!("fake-offer {}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.step("create_answer")?;
        if self.remote.lock().is_none() {
            return Err(PeerError::new("no remote offer"));
        }
        Ok(SessionDescription::answer(format!("fake-answer {}", self.id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.step("set_local_description")?;
        if let Some(network) = &self.network {
            network.register(&description.sdp, self.me.clone());
        }
        *self.local.lock() = Some(description);
        self.start_gathering();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.step("set_remote_description")?;
        let answered = description.kind == SdpKind::Answer;
        let sdp = description.sdp.clone();
        *self.remote.lock() = Some(description);
        if answered {
            if let (Some(network), Some(me)) = (&self.network, self.me.upgrade()) {
                network.link(&me, &sdp);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.step("add_ice_candidate")?;
        if self.remote.lock().is_none() {
            return Err(PeerError::new("remote description not set"));
        }
        if self.script.reject.contains(&candidate.candidate) {
            return Err(PeerError::new("candidate does not match any media section"));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        params: &ChannelParams,
    ) -> Result<Arc<dyn DataChannel>, PeerError> {
        self.step("create_data_channel")?;
        let channel = FakeChannel::new(&params.label);
        *self.channel.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<(), PeerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(PeerEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Pairs offering and answering connections by their session descriptions
/// and links their channels once the answer has been applied.
#[derive(Default)]
pub struct FakeNetwork {
    by_sdp: Mutex<HashMap<String, Weak<FakeConnection>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, sdp: &str, connection: Weak<FakeConnection>) {
        self.by_sdp.lock().insert(sdp.to_string(), connection);
    }

    fn link(&self, offerer: &Arc<FakeConnection>, answer_sdp: &str) {
        let answerer = self.by_sdp.lock().get(answer_sdp).and_then(Weak::upgrade);
        let (Some(answerer), Some(local)) = (answerer, offerer.local_channel()) else {
            return;
        };
        let remote = FakeChannel::new(&local.label);
        FakeChannel::link(&local, &remote);
        offerer.set_state(ConnectionState::Connected);
        answerer.set_state(ConnectionState::Connected);
        answerer.emit(PeerEvent::ChannelOpen(remote));
        offerer.emit(PeerEvent::ChannelOpen(local));
    }
}

pub struct FakeChannel {
    pub label: String,
    sent: Mutex<Vec<Bytes>>,
    fail_after: Mutex<Option<usize>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    peer: Mutex<Weak<FakeChannel>>,
    on_message: Mutex<Option<MessageHandler>>,
    on_close: Mutex<Option<CloseHandler>>,
    handler_installed: Notify,
    closed: AtomicBool,
}

impl FakeChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
            outbox: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            on_message: Mutex::new(None),
            on_close: Mutex::new(None),
            handler_installed: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Datagrams sent through one channel arrive, in order, at the other.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        for (from, to) in [(a, b), (b, a)] {
            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            *from.outbox.lock() = Some(tx);
            *from.peer.lock() = Arc::downgrade(to);
            let target = Arc::downgrade(to);
            tokio::spawn(async move {
                while let Some(datagram) = rx.recv().await {
                    let Some(target) = target.upgrade() else { break };
                    target.deliver(datagram).await;
                }
            });
        }
    }

    /// Sends succeed `limit` times, then fail.
    pub fn fail_after(&self, limit: usize) {
        *self.fail_after.lock() = Some(limit);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hands `datagram` to the message handler, waiting for one to be
    /// installed, and resolves once the handler has finished with it.
    pub async fn deliver(&self, datagram: Bytes) {
        let handled = loop {
            let installed = self.handler_installed.notified();
            let handled = {
                let mut handler = self.on_message.lock();
                handler.as_mut().map(|handler| handler(datagram.clone()))
            };
            match handled {
                Some(handled) => break handled,
                None => installed.await,
            }
        };
        handled.await;
    }

    pub async fn fire_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let closing = self.on_close.lock().as_mut().map(|handler| handler());
        if let Some(closing) = closing {
            closing.await;
        }
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, datagram: Bytes) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::new("data channel closed"));
        }
        {
            let mut sent = self.sent.lock();
            if let Some(limit) = *self.fail_after.lock() {
                if sent.len() >= limit {
                    return Err(PeerError::new("sctp send buffer full"));
                }
            }
            sent.push(datagram.clone());
        }
        if let Some(outbox) = self.outbox.lock().as_ref() {
            let _ = outbox.send(datagram);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.on_message.lock() = Some(handler);
        self.handler_installed.notify_waiters();
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.on_close.lock() = Some(handler);
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        self.outbox.lock().take();
        self.fire_close().await;
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.fire_close().await;
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::answerer::Answerer;
use crate::config::AnswerConfig;
use crate::error::{PeerError, RtcError, RtcResult};
use crate::peer::{ConnectionFactory, IceCandidate};
use crate::signaling::{Answer, Offer};

/// Called once for every newly created answerer, while the registry lock is
/// held. Must not call back into the registry.
pub type AnswererHook = Box<dyn Fn(&str, &Arc<Answerer>) + Send + Sync>;

#[derive(Default)]
struct Entries {
    live: HashMap<String, Arc<Answerer>>,
    /// Sessions evicted after finishing, with the time they were evicted.
    /// Late candidates for them are refused instead of opening a new entry.
    retired: HashMap<String, Instant>,
}

/// One [`Answerer`] per signaling session, created on first reference.
pub struct AnswererRegistry {
    factory: Arc<dyn ConnectionFactory>,
    trickle_window: Duration,
    entries: Mutex<Entries>,
    hook: RwLock<Option<AnswererHook>>,
}

impl AnswererRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>, trickle_window: Duration) -> Self {
        Self {
            factory,
            trickle_window,
            entries: Mutex::new(Entries::default()),
            hook: RwLock::new(None),
        }
    }

    pub fn on_answerer<F>(&self, hook: F)
    where
        F: Fn(&str, &Arc<Answerer>) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Box::new(hook));
    }

    /// Returns the session's answerer, creating it if needed. Creating one
    /// for a retired session id starts that session afresh.
    pub fn ensure(&self, session_id: &str) -> Arc<Answerer> {
        let mut entries = self.entries.lock();
        self.ensure_locked(&mut entries, session_id)
    }

    fn ensure_locked(&self, entries: &mut Entries, session_id: &str) -> Arc<Answerer> {
        if let Some(existing) = entries.live.get(session_id) {
            return Arc::clone(existing);
        }
        entries.retired.remove(session_id);
        let answerer = Arc::new(Answerer::new(session_id, Arc::clone(&self.factory)));
        entries
            .live
            .insert(session_id.to_string(), Arc::clone(&answerer));
        debug!(target = "webrtc", session_id, sessions = entries.live.len(), "answerer created");
        if let Some(hook) = self.hook.read().as_ref() {
            hook(session_id, &answerer);
        }
        answerer
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Answerer>> {
        self.entries.lock().live.get(session_id).cloned()
    }

    /// Hands a remote candidate to the session's answerer. Candidates for a
    /// retired session are refused as stale.
    pub async fn add_candidate(&self, session_id: &str, candidate: IceCandidate) -> RtcResult<()> {
        let answerer = {
            let mut entries = self.entries.lock();
            if !entries.live.contains_key(session_id) && entries.retired.contains_key(session_id) {
                trace!(target = "webrtc", session_id, "candidate for retired session");
                return Err(RtcError::StaleCandidate(PeerError::new(format!(
                    "session {session_id} already finished"
                ))));
            }
            self.ensure_locked(&mut entries, session_id)
        };
        answerer.add_ice_candidate(candidate).await
    }

    pub async fn handle_offer(
        &self,
        session_id: &str,
        offer: Offer,
        config: &AnswerConfig,
    ) -> RtcResult<Answer> {
        self.ensure(session_id)
            .answer(config, offer, self.trickle_window)
            .await
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Answerer>> {
        self.entries.lock().live.remove(session_id)
    }

    /// Retires `session_id` only while it still maps to `answerer`.
    pub fn remove_if_same(&self, session_id: &str, answerer: &Arc<Answerer>) -> bool {
        let mut entries = self.entries.lock();
        match entries.live.get(session_id) {
            Some(current) if Arc::ptr_eq(current, answerer) => {
                entries.live.remove(session_id);
                entries.retired.insert(session_id.to_string(), Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Retires entries created more than `max_age` ago and returns their ids.
    /// Live connections are not closed; only the directory entry goes away.
    /// Retired ids are forgotten once they have been retired for `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock();
        entries
            .retired
            .retain(|_, retired_at| now.saturating_duration_since(*retired_at) <= max_age);
        entries.live.retain(|session_id, answerer| {
            let keep = now.saturating_duration_since(answerer.created_at()) <= max_age;
            if !keep {
                evicted.push(session_id.clone());
            }
            keep
        });
        for session_id in &evicted {
            entries.retired.insert(session_id.clone(), now);
        }
        if !evicted.is_empty() {
            debug!(target = "webrtc", count = evicted.len(), "evicted stale sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().live.is_empty()
    }
}

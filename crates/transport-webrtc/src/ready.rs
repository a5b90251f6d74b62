use std::time::Duration;

use tokio::sync::watch;

use crate::error::{RtcError, RtcResult};

#[derive(Debug, Clone)]
enum SlotState<T> {
    Pending,
    Ready(T),
    Failed(String),
}

impl<T: Clone> SlotState<T> {
    fn is_settled(&self) -> bool {
        !matches!(self, SlotState::Pending)
    }

    fn outcome(&self) -> Option<RtcResult<T>> {
        match self {
            SlotState::Pending => None,
            SlotState::Ready(value) => Some(Ok(value.clone())),
            SlotState::Failed(reason) => Some(Err(RtcError::ConnectionFailed(reason.clone()))),
        }
    }
}

/// Once-settable delivery slot. The first `set` or `fail` wins; later calls
/// are no-ops. Every waiter observes the same outcome.
#[derive(Debug)]
pub struct ReadySlot<T> {
    state: watch::Sender<SlotState<T>>,
}

impl<T: Clone + Send + Sync> ReadySlot<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SlotState::Pending);
        Self { state }
    }

    /// Returns `true` if this call delivered the value.
    pub fn set(&self, value: T) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            *state = SlotState::Ready(value);
            true
        })
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.state.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            *state = SlotState::Failed(reason);
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().is_settled()
    }

    pub fn peek(&self) -> Option<RtcResult<T>> {
        self.state.borrow().outcome()
    }

    pub async fn wait(&self, timeout: Duration) -> RtcResult<T> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            let state = rx.wait_for(SlotState::is_settled).await.ok()?;
            state.outcome()
        })
        .await;
        match waited {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Err(RtcError::ChannelClosed),
            Err(_) => Err(RtcError::AttemptTimeout(timeout)),
        }
    }
}

impl<T: Clone + Send + Sync> Default for ReadySlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Signaling bus abstraction: topic pub/sub plus request/response procedures.
//!
//! The coordinator only needs two shapes of exchange from the bus: one
//! correlated call carrying an offer and returning an answer, and a
//! notification stream per direction carrying single candidates. Anything
//! that can provide those (a WAMP router, a websocket relay, an in-process
//! broadcast) can implement [`Bus`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("no procedure registered for {0}")]
    NoSuchProcedure(String),
    #[error("procedure {0} already registered")]
    ProcedureExists(String),
    #[error("procedure invocation failed: {0}")]
    Invocation(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Callee side of a request/response exchange.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn invoke(&self, payload: Bytes) -> BusResult<Bytes>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    fn register(&self, procedure: &str, handler: Arc<dyn Procedure>) -> BusResult<()>;
    /// Returns `true` if a procedure was registered under that name.
    fn unregister(&self, procedure: &str) -> bool;
    async fn call(&self, procedure: &str, payload: Bytes) -> BusResult<Bytes>;
}

/// Simple in-memory bus for tests and single-process deployments.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    procedures: RwLock<HashMap<String, Arc<dyn Procedure>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        match sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(_) => Ok(()),
            // pub/sub semantics: nobody listening is not an error
            Err(_) => {
                tracing::trace!(target = "bus", topic, "published with no subscribers");
                Ok(())
            }
        }
    }

    fn register(&self, procedure: &str, handler: Arc<dyn Procedure>) -> BusResult<()> {
        let mut guard = self.procedures.write();
        if guard.contains_key(procedure) {
            return Err(BusError::ProcedureExists(procedure.to_string()));
        }
        guard.insert(procedure.to_string(), handler);
        Ok(())
    }

    fn unregister(&self, procedure: &str) -> bool {
        self.procedures.write().remove(procedure).is_some()
    }

    async fn call(&self, procedure: &str, payload: Bytes) -> BusResult<Bytes> {
        let handler = self
            .procedures
            .read()
            .get(procedure)
            .cloned()
            .ok_or_else(|| BusError::NoSuchProcedure(procedure.to_string()))?;
        handler.invoke(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Procedure for Echo {
        async fn invoke(&self, payload: Bytes) -> BusResult<Bytes> {
            if payload.is_empty() {
                return Err(BusError::Invocation("empty request".into()));
            }
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("rtc.answerer.on_candidate");
        bus.publish("rtc.answerer.on_candidate", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "rtc.answerer.on_candidate");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        bus.publish("nobody.listens", Bytes::from_static(b"x"))
            .expect("publish ok");
    }

    #[tokio::test]
    async fn call_reaches_registered_procedure() {
        let bus = LocalBus::new();
        bus.register("rtc.offer", Arc::new(Echo)).expect("register");
        let reply = bus
            .call("rtc.offer", Bytes::from_static(b"offer"))
            .await
            .expect("call ok");
        assert_eq!(reply, Bytes::from_static(b"offer"));

        let err = bus
            .call("rtc.offer", Bytes::new())
            .await
            .expect_err("empty payload rejected");
        assert!(matches!(err, BusError::Invocation(_)));
    }

    #[tokio::test]
    async fn call_unknown_procedure_fails() {
        let bus = LocalBus::new();
        let err = bus
            .call("missing", Bytes::new())
            .await
            .expect_err("no procedure");
        assert!(matches!(err, BusError::NoSuchProcedure(name) if name == "missing"));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let bus = LocalBus::new();
        bus.register("rtc.offer", Arc::new(Echo)).expect("first");
        let err = bus
            .register("rtc.offer", Arc::new(Echo))
            .expect_err("second");
        assert!(matches!(err, BusError::ProcedureExists(_)));
        assert!(bus.unregister("rtc.offer"));
        bus.register("rtc.offer", Arc::new(Echo)).expect("after unregister");
    }
}

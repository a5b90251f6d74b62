//! Message-stream view over an open data channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::assembler::{MessageAssembler, chunk};
use crate::config::DEFAULT_PARTIAL_TIMEOUT;
use crate::error::{RtcError, RtcResult};
use crate::offerer::close_quietly;
use crate::peer::{DataChannel, PeerConnection};

type InboundSender = Arc<Mutex<Option<mpsc::Sender<Bytes>>>>;

pub struct PeerAdapter {
    channel: Arc<dyn DataChannel>,
    connection: Option<Arc<dyn PeerConnection>>,
    listener: Option<JoinHandle<()>>,
    max_segment_size: usize,
    inbound_tx: InboundSender,
    inbound_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    write_lock: AsyncMutex<()>,
}

impl PeerAdapter {
    pub fn new(channel: Arc<dyn DataChannel>, max_segment_size: usize) -> Self {
        Self::with_partial_timeout(channel, max_segment_size, DEFAULT_PARTIAL_TIMEOUT)
    }

    pub fn with_partial_timeout(
        channel: Arc<dyn DataChannel>,
        max_segment_size: usize,
        partial_timeout: Duration,
    ) -> Self {
        let assembler = MessageAssembler::new(max_segment_size);
        let max_segment_size = assembler.max_segment_size();
        let assembler = Arc::new(Mutex::new(assembler));
        // a reader that falls behind holds up the channel's message handler
        let (tx, rx) = mpsc::channel(1);
        let inbound_tx: InboundSender = Arc::new(Mutex::new(Some(tx)));
        let label = channel.label();

        let sender = Arc::clone(&inbound_tx);
        let handler_label = label.clone();
        channel.on_message(Box::new(move |datagram: Bytes| {
            let sender = sender.lock().clone();
            let assembler = Arc::clone(&assembler);
            let label = handler_label.clone();
            Box::pin(async move {
                let message = {
                    let mut assembler = assembler.lock();
                    let stale = assembler.discard_stale(Instant::now(), partial_timeout);
                    if let Some(dropped) = stale {
                        warn!(
                            target = "webrtc",
                            channel = %label,
                            dropped,
                            "discarding incomplete message"
                        );
                    }
                    match assembler.feed_datagram(&datagram) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(
                                target = "webrtc",
                                channel = %label,
                                frame_len = datagram.len(),
                                error = %err,
                                "dropping malformed frame"
                            );
                            None
                        }
                    }
                };
                let Some(message) = message else { return };
                trace!(
                    target = "webrtc",
                    channel = %label,
                    len = message.len(),
                    "message reassembled"
                );
                match sender {
                    Some(sender) => {
                        if sender.send(message).await.is_err() {
                            trace!(
                                target = "webrtc",
                                channel = %label,
                                "reader gone; message dropped"
                            );
                        }
                    }
                    None => trace!(
                        target = "webrtc",
                        channel = %label,
                        "adapter closed; message dropped"
                    ),
                }
            })
        }));

        let closer = Arc::clone(&inbound_tx);
        channel.on_close(Box::new(move || {
            let closer = Arc::clone(&closer);
            let label = label.clone();
            Box::pin(async move {
                closer.lock().take();
                trace!(target = "webrtc", channel = %label, "data channel closed");
            })
        }));

        Self {
            channel,
            connection: None,
            listener: None,
            max_segment_size,
            inbound_tx,
            inbound_rx: AsyncMutex::new(rx),
            write_lock: AsyncMutex::new(()),
        }
    }

    /// Closes `connection` together with the channel.
    pub fn with_connection(mut self, connection: Arc<dyn PeerConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Keeps a candidate listener running until the adapter closes.
    pub(crate) fn with_listener(mut self, listener: JoinHandle<()>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn label(&self) -> String {
        self.channel.label()
    }

    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }

    /// Next complete inbound message. [`RtcError::ChannelClosed`] once the
    /// channel has closed and every buffered message has been read.
    pub async fn read(&self) -> RtcResult<Bytes> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RtcError::ChannelClosed)
    }

    /// Sends `message` as an ordered run of frames. Concurrent writers are
    /// serialized per message. On failure the frames already sent stay sent.
    pub async fn write(&self, message: impl Into<Bytes>) -> RtcResult<()> {
        let _guard = self.write_lock.lock().await;
        let frames = chunk(message, self.max_segment_size);
        let total = frames.total();
        for (sent, frame) in frames.enumerate() {
            self.channel
                .send(frame.encode())
                .await
                .map_err(|source| RtcError::TransportWrite { sent, total, source })?;
        }
        trace!(target = "webrtc", frames = total, "message written");
        Ok(())
    }

    pub async fn close(&self) -> RtcResult<()> {
        self.inbound_tx.lock().take();
        if let Some(listener) = &self.listener {
            listener.abort();
        }
        let result = self.channel.close().await;
        if let Some(connection) = &self.connection {
            close_quietly(connection.as_ref()).await;
        }
        result.map_err(|err| RtcError::negotiation("close", err))
    }
}

impl Drop for PeerAdapter {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

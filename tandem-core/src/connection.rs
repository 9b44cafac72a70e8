//! The frame transport contract and two implementations.
//!
//! A [`Connection`] delivers frames in order in both directions. The node is
//! the only reader; any number of call tasks may send concurrently.

use crate::error::ConnectionError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_protocol::{FrameDecoder, FrameEncoder, RpcFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};

/// Read buffer size for byte-stream connections (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Ordered, bidirectional channel of frames.
pub trait Connection: Send + Sync + 'static {
    /// Sends one frame. Fails once the connection is closed.
    fn send(&self, frame: RpcFrame) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Receives the next frame, or `None` once the connection has ended.
    fn receive(&self) -> BoxFuture<'_, Result<Option<RpcFrame>, ConnectionError>>;

    /// Closes the connection. Calling it more than once has no further effect.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Resolves once `closed` flips to true.
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// In-memory connection backed by unbounded channels.
pub struct LoopbackConnection {
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<RpcFrame>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<RpcFrame>>,
    closed: watch::Sender<bool>,
}

impl LoopbackConnection {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(
        outbound: mpsc::UnboundedSender<RpcFrame>,
        inbound: mpsc::UnboundedReceiver<RpcFrame>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            outbound: parking_lot::Mutex::new(Some(outbound)),
            inbound: Mutex::new(inbound),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for LoopbackConnection {
    fn send(&self, frame: RpcFrame) -> BoxFuture<'_, Result<(), ConnectionError>> {
        let result = match self.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(frame).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        };
        futures::future::ready(result).boxed()
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<RpcFrame>, ConnectionError>> {
        let closed = self.closed.subscribe();
        async move {
            if *closed.borrow() {
                return Ok(None);
            }
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                frame = inbound.recv() => Ok(frame),
                _ = wait_closed(closed) => Ok(None),
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.outbound.lock().take();
        self.closed.send_replace(true);
        futures::future::ready(()).boxed()
    }
}

/// Connection over any byte stream, framed with binary envelopes.
pub struct StreamConnection<S> {
    writer: Mutex<Option<WriteHalf<S>>>,
    reader: Mutex<StreamReader<S>>,
    closed: watch::Sender<bool>,
    shut_down: AtomicBool,
}

struct StreamReader<S> {
    half: ReadHalf<S>,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            writer: Mutex::new(Some(write_half)),
            reader: Mutex::new(StreamReader {
                half: read_half,
                decoder: FrameDecoder::new(),
                buf: vec![0u8; READ_BUFFER_SIZE],
            }),
            closed,
            shut_down: AtomicBool::new(false),
        }
    }
}

impl<S> StreamReader<S>
where
    S: AsyncRead + Send,
{
    async fn next_frame(&mut self) -> Result<Option<RpcFrame>, ConnectionError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame()? {
                return Ok(Some(frame));
            }
            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(
                        "Stream ended with {} undecoded bytes",
                        self.decoder.buffered()
                    );
                }
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn send(&self, frame: RpcFrame) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            let encoded = FrameEncoder::encode(&frame)?;
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(ConnectionError::Closed)?;
            writer.write_all(&encoded).await?;
            writer.flush().await?;
            Ok(())
        }
        .boxed()
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<RpcFrame>, ConnectionError>> {
        let closed = self.closed.subscribe();
        async move {
            if *closed.borrow() {
                return Ok(None);
            }
            let mut reader = self.reader.lock().await;
            tokio::select! {
                frame = reader.next_frame() => frame,
                _ = wait_closed(closed) => Ok(None),
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            self.closed.send_replace(true);
            if let Some(mut writer) = self.writer.lock().await.take() {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Error shutting down stream: {}", e);
                }
            }
        }
        .boxed()
    }
}

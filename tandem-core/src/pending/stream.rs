//! Cold stream halves shared by the call shapes.
//!
//! A stream travels from a producer on one side to a consumer on the other.
//! The consumer decides when production starts (`Start`, sent on the first
//! poll) and may end it early (`Close`, sent when the stream is dropped
//! before it finished). The same halves serve the caller-produced stream of
//! upstream calls and the callee-produced stream of downstream calls; the
//! call shapes only pick the direction of the frames.

use crate::description::{EncodedError, EncodedStream, IncomingStream};
use crate::error::CallFailure;
use futures::{Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tandem_protocol::{RpcError, SerializedPayload, StreamEventKind, StreamOperation};
use tokio::sync::mpsc;

type Item = Result<SerializedPayload, CallFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    /// Not yet polled by the application.
    Pending,
    /// `Start` was sent; items are flowing.
    Started,
    /// The producer ended the stream.
    Completed,
    /// The application stopped consuming.
    Closed,
}

/// Receiving half, owned by the call task. Feeds decoded stream events to a
/// [`ColdReceiver`] held by the application.
pub(crate) struct ColdConsumer {
    items: Option<mpsc::UnboundedSender<Item>>,
    control: mpsc::UnboundedReceiver<StreamOperation>,
    control_open: bool,
    state: ConsumerState,
}

impl ColdConsumer {
    pub(crate) fn new() -> (Self, IncomingStream) {
        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let receiver = ColdReceiver {
            items: items_rx,
            control: control_tx,
            started: false,
            finished: false,
        };
        (
            Self {
                items: Some(items_tx),
                control: control_rx,
                control_open: true,
                state: ConsumerState::Pending,
            },
            receiver.boxed(),
        )
    }

    /// Whether [`ColdConsumer::control`] may still yield requests.
    pub(crate) fn has_control(&self) -> bool {
        self.control_open
    }

    /// Next request from the application side. `None` once the receiver is gone.
    pub(crate) async fn control(&mut self) -> Option<StreamOperation> {
        self.control.recv().await
    }

    /// Applies a request from the application side and returns the stream
    /// operation to send to the producer, if any.
    pub(crate) fn on_control(
        &mut self,
        request: Option<StreamOperation>,
    ) -> Option<StreamOperation> {
        match request {
            Some(StreamOperation::Start) if self.state == ConsumerState::Pending => {
                self.state = ConsumerState::Started;
                Some(StreamOperation::Start)
            }
            Some(StreamOperation::Start) => None,
            Some(StreamOperation::Close) => self.close(),
            None => {
                self.control_open = false;
                self.close()
            }
        }
    }

    /// Applies every request already queued without waiting for more.
    /// Returns the last operation to send, if any.
    pub(crate) fn drain_control(&mut self) -> Option<StreamOperation> {
        let mut last = None;
        while self.control_open {
            let request = match self.control.try_recv() {
                Ok(operation) => Some(operation),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => None,
            };
            if let Some(operation) = self.on_control(request) {
                last = Some(operation);
            }
        }
        last
    }

    fn close(&mut self) -> Option<StreamOperation> {
        match self.state {
            ConsumerState::Pending | ConsumerState::Started => {
                self.state = ConsumerState::Closed;
                self.items = None;
                Some(StreamOperation::Close)
            }
            ConsumerState::Completed | ConsumerState::Closed => None,
        }
    }

    /// Applies a `Data` event from the producer.
    pub(crate) fn on_data(
        &mut self,
        kind: StreamEventKind,
        payload: SerializedPayload,
    ) -> Result<(), String> {
        match self.state {
            ConsumerState::Pending => Err(format!("stream {:?} before Start", kind)),
            ConsumerState::Completed => Err(format!("stream {:?} after completion", kind)),
            // Items already in flight when the consumer closed.
            ConsumerState::Closed => Ok(()),
            ConsumerState::Started => {
                match kind {
                    StreamEventKind::Next => self.push(Ok(payload)),
                    StreamEventKind::Complete => self.finish(None),
                    StreamEventKind::Error => self.finish(Some(CallFailure::Remote(payload))),
                }
                Ok(())
            }
        }
    }

    /// Ends the stream with a failure, unless it already ended.
    pub(crate) fn fail(&mut self, failure: CallFailure) {
        if matches!(self.state, ConsumerState::Pending | ConsumerState::Started) {
            self.finish(Some(failure));
        }
    }

    #[cfg(test)]
    fn is_started(&self) -> bool {
        self.state == ConsumerState::Started
    }

    /// Whether the stream ended, either way.
    #[cfg(test)]
    fn is_finished(&self) -> bool {
        matches!(self.state, ConsumerState::Completed | ConsumerState::Closed)
    }

    /// Whether the producer ended the stream.
    pub(crate) fn is_completed(&self) -> bool {
        self.state == ConsumerState::Completed
    }

    fn push(&self, item: Item) {
        if let Some(items) = &self.items {
            // The receiver may be mid-drop; its Close request follows.
            let _ = items.send(item);
        }
    }

    fn finish(&mut self, failure: Option<CallFailure>) {
        if let Some(failure) = failure {
            self.push(Err(failure));
        }
        self.items = None;
        self.state = ConsumerState::Completed;
    }
}

/// Application-facing end of a cold stream.
struct ColdReceiver {
    items: mpsc::UnboundedReceiver<Item>,
    control: mpsc::UnboundedSender<StreamOperation>,
    started: bool,
    finished: bool,
}

impl Stream for ColdReceiver {
    type Item = Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if !this.started {
            this.started = true;
            let _ = this.control.send(StreamOperation::Start);
        }
        match this.items.poll_recv(cx) {
            Poll::Ready(Some(Ok(payload))) => Poll::Ready(Some(Ok(payload))),
            Poll::Ready(Some(Err(failure))) => {
                this.finished = true;
                Poll::Ready(Some(Err(failure)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ColdReceiver {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.control.send(StreamOperation::Close);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    /// Waiting for the consumer's `Start`.
    Waiting,
    Running,
    Done,
}

/// Outcome of a stream operation received by a producer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OperationOutcome {
    Started,
    /// Production stopped; it had been running if `was_running`.
    Closed { was_running: bool },
    AlreadyClosed,
    Violation(String),
}

/// Sending half, owned by the call task. Pulls items from a local stream
/// only while the consumer wants them.
pub(crate) struct ColdProducer {
    stream: EncodedStream,
    state: ProducerState,
}

impl ColdProducer {
    /// A panic while producing ends the stream with an internal error item.
    pub(crate) fn new(stream: EncodedStream) -> Self {
        let stream = AssertUnwindSafe(stream)
            .catch_unwind()
            .map(|item| {
                item.unwrap_or_else(|_| {
                    tracing::error!("stream implementation panicked");
                    Err(EncodedError::rpc(RpcError::internal(
                        "stream implementation panicked",
                    )))
                })
            })
            .boxed();
        Self {
            stream,
            state: ProducerState::Waiting,
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state == ProducerState::Waiting
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProducerState::Running
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ProducerState::Done
    }

    pub(crate) fn on_operation(&mut self, operation: StreamOperation) -> OperationOutcome {
        match (operation, self.state) {
            (StreamOperation::Start, ProducerState::Waiting) => {
                self.state = ProducerState::Running;
                OperationOutcome::Started
            }
            (StreamOperation::Start, ProducerState::Running) => {
                OperationOutcome::Violation("stream already started".to_string())
            }
            (StreamOperation::Start, ProducerState::Done) => {
                OperationOutcome::Violation("Start for a closed stream".to_string())
            }
            (StreamOperation::Close, ProducerState::Waiting) => {
                self.stop();
                OperationOutcome::Closed { was_running: false }
            }
            (StreamOperation::Close, ProducerState::Running) => {
                self.stop();
                OperationOutcome::Closed { was_running: true }
            }
            (StreamOperation::Close, ProducerState::Done) => OperationOutcome::AlreadyClosed,
        }
    }

    /// Next item of the local stream. Only meaningful while running.
    pub(crate) async fn next(&mut self) -> Option<Result<SerializedPayload, EncodedError>> {
        self.stream.next().await
    }

    /// Records a pulled item; the stream is done after an error or its end.
    pub(crate) fn on_item(&mut self, item: &Option<Result<SerializedPayload, EncodedError>>) {
        if !matches!(item, Some(Ok(_))) {
            self.stop();
        }
    }

    /// Drops the local stream, cancelling any production behind it.
    pub(crate) fn stop(&mut self) {
        self.state = ProducerState::Done;
        self.stream = futures::stream::empty().boxed();
    }
}

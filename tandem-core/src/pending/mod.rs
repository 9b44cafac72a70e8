//! Per-call state machines.
//!
//! Every in-flight call runs as its own task that owns the call's state and
//! an inbox of frames routed to it by the node. Frames for one reference are
//! therefore handled strictly in arrival order while different calls proceed
//! concurrently. The route is removed from the node's table when the task
//! ends, on every exit path.

pub(crate) mod bistream;
pub(crate) mod downstream;
pub(crate) mod single;
pub(crate) mod stream;
pub(crate) mod upstream;

use crate::error::{CallFailure, ConnectionError};
use crate::node::{NodeInner, Role, RouteGuard};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tandem_protocol::{
    DownstreamEvent, RpcError, RpcEvent, RpcFrame, RpcReference, SerializedPayload,
    ServiceCallIdentifier, StreamEventKind, StreamOperation, UpstreamEvent,
};
use tokio::sync::{mpsc, watch};

/// Cancels a call from outside the future awaiting it.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (signal, receiver) = watch::channel(false);
        (
            Self {
                signal: Arc::new(signal),
            },
            receiver,
        )
    }

    /// Requests cancellation. The call sends `Cancel` to the peer and
    /// completes with a cancellation failure without waiting for the peer.
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }
}

/// The eventual result of a call.
///
/// Dropping it before it completes cancels the call.
#[must_use = "a pending call is cancelled when dropped"]
pub struct PendingCall<T> {
    future: BoxFuture<'static, T>,
    cancel: CancelHandle,
}

impl<T: Send + 'static> PendingCall<T> {
    pub(crate) fn new(future: BoxFuture<'static, T>, cancel: CancelHandle) -> Self {
        Self { future, cancel }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn map<U, F>(self, f: F) -> PendingCall<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        PendingCall {
            future: self.future.map(f).boxed(),
            cancel: self.cancel,
        }
    }
}

impl<T> Future for PendingCall<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.future.as_mut().poll(cx)
    }
}

/// Resolves once cancellation was requested. Never resolves if the handle is
/// dropped without cancelling.
pub(crate) async fn cancelled(signal: &mut Option<watch::Receiver<bool>>) {
    let Some(receiver) = signal.as_mut() else {
        return futures::future::pending().await;
    };
    loop {
        let requested = *receiver.borrow_and_update();
        if requested {
            return;
        }
        if receiver.changed().await.is_err() {
            return futures::future::pending().await;
        }
    }
}

/// What a caller task observes next.
pub(crate) enum Signal {
    Frame(RpcFrame),
    Cancelled,
    Disconnected,
}

/// A call task's connection to its node: identity, inbox and route.
pub(crate) struct CallLink {
    pub(crate) node: Arc<NodeInner>,
    pub(crate) reference: RpcReference,
    pub(crate) call: ServiceCallIdentifier,
    role: Role,
    inbox: mpsc::UnboundedReceiver<RpcFrame>,
    cancel: Option<watch::Receiver<bool>>,
    _route: RouteGuard,
}

impl CallLink {
    pub(crate) fn new(
        node: Arc<NodeInner>,
        reference: RpcReference,
        call: ServiceCallIdentifier,
        role: Role,
        inbox: mpsc::UnboundedReceiver<RpcFrame>,
        cancel: Option<watch::Receiver<bool>>,
        route: RouteGuard,
    ) -> Self {
        Self {
            node,
            reference,
            call,
            role,
            inbox,
            cancel,
            _route: route,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| *c.borrow())
    }

    /// Waits for the next frame or a cancellation request.
    pub(crate) async fn next(&mut self) -> Signal {
        tokio::select! {
            frame = self.inbox.recv() => match frame {
                Some(frame) => Signal::Frame(frame),
                None => Signal::Disconnected,
            },
            _ = cancelled(&mut self.cancel) => Signal::Cancelled,
        }
    }

    /// Waits for the next frame only.
    pub(crate) async fn recv(&mut self) -> Option<RpcFrame> {
        self.inbox.recv().await
    }

    pub(crate) async fn send(
        &self,
        event: impl Into<RpcEvent>,
        payload: SerializedPayload,
    ) -> Result<(), ConnectionError> {
        let event = event.into();
        tracing::debug!(
            "[{}] <{}> {} -> {}",
            self.node.label,
            self.reference,
            self.call,
            event
        );
        self.node
            .send(RpcFrame::new(self.reference, event, payload))
            .await
    }

    /// Sends from the caller side, mapping a dead connection to a call failure.
    pub(crate) async fn send_upstream(
        &self,
        event: UpstreamEvent,
        payload: SerializedPayload,
    ) -> Result<(), CallFailure> {
        self.send(event, payload)
            .await
            .map_err(|_| CallFailure::ConnectionClosed)
    }

    pub(crate) async fn send_downstream(
        &self,
        event: DownstreamEvent,
        payload: SerializedPayload,
    ) -> Result<(), ConnectionError> {
        self.send(event, payload).await
    }

    /// Sends flow control for the stream the peer produces.
    pub(crate) async fn send_operation(
        &self,
        operation: StreamOperation,
    ) -> Result<(), ConnectionError> {
        let payload = SerializedPayload::empty();
        match self.role {
            Role::Caller => {
                self.send(UpstreamEvent::StreamOperation { operation }, payload)
                    .await
            }
            Role::Callee => {
                self.send(DownstreamEvent::StreamOperation { operation }, payload)
                    .await
            }
        }
    }

    /// Sends the engine error in this side's direction.
    pub(crate) async fn send_error(&self, error: RpcError) -> Result<(), ConnectionError> {
        let payload = error.to_payload().unwrap_or_default();
        match self.role {
            Role::Caller => self.send(UpstreamEvent::Error, payload).await,
            Role::Callee => self.send(DownstreamEvent::Error, payload).await,
        }
    }

    /// Reports a frame the current state does not accept. The call ends; the
    /// connection does not.
    pub(crate) async fn violation(&self, message: String) -> CallFailure {
        tracing::warn!(
            "[{}] <{}> {}: protocol violation: {}",
            self.node.label,
            self.reference,
            self.call,
            message
        );
        if let Err(e) = self
            .send_error(RpcError::protocol_violation(message.clone()))
            .await
        {
            tracing::debug!(
                "[{}] <{}> could not report violation: {}",
                self.node.label,
                self.reference,
                e
            );
        }
        CallFailure::ProtocolViolation(message)
    }

    pub(crate) fn warning(&self, frame: &RpcFrame) {
        let detail = frame
            .payload
            .decode::<serde_json::Value>()
            .map(|v| v.to_string())
            .unwrap_or_else(|_| format!("{:?}", frame.payload));
        tracing::warn!(
            "[{}] <{}> {}: peer warning: {}",
            self.node.label,
            self.reference,
            self.call,
            detail
        );
    }

    /// Keeps the reference for a short while after a stream finished so late
    /// frames from the peer are absorbed instead of reported as unknown.
    ///
    /// `expect_close` is set when the peer still owes a `Close`; the first
    /// one is then taken quietly and any further one is a duplicate.
    pub(crate) async fn linger(&mut self, mut expect_close: bool) {
        let linger = self.node.config.close_linger;
        if linger.is_zero() {
            return;
        }
        let expired = tokio::time::sleep(linger);
        tokio::pin!(expired);
        loop {
            let frame = tokio::select! {
                frame = self.inbox.recv() => frame,
                _ = &mut expired => return,
            };
            let Some(frame) = frame else { return };
            match frame.header.event {
                RpcEvent::Upstream(UpstreamEvent::StreamOperation {
                    operation: StreamOperation::Close,
                })
                | RpcEvent::Downstream(DownstreamEvent::StreamOperation {
                    operation: StreamOperation::Close,
                }) => {
                    if expect_close {
                        expect_close = false;
                    } else {
                        tracing::warn!(
                            "[{}] <{}> {}: stream already closed, ignoring Close",
                            self.node.label,
                            self.reference,
                            self.call
                        );
                    }
                }
                RpcEvent::Upstream(UpstreamEvent::Cancel) => return,
                RpcEvent::Upstream(UpstreamEvent::Warning)
                | RpcEvent::Downstream(DownstreamEvent::Warning) => self.warning(&frame),
                ref event => tracing::debug!(
                    "[{}] <{}> {}: discarding late {}",
                    self.node.label,
                    self.reference,
                    self.call,
                    event
                ),
            }
        }
    }
}

/// Stream event kind and payload for one produced item.
pub(crate) fn stream_event(
    item: Option<Result<SerializedPayload, crate::description::EncodedError>>,
) -> (StreamEventKind, SerializedPayload) {
    match item {
        Some(Ok(payload)) => (StreamEventKind::Next, payload),
        Some(Err(error)) => (StreamEventKind::Error, error.into_payload()),
        None => (StreamEventKind::Complete, SerializedPayload::empty()),
    }
}

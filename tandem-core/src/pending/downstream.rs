//! Cold downstream calls: one request in, a callee-produced stream out.

use super::single::cancel;
use super::stream::{ColdConsumer, ColdProducer, OperationOutcome};
use super::{stream_event, CallLink, Signal};
use crate::description::{DownstreamHandler, EncodedError, EncodedStream, IncomingStream};
use crate::error::CallFailure;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tandem_protocol::{
    DownstreamEvent, RpcError, RpcEvent, SerializedPayload, StreamEventKind, StreamOperation,
    UpstreamEvent,
};
use tokio::sync::oneshot;

pub(crate) type OpenResult = Result<IncomingStream, CallFailure>;

/// Caller: await exactly one `Opened` or `Error`, then hand out a lazy stream.
pub(crate) async fn run_caller(
    mut link: CallLink,
    payload: SerializedPayload,
    mut result: oneshot::Sender<OpenResult>,
) {
    if link.is_cancelled() {
        let _ = result.send(Err(CallFailure::Cancelled));
        return;
    }
    let open = UpstreamEvent::Open {
        call: link.call.clone(),
    };
    if let Err(failure) = link.send_upstream(open, payload).await {
        let _ = result.send(Err(failure));
        return;
    }

    loop {
        let signal = tokio::select! {
            signal = link.next() => signal,
            _ = result.closed() => Signal::Cancelled,
        };
        let frame = match signal {
            Signal::Frame(frame) => frame,
            Signal::Cancelled => {
                let _ = result.send(cancel(&link).await);
                return;
            }
            Signal::Disconnected => {
                let _ = result.send(Err(CallFailure::ConnectionClosed));
                return;
            }
        };
        match frame.header.event {
            RpcEvent::Downstream(DownstreamEvent::Opened) => break,
            RpcEvent::Downstream(DownstreamEvent::Error) => {
                let _ = result.send(Err(CallFailure::Remote(frame.payload)));
                return;
            }
            RpcEvent::Downstream(DownstreamEvent::Warning) => link.warning(&frame),
            event => {
                let failure = link
                    .violation(format!("unexpected {} before Opened", event))
                    .await;
                let _ = result.send(Err(failure));
                return;
            }
        }
    }

    let (consumer, incoming) = ColdConsumer::new();
    if result.send(Ok(incoming)).is_err() {
        // Abandoned between Opened and delivery; the dropped stream never started.
        let _ = cancel::<()>(&link).await;
        return;
    }
    consume(link, consumer).await;
}

/// Routes the callee's stream events into the consumer until the stream ends.
async fn consume(mut link: CallLink, mut consumer: ColdConsumer) {
    loop {
        tokio::select! {
            request = consumer.control(), if consumer.has_control() => {
                if let Some(operation) = consumer.on_control(request) {
                    if link.send_operation(operation).await.is_err() {
                        return;
                    }
                    if operation == StreamOperation::Close {
                        link.linger(false).await;
                        return;
                    }
                }
            }
            signal = link.next() => {
                if !on_stream_signal(&link, &mut consumer, signal).await {
                    return;
                }
                if consumer.is_completed() {
                    acknowledge_completion(&link).await;
                    return;
                }
            }
        }
    }
}

/// Applies one signal to the caller's view of the callee stream. Returns
/// whether the call continues.
pub(crate) async fn on_stream_signal(
    link: &CallLink,
    consumer: &mut ColdConsumer,
    signal: Signal,
) -> bool {
    let frame = match signal {
        Signal::Frame(frame) => frame,
        Signal::Cancelled => {
            consumer.fail(CallFailure::Cancelled);
            let _ = cancel::<()>(link).await;
            return false;
        }
        Signal::Disconnected => {
            consumer.fail(CallFailure::ConnectionClosed);
            return false;
        }
    };
    match frame.header.event {
        RpcEvent::Downstream(DownstreamEvent::Data { event }) => {
            if let Err(message) = consumer.on_data(event, frame.payload) {
                let failure = link.violation(message).await;
                consumer.fail(failure);
                return false;
            }
            true
        }
        RpcEvent::Downstream(DownstreamEvent::Error) => {
            consumer.fail(CallFailure::Remote(frame.payload));
            false
        }
        RpcEvent::Downstream(DownstreamEvent::Warning) => {
            link.warning(&frame);
            true
        }
        event => {
            let failure = link
                .violation(format!("unexpected {} while streaming", event))
                .await;
            consumer.fail(failure);
            false
        }
    }
}

/// The callee finished its stream; tell it the caller is done as well.
pub(crate) async fn acknowledge_completion(link: &CallLink) {
    let close = UpstreamEvent::StreamOperation {
        operation: StreamOperation::Close,
    };
    if let Err(e) = link.send(close, SerializedPayload::empty()).await {
        tracing::debug!(
            "[{}] <{}> could not acknowledge completion: {}",
            link.node.label,
            link.reference,
            e
        );
    }
}

/// Runs a callee implementation until it yields its stream. Returns `None`
/// if the call ended before that.
async fn open_stream(
    link: &mut CallLink,
    handler: DownstreamHandler,
    payload: SerializedPayload,
) -> Option<EncodedStream> {
    let mut opening = AssertUnwindSafe(async move { handler(payload).await })
        .catch_unwind()
        .boxed();
    loop {
        tokio::select! {
            outcome = &mut opening => {
                let failure = match outcome {
                    Ok(Ok(stream)) => return Some(stream),
                    Ok(Err(error)) => error,
                    Err(_) => {
                        tracing::error!(
                            "[{}] <{}> {}: implementation panicked",
                            link.node.label,
                            link.reference,
                            link.call
                        );
                        EncodedError::rpc(RpcError::internal(format!("{} panicked", link.call)))
                    }
                };
                let reply = link.send_downstream(DownstreamEvent::Error, failure.into_payload());
                if let Err(e) = reply.await {
                    tracing::debug!(
                        "[{}] <{}> could not reply: {}",
                        link.node.label,
                        link.reference,
                        e
                    );
                }
                return None;
            }
            frame = link.recv() => {
                let frame = frame?;
                match frame.header.event {
                    RpcEvent::Upstream(UpstreamEvent::Cancel | UpstreamEvent::Error) => {
                        tracing::debug!(
                            "[{}] <{}> {}: aborted by caller",
                            link.node.label,
                            link.reference,
                            link.call
                        );
                        return None;
                    }
                    RpcEvent::Upstream(UpstreamEvent::Warning) => link.warning(&frame),
                    event => {
                        link.violation(format!("unexpected {} before Opened", event)).await;
                        return None;
                    }
                }
            }
        }
    }
}

/// Callee stream: `Created -> Opened -> Started -> Closed`.
///
/// From `Opened` the caller has the configured window to send `Start`,
/// after which the callee reports a stream timeout and releases the call.
pub(crate) async fn run_callee(
    mut link: CallLink,
    handler: DownstreamHandler,
    payload: SerializedPayload,
) {
    let Some(stream) = open_stream(&mut link, handler, payload).await else {
        return;
    };
    if link
        .send_downstream(DownstreamEvent::Opened, SerializedPayload::empty())
        .await
        .is_err()
    {
        return;
    }

    let window = link.node.config.stream_start_timeout;
    // `sleep` saturates windows too large to represent as a deadline.
    let start_timeout = tokio::time::sleep(window);
    tokio::pin!(start_timeout);
    let mut producer = ColdProducer::new(stream);

    loop {
        tokio::select! {
            _ = &mut start_timeout, if producer.is_waiting() => {
                tracing::warn!(
                    "[{}] <{}> {}: stream not started within {:?}",
                    link.node.label, link.reference, link.call, window
                );
                producer.stop();
                if let Err(e) = link.send_error(RpcError::stream_timeout(window)).await {
                    tracing::debug!(
                        "[{}] <{}> could not report timeout: {}",
                        link.node.label,
                        link.reference,
                        e
                    );
                }
                // A Start or Close may already be on its way.
                link.linger(true).await;
                return;
            }
            item = producer.next(), if producer.is_running() => {
                producer.on_item(&item);
                let (kind, payload) = stream_event(item);
                let data = DownstreamEvent::Data { event: kind };
                if link.send_downstream(data, payload).await.is_err() {
                    return;
                }
                if producer.is_done() {
                    link.linger(kind != StreamEventKind::Next).await;
                    return;
                }
            }
            frame = link.recv() => {
                let Some(frame) = frame else {
                    tracing::debug!(
                        "[{}] <{}> connection closed while streaming",
                        link.node.label,
                        link.reference
                    );
                    return;
                };
                match frame.header.event {
                    RpcEvent::Upstream(UpstreamEvent::StreamOperation { operation }) => {
                        match producer.on_operation(operation) {
                            OperationOutcome::Started => tracing::debug!(
                                "[{}] <{}> {}: stream started",
                                link.node.label,
                                link.reference,
                                link.call
                            ),
                            OperationOutcome::Closed { was_running } => {
                                tracing::debug!(
                                    "[{}] <{}> {}: stream closed by caller (running: {})",
                                    link.node.label, link.reference, link.call, was_running
                                );
                                link.linger(false).await;
                                return;
                            }
                            OperationOutcome::AlreadyClosed => tracing::warn!(
                                "[{}] <{}> {}: stream already closed, ignoring Close",
                                link.node.label, link.reference, link.call
                            ),
                            OperationOutcome::Violation(message) => {
                                link.violation(message).await;
                                return;
                            }
                        }
                    }
                    RpcEvent::Upstream(UpstreamEvent::Cancel | UpstreamEvent::Error) => {
                        tracing::debug!(
                            "[{}] <{}> {}: aborted by caller",
                            link.node.label,
                            link.reference,
                            link.call
                        );
                        return;
                    }
                    RpcEvent::Upstream(UpstreamEvent::Warning) => link.warning(&frame),
                    event => {
                        link.violation(format!("unexpected {} in a downstream call", event)).await;
                        return;
                    }
                }
            }
        }
    }
}

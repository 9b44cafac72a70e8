//! Cold bistream calls: a caller-produced stream in, a callee-produced stream out.
//!
//! Both directions follow the cold stream rules independently. The call ends
//! with the callee's stream; the caller's stream is dropped at that point.

use super::downstream::{acknowledge_completion, on_stream_signal, OpenResult};
use super::single::cancel;
use super::stream::{ColdConsumer, ColdProducer, OperationOutcome};
use super::{stream_event, CallLink, Signal};
use crate::description::{BistreamHandler, EncodedError, EncodedStream};
use crate::error::CallFailure;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tandem_protocol::{
    DownstreamEvent, RpcError, RpcEvent, SerializedPayload, StreamEventKind, StreamOperation,
    UpstreamEvent,
};
use tokio::sync::oneshot;

/// Sends one item of the caller's stream.
async fn forward_item(
    link: &CallLink,
    producer: &mut ColdProducer,
    item: Option<Result<SerializedPayload, EncodedError>>,
) -> Result<(), CallFailure> {
    producer.on_item(&item);
    let (kind, payload) = stream_event(item);
    link.send_upstream(UpstreamEvent::Data { event: kind }, payload)
        .await
}

/// Applies the callee's `Start`/`Close` to the caller's stream.
async fn steer(
    link: &CallLink,
    producer: &mut ColdProducer,
    operation: StreamOperation,
) -> Result<(), CallFailure> {
    match producer.on_operation(operation) {
        OperationOutcome::Violation(message) => Err(link.violation(message).await),
        OperationOutcome::Closed { was_running } => {
            tracing::debug!(
                "[{}] <{}> {}: callee closed the upstream (running: {})",
                link.node.label,
                link.reference,
                link.call,
                was_running
            );
            Ok(())
        }
        OperationOutcome::Started | OperationOutcome::AlreadyClosed => Ok(()),
    }
}

/// Caller: stream in once the callee starts it, await `Opened`, then consume.
pub(crate) async fn run_caller(
    mut link: CallLink,
    payload: SerializedPayload,
    local: EncodedStream,
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

    let mut producer = ColdProducer::new(local);
    let opened = loop {
        tokio::select! {
            item = producer.next(), if producer.is_running() => {
                if let Err(failure) = forward_item(&link, &mut producer, item).await {
                    break Err(failure);
                }
            }
            signal = link.next() => {
                let frame = match signal {
                    Signal::Frame(frame) => frame,
                    Signal::Cancelled => break cancel(&link).await,
                    Signal::Disconnected => break Err(CallFailure::ConnectionClosed),
                };
                match frame.header.event {
                    RpcEvent::Downstream(DownstreamEvent::StreamOperation { operation }) => {
                        if let Err(failure) = steer(&link, &mut producer, operation).await {
                            break Err(failure);
                        }
                    }
                    RpcEvent::Downstream(DownstreamEvent::Opened) => break Ok(()),
                    RpcEvent::Downstream(DownstreamEvent::Error) => {
                        break Err(CallFailure::Remote(frame.payload))
                    }
                    RpcEvent::Downstream(DownstreamEvent::Warning) => link.warning(&frame),
                    event => {
                        break Err(link
                            .violation(format!("unexpected {} before Opened", event))
                            .await)
                    }
                }
            }
            _ = result.closed() => break cancel(&link).await,
        }
    };
    if let Err(failure) = opened {
        let _ = result.send(Err(failure));
        return;
    }

    let (mut consumer, incoming) = ColdConsumer::new();
    if result.send(Ok(incoming)).is_err() {
        let _ = cancel::<()>(&link).await;
        return;
    }

    loop {
        tokio::select! {
            item = producer.next(), if producer.is_running() => {
                if let Err(failure) = forward_item(&link, &mut producer, item).await {
                    consumer.fail(failure);
                    return;
                }
            }
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
                if let Signal::Frame(frame) = &signal {
                    if let RpcEvent::Downstream(DownstreamEvent::StreamOperation { operation }) =
                        frame.header.event
                    {
                        if let Err(failure) = steer(&link, &mut producer, operation).await {
                            consumer.fail(failure);
                            return;
                        }
                        continue;
                    }
                }
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

/// Forwards the implementation's pending requests on the caller's stream.
async fn forward_control(link: &CallLink, consumer: &mut ColdConsumer) -> bool {
    match consumer.drain_control() {
        Some(operation) => link
            .send_downstream(
                DownstreamEvent::StreamOperation { operation },
                SerializedPayload::empty(),
            )
            .await
            .is_ok(),
        None => true,
    }
}

/// Callee: the implementation receives the caller's stream while it opens
/// its own, and keeps receiving it while its own stream runs.
pub(crate) async fn run_callee(
    mut link: CallLink,
    handler: BistreamHandler,
    payload: SerializedPayload,
) {
    let (mut consumer, incoming) = ColdConsumer::new();
    let mut opening = AssertUnwindSafe(async move { handler(payload, incoming).await })
        .catch_unwind()
        .boxed();

    let stream = loop {
        tokio::select! {
            outcome = &mut opening => {
                let failure = match outcome {
                    Ok(Ok(stream)) => break stream,
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
                if !forward_control(&link, &mut consumer).await {
                    return;
                }
                let reply = link.send_downstream(DownstreamEvent::Error, failure.into_payload());
                if let Err(e) = reply.await {
                    tracing::debug!(
                        "[{}] <{}> could not reply: {}",
                        link.node.label,
                        link.reference,
                        e
                    );
                }
                return;
            }
            request = consumer.control(), if consumer.has_control() => {
                if let Some(operation) = consumer.on_control(request) {
                    if link.send_operation(operation).await.is_err() {
                        return;
                    }
                }
            }
            frame = link.recv() => {
                let Some(frame) = frame else {
                    consumer.fail(CallFailure::ConnectionClosed);
                    return;
                };
                match frame.header.event {
                    RpcEvent::Upstream(UpstreamEvent::Data { event }) => {
                        if let Err(message) = consumer.on_data(event, frame.payload) {
                            consumer.fail(CallFailure::ProtocolViolation(message.clone()));
                            link.violation(message).await;
                            return;
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
                        link.violation(format!("unexpected {} before Opened", event)).await;
                        return;
                    }
                }
            }
        }
    };
    drop(opening);

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
                if producer.is_done() && !forward_control(&link, &mut consumer).await {
                    return;
                }
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
            request = consumer.control(), if consumer.has_control() => {
                if let Some(operation) = consumer.on_control(request) {
                    if link.send_operation(operation).await.is_err() {
                        return;
                    }
                }
            }
            frame = link.recv() => {
                let Some(frame) = frame else {
                    consumer.fail(CallFailure::ConnectionClosed);
                    return;
                };
                match frame.header.event {
                    RpcEvent::Upstream(UpstreamEvent::Data { event }) => {
                        if let Err(message) = consumer.on_data(event, frame.payload) {
                            consumer.fail(CallFailure::ProtocolViolation(message.clone()));
                            link.violation(message).await;
                            return;
                        }
                    }
                    RpcEvent::Upstream(UpstreamEvent::StreamOperation { operation }) => {
                        match producer.on_operation(operation) {
                            OperationOutcome::Started => {}
                            OperationOutcome::Closed { .. } => {
                                forward_control(&link, &mut consumer).await;
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
                        link.violation(format!("unexpected {} in a bistream call", event)).await;
                        return;
                    }
                }
            }
        }
    }
}

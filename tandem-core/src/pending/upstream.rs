//! Cold upstream calls: the caller streams items in, the callee answers once.

use super::single::{cancel, completion, SingleResult};
use super::stream::{ColdConsumer, ColdProducer, OperationOutcome};
use super::{stream_event, CallLink, Signal};
use crate::description::{EncodedStream, UpstreamHandler};
use crate::error::CallFailure;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tandem_protocol::{DownstreamEvent, RpcEvent, SerializedPayload, UpstreamEvent};
use tokio::sync::oneshot;

/// Caller: `Opening -> StreamNotStarted -> Streaming -> AwaitingResponse -> Done`.
///
/// The local stream is only pulled after the callee sent `Start`, and is
/// dropped as soon as the callee sends `Close`.
pub(crate) async fn run_caller(
    mut link: CallLink,
    payload: SerializedPayload,
    local: EncodedStream,
    mut result: oneshot::Sender<SingleResult>,
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
    let outcome = loop {
        tokio::select! {
            item = producer.next(), if producer.is_running() => {
                producer.on_item(&item);
                let (kind, payload) = stream_event(item);
                let data = UpstreamEvent::Data { event: kind };
                if let Err(failure) = link.send_upstream(data, payload).await {
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
                        match producer.on_operation(operation) {
                            OperationOutcome::Violation(message) => {
                                break Err(link.violation(message).await)
                            }
                            OperationOutcome::Closed { was_running } => tracing::debug!(
                                "[{}] <{}> {}: callee closed the stream (running: {})",
                                link.node.label, link.reference, link.call, was_running
                            ),
                            OperationOutcome::Started | OperationOutcome::AlreadyClosed => {}
                        }
                    }
                    RpcEvent::Downstream(DownstreamEvent::Response) => break Ok(frame.payload),
                    RpcEvent::Downstream(DownstreamEvent::Error) => {
                        break Err(CallFailure::Remote(frame.payload))
                    }
                    RpcEvent::Downstream(DownstreamEvent::Warning) => link.warning(&frame),
                    event => {
                        break Err(link
                            .violation(format!("unexpected {} in an upstream call", event))
                            .await)
                    }
                }
            }
            _ = result.closed() => break cancel(&link).await,
        }
    };
    let _ = result.send(outcome);
}

/// Callee: decode, hand the implementation a cold stream, answer once.
///
/// `Start` is sent when the implementation first polls the stream, `Close`
/// when it drops the stream early. Items arriving after that are discarded.
pub(crate) async fn run_callee(
    mut link: CallLink,
    handler: UpstreamHandler,
    payload: SerializedPayload,
) {
    let (mut consumer, incoming) = ColdConsumer::new();
    let mut execution = AssertUnwindSafe(async move { handler(payload, incoming).await })
        .catch_unwind()
        .boxed();

    loop {
        tokio::select! {
            outcome = &mut execution => {
                // The implementation dropped the stream; forward its Close first.
                if let Some(operation) = consumer.drain_control() {
                    if link.send_operation(operation).await.is_err() {
                        return;
                    }
                }
                let (event, payload) = completion(outcome, &link);
                if let Err(e) = link.send_downstream(event, payload).await {
                    tracing::debug!(
                        "[{}] <{}> could not reply: {}",
                        link.node.label,
                        link.reference,
                        e
                    );
                    return;
                }
                if !consumer.is_completed() {
                    link.linger(false).await;
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
                    tracing::debug!(
                        "[{}] <{}> connection closed while executing",
                        link.node.label,
                        link.reference
                    );
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
                        link.violation(format!("unexpected {} in an upstream call", event)).await;
                        return;
                    }
                }
            }
        }
    }
}

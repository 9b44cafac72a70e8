//! Single calls: one request, one response.

use super::{CallLink, Signal};
use crate::description::{EncodedError, SingleHandler};
use crate::error::CallFailure;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tandem_protocol::{DownstreamEvent, RpcError, RpcEvent, SerializedPayload, UpstreamEvent};
use tokio::sync::oneshot;

pub(crate) type SingleResult = Result<SerializedPayload, CallFailure>;

/// Caller: `Idle -> AwaitingResponse -> Done`.
pub(crate) async fn run_caller(
    mut link: CallLink,
    payload: SerializedPayload,
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

    let outcome = loop {
        let signal = tokio::select! {
            signal = link.next() => signal,
            _ = result.closed() => Signal::Cancelled,
        };
        let frame = match signal {
            Signal::Frame(frame) => frame,
            Signal::Cancelled => break cancel(&link).await,
            Signal::Disconnected => break Err(CallFailure::ConnectionClosed),
        };
        match frame.header.event {
            RpcEvent::Downstream(DownstreamEvent::Response) => break Ok(frame.payload),
            RpcEvent::Downstream(DownstreamEvent::Error) => {
                break Err(CallFailure::Remote(frame.payload))
            }
            RpcEvent::Downstream(DownstreamEvent::Warning) => link.warning(&frame),
            event => {
                break Err(link
                    .violation(format!("unexpected {} in a single call", event))
                    .await)
            }
        }
    };
    let _ = result.send(outcome);
}

/// Sends `Cancel` and yields the local cancellation result.
pub(crate) async fn cancel<T>(link: &CallLink) -> Result<T, CallFailure> {
    tracing::debug!(
        "[{}] <{}> {}: cancelled by caller",
        link.node.label,
        link.reference,
        link.call
    );
    if let Err(e) = link
        .send(UpstreamEvent::Cancel, SerializedPayload::empty())
        .await
    {
        tracing::debug!("[{}] <{}> could not send Cancel: {}", link.node.label, link.reference, e);
    }
    Err(CallFailure::Cancelled)
}

/// Encodes the outcome of a callee implementation into the final frame.
pub(crate) fn completion(
    outcome: std::thread::Result<Result<SerializedPayload, EncodedError>>,
    link: &CallLink,
) -> (DownstreamEvent, SerializedPayload) {
    match outcome {
        Ok(Ok(response)) => (DownstreamEvent::Response, response),
        Ok(Err(error)) => (DownstreamEvent::Error, error.into_payload()),
        Err(_) => {
            tracing::error!(
                "[{}] <{}> {}: implementation panicked",
                link.node.label,
                link.reference,
                link.call
            );
            (
                DownstreamEvent::Error,
                EncodedError::rpc(RpcError::internal(format!("{} panicked", link.call)))
                    .into_payload(),
            )
        }
    }
}

/// Callee: `Idle -> Executing -> Done`.
pub(crate) async fn run_callee(
    mut link: CallLink,
    handler: SingleHandler,
    payload: SerializedPayload,
) {
    let mut execution = AssertUnwindSafe(async move { handler(payload).await })
        .catch_unwind()
        .boxed();

    loop {
        tokio::select! {
            outcome = &mut execution => {
                let (event, payload) = completion(outcome, &link);
                if let Err(e) = link.send_downstream(event, payload).await {
                    tracing::debug!(
                        "[{}] <{}> could not reply: {}",
                        link.node.label,
                        link.reference,
                        e
                    );
                }
                return;
            }
            frame = link.recv() => {
                let Some(frame) = frame else {
                    tracing::debug!(
                        "[{}] <{}> connection closed while executing",
                        link.node.label,
                        link.reference
                    );
                    return;
                };
                match frame.header.event {
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
                        link.violation(format!("unexpected {} in a single call", event)).await;
                        return;
                    }
                }
            }
        }
    }
}

//! Extensions and the interceptor chain.
//!
//! An extension may wrap every call a node performs (outgoing) and every call
//! it executes on behalf of the peer (incoming), per call shape. Extensions
//! run in registration order: the first registered is the outermost.

use crate::description::{EncodedError, EncodedStream, IncomingStream, ServiceDescription};
use crate::error::{CallFailure, DescriptionError};
use crate::node::WeakRpcTransport;
use futures::future::BoxFuture;
use std::sync::Arc;
use tandem_protocol::{SerializedPayload, ServiceCallIdentifier};

/// The rest of the chain. Consumed by calling it, so it runs at most once;
/// an interceptor that never calls it short-circuits the call.
pub type Next<In, Out> = Box<dyn FnOnce(In) -> BoxFuture<'static, Out> + Send>;

/// Caller-side result of a call answered with one response.
pub type CallOutcome = Result<SerializedPayload, CallFailure>;
/// Caller-side result of a call answered with a stream.
pub type StreamOutcome = Result<IncomingStream, CallFailure>;
/// Callee-side result of an implementation answering with one response.
pub type Execution = Result<SerializedPayload, EncodedError>;
/// Callee-side result of an implementation answering with a stream.
pub type StreamExecution = Result<EncodedStream, EncodedError>;

/// Request plus the caller's stream.
pub type OutgoingStreamInput = (SerializedPayload, EncodedStream);
/// Request plus the stream received from the caller.
pub type IncomingStreamInput = (SerializedPayload, IncomingStream);

/// A node extension. Every interception point defaults to passing through.
pub trait RpcExtension: Send + Sync + 'static {
    /// Stable name, used in logs.
    fn identifier(&self) -> &str;

    /// Services this extension adds to the node it is installed on. They take
    /// precedence over the shared registry.
    fn provided_services(self: Arc<Self>) -> Result<Vec<ServiceDescription>, DescriptionError> {
        Ok(Vec::new())
    }

    /// Called once the node exists, before it handles any frame.
    fn bind(&self, _transport: WeakRpcTransport) {}

    fn intercept_outgoing_single(
        &self,
        _call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, CallOutcome>,
    ) -> BoxFuture<'static, CallOutcome> {
        next(payload)
    }

    fn intercept_outgoing_upstream(
        &self,
        _call: &ServiceCallIdentifier,
        input: OutgoingStreamInput,
        next: Next<OutgoingStreamInput, CallOutcome>,
    ) -> BoxFuture<'static, CallOutcome> {
        next(input)
    }

    fn intercept_outgoing_downstream(
        &self,
        _call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, StreamOutcome>,
    ) -> BoxFuture<'static, StreamOutcome> {
        next(payload)
    }

    fn intercept_outgoing_bistream(
        &self,
        _call: &ServiceCallIdentifier,
        input: OutgoingStreamInput,
        next: Next<OutgoingStreamInput, StreamOutcome>,
    ) -> BoxFuture<'static, StreamOutcome> {
        next(input)
    }

    fn intercept_incoming_single(
        &self,
        _call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, Execution>,
    ) -> BoxFuture<'static, Execution> {
        next(payload)
    }

    fn intercept_incoming_upstream(
        &self,
        _call: &ServiceCallIdentifier,
        input: IncomingStreamInput,
        next: Next<IncomingStreamInput, Execution>,
    ) -> BoxFuture<'static, Execution> {
        next(input)
    }

    fn intercept_incoming_downstream(
        &self,
        _call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, StreamExecution>,
    ) -> BoxFuture<'static, StreamExecution> {
        next(payload)
    }

    fn intercept_incoming_bistream(
        &self,
        _call: &ServiceCallIdentifier,
        input: IncomingStreamInput,
        next: Next<IncomingStreamInput, StreamExecution>,
    ) -> BoxFuture<'static, StreamExecution> {
        next(input)
    }
}

/// Creates a fresh extension for every connection.
pub trait RpcExtensionFactory: Send + Sync + 'static {
    fn create(&self) -> Arc<dyn RpcExtension>;
}

impl<F> RpcExtensionFactory for F
where
    F: Fn() -> Arc<dyn RpcExtension> + Send + Sync + 'static,
{
    fn create(&self) -> Arc<dyn RpcExtension> {
        self()
    }
}

type Intercept<In, Out> =
    fn(&dyn RpcExtension, &ServiceCallIdentifier, In, Next<In, Out>) -> BoxFuture<'static, Out>;

/// The ordered extensions of one node.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    extensions: Vec<Arc<dyn RpcExtension>>,
}

impl InterceptorChain {
    pub fn new(extensions: Vec<Arc<dyn RpcExtension>>) -> Self {
        Self { extensions }
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn extensions(&self) -> &[Arc<dyn RpcExtension>] {
        &self.extensions
    }

    fn wrap<In, Out>(
        &self,
        call: &ServiceCallIdentifier,
        input: In,
        terminal: Next<In, Out>,
        intercept: Intercept<In, Out>,
    ) -> BoxFuture<'static, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let mut next = terminal;
        for extension in self.extensions.iter().rev() {
            let extension = extension.clone();
            let call = call.clone();
            let inner = next;
            next = Box::new(move |input| intercept(extension.as_ref(), &call, input, inner));
        }
        next(input)
    }

    pub fn outgoing_single(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        terminal: Next<SerializedPayload, CallOutcome>,
    ) -> BoxFuture<'static, CallOutcome> {
        self.wrap(call, payload, terminal, |ext, call, input, next| {
            ext.intercept_outgoing_single(call, input, next)
        })
    }

    pub fn outgoing_upstream(
        &self,
        call: &ServiceCallIdentifier,
        input: OutgoingStreamInput,
        terminal: Next<OutgoingStreamInput, CallOutcome>,
    ) -> BoxFuture<'static, CallOutcome> {
        self.wrap(call, input, terminal, |ext, call, input, next| {
            ext.intercept_outgoing_upstream(call, input, next)
        })
    }

    pub fn outgoing_downstream(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        terminal: Next<SerializedPayload, StreamOutcome>,
    ) -> BoxFuture<'static, StreamOutcome> {
        self.wrap(call, payload, terminal, |ext, call, input, next| {
            ext.intercept_outgoing_downstream(call, input, next)
        })
    }

    pub fn outgoing_bistream(
        &self,
        call: &ServiceCallIdentifier,
        input: OutgoingStreamInput,
        terminal: Next<OutgoingStreamInput, StreamOutcome>,
    ) -> BoxFuture<'static, StreamOutcome> {
        self.wrap(call, input, terminal, |ext, call, input, next| {
            ext.intercept_outgoing_bistream(call, input, next)
        })
    }

    pub fn incoming_single(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        terminal: Next<SerializedPayload, Execution>,
    ) -> BoxFuture<'static, Execution> {
        self.wrap(call, payload, terminal, |ext, call, input, next| {
            ext.intercept_incoming_single(call, input, next)
        })
    }

    pub fn incoming_upstream(
        &self,
        call: &ServiceCallIdentifier,
        input: IncomingStreamInput,
        terminal: Next<IncomingStreamInput, Execution>,
    ) -> BoxFuture<'static, Execution> {
        self.wrap(call, input, terminal, |ext, call, input, next| {
            ext.intercept_incoming_upstream(call, input, next)
        })
    }

    pub fn incoming_downstream(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        terminal: Next<SerializedPayload, StreamExecution>,
    ) -> BoxFuture<'static, StreamExecution> {
        self.wrap(call, payload, terminal, |ext, call, input, next| {
            ext.intercept_incoming_downstream(call, input, next)
        })
    }

    pub fn incoming_bistream(
        &self,
        call: &ServiceCallIdentifier,
        input: IncomingStreamInput,
        terminal: Next<IncomingStreamInput, StreamExecution>,
    ) -> BoxFuture<'static, StreamExecution> {
        self.wrap(call, input, terminal, |ext, call, input, next| {
            ext.intercept_incoming_bistream(call, input, next)
        })
    }
}

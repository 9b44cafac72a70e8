//! Call and service descriptions.
//!
//! A typed call description names a call and fixes its shape and its request,
//! response, stream item and error types. Binding an implementation to it
//! yields a [`RunnableCallDescription`], which works on encoded payloads only
//! and is what the node dispatches to.

use crate::error::{CallError, CallFailure, DescriptionError};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tandem_protocol::{ProtocolError, RpcError, SerializedPayload, ServiceCallIdentifier, WireError};

/// Values that can travel as payloads.
pub trait WireType: Serialize + DeserializeOwned + Send + 'static {}

impl<T> WireType for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// An encoded [`WireError`], ready to be sent in an `Error` frame or a
/// `Data(Error)` stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedError(pub SerializedPayload);

impl EncodedError {
    pub fn application<E: Serialize>(error: &E) -> Self {
        match SerializedPayload::encode(&WireError::Application(error)) {
            Ok(payload) => Self(payload),
            Err(e) => Self::rpc(RpcError::internal(format!(
                "failed to encode application error: {}",
                e
            ))),
        }
    }

    pub fn rpc(error: RpcError) -> Self {
        Self(error.to_payload().unwrap_or_default())
    }

    pub fn into_payload(self) -> SerializedPayload {
        self.0
    }
}

/// Stream received from the peer, still encoded.
pub type IncomingStream = BoxStream<'static, Result<SerializedPayload, CallFailure>>;

/// Locally produced stream, already encoded.
pub type EncodedStream = BoxStream<'static, Result<SerializedPayload, EncodedError>>;

/// Stream received from the peer, decoded.
pub type RemoteStream<T, E> = BoxStream<'static, Result<T, CallError<E>>>;

/// Locally produced stream handed to the engine.
pub type LocalStream<T, E> = BoxStream<'static, Result<T, E>>;

type HandlerFuture<T> = BoxFuture<'static, Result<T, EncodedError>>;

pub type SingleHandler =
    Arc<dyn Fn(SerializedPayload) -> HandlerFuture<SerializedPayload> + Send + Sync>;
pub type UpstreamHandler = Arc<
    dyn Fn(SerializedPayload, IncomingStream) -> HandlerFuture<SerializedPayload> + Send + Sync,
>;
pub type DownstreamHandler =
    Arc<dyn Fn(SerializedPayload) -> HandlerFuture<EncodedStream> + Send + Sync>;
pub type BistreamHandler =
    Arc<dyn Fn(SerializedPayload, IncomingStream) -> HandlerFuture<EncodedStream> + Send + Sync>;

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// Request in, response out.
    Single,
    /// Request and caller-produced stream in, response out.
    ColdUpstream,
    /// Request in, callee-produced stream out.
    ColdDownstream,
    /// Request and caller-produced stream in, callee-produced stream out.
    ColdBistream,
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallShape::Single => "single",
            CallShape::ColdUpstream => "cold-upstream",
            CallShape::ColdDownstream => "cold-downstream",
            CallShape::ColdBistream => "cold-bistream",
        };
        f.write_str(name)
    }
}

/// An implementation bound to a call, working on encoded payloads.
#[derive(Clone)]
pub enum RunnableCall {
    Single(SingleHandler),
    ColdUpstream(UpstreamHandler),
    ColdDownstream(DownstreamHandler),
    ColdBistream(BistreamHandler),
}

impl RunnableCall {
    pub fn shape(&self) -> CallShape {
        match self {
            RunnableCall::Single(_) => CallShape::Single,
            RunnableCall::ColdUpstream(_) => CallShape::ColdUpstream,
            RunnableCall::ColdDownstream(_) => CallShape::ColdDownstream,
            RunnableCall::ColdBistream(_) => CallShape::ColdBistream,
        }
    }
}

/// A call identifier together with its bound implementation.
#[derive(Clone)]
pub struct RunnableCallDescription {
    pub identifier: ServiceCallIdentifier,
    pub call: RunnableCall,
}

impl RunnableCallDescription {
    pub fn shape(&self) -> CallShape {
        self.call.shape()
    }
}

impl fmt::Debug for RunnableCallDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableCallDescription")
            .field("identifier", &self.identifier)
            .field("shape", &self.shape())
            .finish()
    }
}

fn bad_request(identifier: &ServiceCallIdentifier, error: ProtocolError) -> EncodedError {
    EncodedError::rpc(RpcError::bad_request(format!(
        "invalid request for {}: {}",
        identifier, error
    )))
}

fn encode_value<T: Serialize>(value: &T) -> Result<SerializedPayload, EncodedError> {
    SerializedPayload::encode(value).map_err(|e| {
        EncodedError::rpc(RpcError::internal(format!("failed to encode value: {}", e)))
    })
}

/// Decodes a stream received from the peer.
pub fn decode_stream<T, E>(raw: IncomingStream) -> RemoteStream<T, E>
where
    T: WireType,
    E: WireType,
{
    raw.map(|item| match item {
        Ok(payload) => payload
            .decode::<T>()
            .map_err(|e| CallError::Codec(e.to_string())),
        Err(failure) => Err(failure.into_call_error()),
    })
    .boxed()
}

/// Encodes a locally produced stream.
pub fn encode_stream<T, E>(local: LocalStream<T, E>) -> EncodedStream
where
    T: WireType,
    E: WireType,
{
    local
        .map(|item| match item {
            Ok(value) => encode_value(&value),
            Err(error) => Err(EncodedError::application(&error)),
        })
        .boxed()
}

/// Decodes a caller-side result payload.
pub fn decode_result<T, E>(
    result: Result<SerializedPayload, CallFailure>,
) -> Result<T, CallError<E>>
where
    T: WireType,
    E: WireType,
{
    match result {
        Ok(payload) => payload
            .decode()
            .map_err(|e| CallError::Codec(e.to_string())),
        Err(failure) => Err(failure.into_call_error()),
    }
}

macro_rules! typed_description {
    ($(#[$meta:meta])* $name:ident < $($param:ident),+ >) => {
        $(#[$meta])*
        pub struct $name<$($param),+> {
            identifier: ServiceCallIdentifier,
            _types: PhantomData<fn() -> ($($param,)+)>,
        }

        impl<$($param),+> $name<$($param),+> {
            pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
                Self {
                    identifier: ServiceCallIdentifier::new(service_id, call_id),
                    _types: PhantomData,
                }
            }

            pub fn identifier(&self) -> &ServiceCallIdentifier {
                &self.identifier
            }
        }

        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    identifier: self.identifier.clone(),
                    _types: PhantomData,
                }
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("identifier", &self.identifier)
                    .finish()
            }
        }
    };
}

typed_description!(
    /// Request in, response out.
    SingleCallDescription<Req, Resp, E>
);
typed_description!(
    /// Request plus a caller-produced stream of `Item` in, response out.
    ColdUpstreamCallDescription<Req, Item, Resp, E>
);
typed_description!(
    /// Request in, callee-produced stream of `Item` out.
    ColdDownstreamCallDescription<Req, Item, E>
);
typed_description!(
    /// Request plus a caller stream of `In` in, callee stream of `Out` out.
    ColdBistreamCallDescription<Req, In, Out, E>
);

impl<Req: WireType, Resp: WireType, E: WireType> SingleCallDescription<Req, Resp, E> {
    pub fn bind<F, Fut>(&self, handler: F) -> RunnableCallDescription
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        let identifier = self.identifier.clone();
        let run: SingleHandler = Arc::new(move |payload: SerializedPayload| {
            match payload.decode::<Req>() {
                Ok(request) => {
                    let response = handler(request);
                    async move {
                        match response.await {
                            Ok(value) => encode_value(&value),
                            Err(error) => Err(EncodedError::application(&error)),
                        }
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(bad_request(&identifier, e))).boxed(),
            }
        });
        RunnableCallDescription {
            identifier: self.identifier.clone(),
            call: RunnableCall::Single(run),
        }
    }
}

impl<Req: WireType, Item: WireType, Resp: WireType, E: WireType>
    ColdUpstreamCallDescription<Req, Item, Resp, E>
{
    pub fn bind<F, Fut>(&self, handler: F) -> RunnableCallDescription
    where
        F: Fn(Req, RemoteStream<Item, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        let identifier = self.identifier.clone();
        let run = move |payload: SerializedPayload, stream: IncomingStream| {
            match payload.decode::<Req>() {
                Ok(request) => {
                    let response = handler(request, decode_stream(stream));
                    async move {
                        match response.await {
                            Ok(value) => encode_value(&value),
                            Err(error) => Err(EncodedError::application(&error)),
                        }
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(bad_request(&identifier, e))).boxed(),
            }
        };
        let run: UpstreamHandler = Arc::new(run);
        RunnableCallDescription {
            identifier: self.identifier.clone(),
            call: RunnableCall::ColdUpstream(run),
        }
    }
}

impl<Req: WireType, Item: WireType, E: WireType> ColdDownstreamCallDescription<Req, Item, E> {
    pub fn bind<F, Fut>(&self, handler: F) -> RunnableCallDescription
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<LocalStream<Item, E>, E>> + Send + 'static,
    {
        let identifier = self.identifier.clone();
        let run: DownstreamHandler = Arc::new(move |payload: SerializedPayload| {
            match payload.decode::<Req>() {
                Ok(request) => {
                    let opened = handler(request);
                    async move {
                        match opened.await {
                            Ok(stream) => Ok(encode_stream(stream)),
                            Err(error) => Err(EncodedError::application(&error)),
                        }
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(bad_request(&identifier, e))).boxed(),
            }
        });
        RunnableCallDescription {
            identifier: self.identifier.clone(),
            call: RunnableCall::ColdDownstream(run),
        }
    }
}

impl<Req: WireType, In: WireType, Out: WireType, E: WireType>
    ColdBistreamCallDescription<Req, In, Out, E>
{
    pub fn bind<F, Fut>(&self, handler: F) -> RunnableCallDescription
    where
        F: Fn(Req, RemoteStream<In, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<LocalStream<Out, E>, E>> + Send + 'static,
    {
        let identifier = self.identifier.clone();
        let run = move |payload: SerializedPayload, stream: IncomingStream| {
            match payload.decode::<Req>() {
                Ok(request) => {
                    let opened = handler(request, decode_stream(stream));
                    async move {
                        match opened.await {
                            Ok(stream) => Ok(encode_stream(stream)),
                            Err(error) => Err(EncodedError::application(&error)),
                        }
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(bad_request(&identifier, e))).boxed(),
            }
        };
        let run: BistreamHandler = Arc::new(run);
        RunnableCallDescription {
            identifier: self.identifier.clone(),
            call: RunnableCall::ColdBistream(run),
        }
    }
}

/// A service: its id and the ordered set of calls it offers.
#[derive(Clone)]
pub struct ServiceDescription {
    service_id: String,
    calls: Vec<RunnableCallDescription>,
    index: HashMap<String, usize>,
}

impl ServiceDescription {
    /// Builds a service description, rejecting duplicate call ids and calls
    /// that belong to another service.
    pub fn new(
        service_id: impl Into<String>,
        calls: Vec<RunnableCallDescription>,
    ) -> Result<Self, DescriptionError> {
        let service_id = service_id.into();
        if service_id.is_empty() {
            return Err(DescriptionError::EmptyServiceId);
        }

        let mut index = HashMap::with_capacity(calls.len());
        for (position, call) in calls.iter().enumerate() {
            if call.identifier.service_id != service_id {
                return Err(DescriptionError::ServiceMismatch {
                    expected: service_id,
                    found: call.identifier.service_id.clone(),
                    call_id: call.identifier.call_id.clone(),
                });
            }
            if index.insert(call.identifier.call_id.clone(), position).is_some() {
                return Err(DescriptionError::DuplicateCall {
                    service_id,
                    call_id: call.identifier.call_id.clone(),
                });
            }
        }

        Ok(Self {
            service_id,
            calls,
            index,
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Calls in declaration order.
    pub fn calls(&self) -> &[RunnableCallDescription] {
        &self.calls
    }

    pub fn call(&self, call_id: &str) -> Option<&RunnableCallDescription> {
        self.index.get(call_id).map(|&position| &self.calls[position])
    }
}

impl fmt::Debug for ServiceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescription")
            .field("service_id", &self.service_id)
            .field("calls", &self.calls)
            .finish()
    }
}

/// Binds an implementation of a service interface to its static call table.
///
/// Implemented once per service interface, typically next to a typed client
/// that performs the same descriptions through an
/// [`RpcTransport`](crate::node::RpcTransport).
pub trait ServiceDescriptor {
    type Service: ?Sized + Send + Sync + 'static;

    const SERVICE_ID: &'static str;

    fn describe(service: Arc<Self::Service>) -> Result<ServiceDescription, DescriptionError>;
}

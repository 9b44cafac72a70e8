//! RPC node - multiplexes calls in both directions over one connection.
//!
//! Each side of a connection runs one node. A node is caller and callee at the
//! same time: calls it performs are tracked in the caller table, calls the
//! peer opened in the callee table. Upstream events belong to calls the peer
//! performs and are routed to the callee table; downstream events answer our
//! own calls and are routed to the caller table.

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::description::{
    decode_result, decode_stream, encode_stream, BistreamHandler, ColdBistreamCallDescription,
    ColdDownstreamCallDescription, ColdUpstreamCallDescription, DownstreamHandler, EncodedStream,
    IncomingStream, LocalStream, RemoteStream, RunnableCall, RunnableCallDescription,
    ServiceDescription, SingleCallDescription, SingleHandler, UpstreamHandler, WireType,
};
use crate::error::{CallError, CallFailure, ConnectionError, NodeError};
use crate::interceptor::{
    CallOutcome, InterceptorChain, Next, OutgoingStreamInput, RpcExtension, StreamOutcome,
};
use crate::pending::{bistream, downstream, single, upstream, CallLink, CancelHandle, PendingCall};
use crate::registry::ServiceRegistry;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tandem_protocol::{
    DownstreamEvent, RpcError, RpcEvent, RpcFrame, RpcReference, SerializedPayload,
    ServiceCallIdentifier, UpstreamEvent,
};
use tokio::sync::{mpsc, oneshot, watch};

/// Which side of a call this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Caller,
    Callee,
}

struct Route {
    id: u64,
    inbox: mpsc::UnboundedSender<RpcFrame>,
}

type RouteTable = Mutex<HashMap<RpcReference, Route>>;

/// Removes a call's route when its task ends, unless the reference was
/// reused by a newer route in the meantime.
pub(crate) struct RouteGuard {
    node: Weak<NodeInner>,
    role: Role,
    reference: RpcReference,
    id: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let mut table = node.table(self.role).lock();
        if table
            .get(&self.reference)
            .is_some_and(|route| route.id == self.id)
        {
            table.remove(&self.reference);
        }
    }
}

pub(crate) struct NodeInner {
    pub(crate) label: String,
    pub(crate) config: NodeConfig,
    pub(crate) chain: InterceptorChain,
    connection: Arc<dyn Connection>,
    registry: Arc<ServiceRegistry>,
    provided: HashMap<String, Arc<ServiceDescription>>,
    callers: RouteTable,
    callees: RouteTable,
    next_reference: AtomicU64,
    next_route: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl NodeInner {
    fn table(&self, role: Role) -> &RouteTable {
        match role {
            Role::Caller => &self.callers,
            Role::Callee => &self.callees,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn send(&self, frame: RpcFrame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.connection.send(frame).await
    }

    /// Registers a route for a new call. Fails once the node is closed.
    fn install(
        self: &Arc<Self>,
        role: Role,
        reference: RpcReference,
        call: ServiceCallIdentifier,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Option<CallLink> {
        let (sender, inbox) = mpsc::unbounded_channel();
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.table(role).lock();
            if self.is_closed() {
                return None;
            }
            table.insert(reference, Route { id, inbox: sender });
        }
        let guard = RouteGuard {
            node: Arc::downgrade(self),
            role,
            reference,
            id,
        };
        Some(CallLink::new(
            self.clone(),
            reference,
            call,
            role,
            inbox,
            cancel,
            guard,
        ))
    }

    fn open_caller(
        self: &Arc<Self>,
        call: ServiceCallIdentifier,
        cancel: watch::Receiver<bool>,
    ) -> Option<CallLink> {
        let reference = RpcReference::new(self.next_reference.fetch_add(1, Ordering::Relaxed));
        self.install(Role::Caller, reference, call, Some(cancel))
    }

    fn resolve(&self, call: &ServiceCallIdentifier) -> Option<RunnableCallDescription> {
        match self.provided.get(&call.service_id) {
            Some(service) => service.call(&call.call_id).cloned(),
            None => self.registry.resolve(&call.service_id, &call.call_id),
        }
    }

    /// Routes one received frame by direction and reference.
    async fn dispatch(self: &Arc<Self>, frame: RpcFrame) {
        let reference = frame.reference();
        let role = if frame.header.event.is_upstream() {
            Role::Callee
        } else {
            Role::Caller
        };

        let inbox = self
            .table(role)
            .lock()
            .get(&reference)
            .map(|route| route.inbox.clone());
        if let Some(inbox) = inbox {
            if let Err(mpsc::error::SendError(frame)) = inbox.send(frame) {
                tracing::debug!(
                    "[{}] <{}> call already finished, dropping {}",
                    self.label,
                    reference,
                    frame.header.event
                );
            }
            return;
        }

        match frame.header.event {
            RpcEvent::Upstream(UpstreamEvent::Open { call }) => {
                self.accept(reference, call, frame.payload).await
            }
            event => tracing::warn!(
                "[{}] <{}> {} for unknown reference, dropping",
                self.label,
                reference,
                event
            ),
        }
    }

    /// Starts the callee side of a call the peer opened.
    async fn accept(
        self: &Arc<Self>,
        reference: RpcReference,
        call: ServiceCallIdentifier,
        payload: SerializedPayload,
    ) {
        let Some(description) = self.resolve(&call) else {
            tracing::warn!("[{}] <{}> Unknown call {}", self.label, reference, call);
            let error = RpcError::unknown_call(reference, &call);
            let frame = RpcFrame::downstream(
                reference,
                DownstreamEvent::Error,
                error.to_payload().unwrap_or_default(),
            );
            if let Err(e) = self.send(frame).await {
                tracing::debug!("[{}] <{}> could not reject call: {}", self.label, reference, e);
            }
            return;
        };

        let Some(link) = self.install(Role::Callee, reference, call.clone(), None) else {
            return;
        };
        tracing::debug!(
            "[{}] <{}> {} accepted ({})",
            self.label,
            reference,
            call,
            description.shape()
        );

        let chain = self.chain.clone();
        match description.call {
            RunnableCall::Single(handler) => {
                tokio::spawn(single::run_callee(
                    link,
                    incoming_single(chain, call, handler),
                    payload,
                ));
            }
            RunnableCall::ColdUpstream(handler) => {
                tokio::spawn(upstream::run_callee(
                    link,
                    incoming_upstream(chain, call, handler),
                    payload,
                ));
            }
            RunnableCall::ColdDownstream(handler) => {
                tokio::spawn(downstream::run_callee(
                    link,
                    incoming_downstream(chain, call, handler),
                    payload,
                ));
            }
            RunnableCall::ColdBistream(handler) => {
                tokio::spawn(bistream::run_callee(
                    link,
                    incoming_bistream(chain, call, handler),
                    payload,
                ));
            }
        }
    }

    /// Ends every pending call and closes the connection. Idempotent.
    async fn close(&self) {
        let (callers, callees) = {
            let mut callers = self.callers.lock();
            let mut callees = self.callees.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            (
                std::mem::take(&mut *callers),
                std::mem::take(&mut *callees),
            )
        };
        tracing::info!(
            "[{}] Closing node ({} outgoing, {} incoming calls pending)",
            self.label,
            callers.len(),
            callees.len()
        );
        // Dropping the routes closes every inbox; the call tasks observe it.
        drop(callers);
        drop(callees);
        self.connection.close().await;
        self.shutdown.send_replace(true);
    }
}

fn incoming_single(
    chain: InterceptorChain,
    call: ServiceCallIdentifier,
    handler: SingleHandler,
) -> SingleHandler {
    Arc::new(move |payload| {
        let handler = handler.clone();
        chain.incoming_single(&call, payload, Box::new(move |payload| handler(payload)))
    })
}

fn incoming_upstream(
    chain: InterceptorChain,
    call: ServiceCallIdentifier,
    handler: UpstreamHandler,
) -> UpstreamHandler {
    Arc::new(move |payload, stream| {
        let handler = handler.clone();
        chain.incoming_upstream(
            &call,
            (payload, stream),
            Box::new(move |(payload, stream)| handler(payload, stream)),
        )
    })
}

fn incoming_downstream(
    chain: InterceptorChain,
    call: ServiceCallIdentifier,
    handler: DownstreamHandler,
) -> DownstreamHandler {
    Arc::new(move |payload| {
        let handler = handler.clone();
        chain.incoming_downstream(&call, payload, Box::new(move |payload| handler(payload)))
    })
}

fn incoming_bistream(
    chain: InterceptorChain,
    call: ServiceCallIdentifier,
    handler: BistreamHandler,
) -> BistreamHandler {
    Arc::new(move |payload, stream| {
        let handler = handler.clone();
        chain.incoming_bistream(
            &call,
            (payload, stream),
            Box::new(move |(payload, stream)| handler(payload, stream)),
        )
    })
}

/// Resolves once the shutdown flag is raised.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let requested = *shutdown.borrow_and_update();
        if requested {
            return;
        }
        if shutdown.changed().await.is_err() {
            return futures::future::pending().await;
        }
    }
}

/// Builder for [`RpcNode`].
pub struct RpcNodeBuilder {
    connection: Arc<dyn Connection>,
    registry: Arc<ServiceRegistry>,
    extensions: Vec<Arc<dyn RpcExtension>>,
    config: NodeConfig,
    label: String,
}

impl RpcNodeBuilder {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            registry: Arc::new(ServiceRegistry::new()),
            extensions: Vec::new(),
            config: NodeConfig::default(),
            label: "node".to_string(),
        }
    }

    /// Services the peer may call. Shared between nodes as needed.
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Adds an extension. The first one added is the outermost interceptor.
    pub fn with_extension(mut self, extension: Arc<dyn RpcExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Name used as prefix of every log line of this node.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn build(self) -> Result<RpcNode, NodeError> {
        let mut provided = HashMap::new();
        for extension in &self.extensions {
            for service in extension.clone().provided_services()? {
                let service_id = service.service_id().to_string();
                if provided
                    .insert(service_id.clone(), Arc::new(service))
                    .is_some()
                {
                    return Err(NodeError::DuplicateService(service_id));
                }
            }
        }

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(NodeInner {
            label: self.label,
            config: self.config,
            chain: InterceptorChain::new(self.extensions.clone()),
            connection: self.connection,
            registry: self.registry,
            provided,
            callers: Mutex::new(HashMap::new()),
            callees: Mutex::new(HashMap::new()),
            next_reference: AtomicU64::new(1),
            next_route: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown,
        });

        let transport = WeakRpcTransport {
            inner: Arc::downgrade(&inner),
        };
        for extension in &self.extensions {
            tracing::debug!("[{}] Binding extension {}", inner.label, extension.identifier());
            extension.bind(transport.clone());
        }

        Ok(RpcNode { inner })
    }
}

/// One side of an RPC connection.
///
/// [`RpcNode::run`] reads frames until the connection ends; calls are
/// performed through [`RpcNode::transport`].
#[derive(Clone)]
pub struct RpcNode {
    inner: Arc<NodeInner>,
}

impl RpcNode {
    pub fn builder<C: Connection>(connection: C) -> RpcNodeBuilder {
        RpcNodeBuilder::new(Arc::new(connection))
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> RpcTransport {
        RpcTransport {
            inner: self.inner.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Calls this node performs that have not finished yet.
    pub fn outgoing_calls(&self) -> usize {
        self.inner.callers.lock().len()
    }

    /// Calls the peer opened on this node that have not finished yet.
    pub fn incoming_calls(&self) -> usize {
        self.inner.callees.lock().len()
    }

    /// Reads and dispatches frames until the connection ends or the node is
    /// closed. The node is closed when this returns.
    pub async fn run(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        tracing::debug!("[{}] Node running", inner.label);

        let result = loop {
            let received = tokio::select! {
                received = inner.connection.receive() => received,
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
            };
            match received {
                Ok(Some(frame)) => inner.dispatch(frame).await,
                Ok(None) => {
                    tracing::info!("[{}] Connection closed by peer", inner.label);
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!("[{}] Receive error: {}", inner.label, e);
                    break Err(NodeError::Connection(e));
                }
            }
        };
        inner.close().await;
        result
    }

    /// Closes the node. Every pending call fails with a closed connection
    /// and new calls are refused.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

/// Starts the caller task of a call and returns its eventual result.
fn start_caller<T, F, Fut>(
    node: &Arc<NodeInner>,
    call: ServiceCallIdentifier,
    cancel: watch::Receiver<bool>,
    run: F,
) -> BoxFuture<'static, Result<T, CallFailure>>
where
    T: Send + 'static,
    F: FnOnce(CallLink, oneshot::Sender<Result<T, CallFailure>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Some(link) = node.open_caller(call, cancel) else {
        return futures::future::ready(Err(CallFailure::ConnectionClosed)).boxed();
    };
    let (result, outcome) = oneshot::channel();
    tokio::spawn(run(link, result));
    async move { outcome.await.unwrap_or(Err(CallFailure::ConnectionClosed)) }.boxed()
}

fn encode_request<Req: Serialize, T, E>(
    request: &Req,
) -> Result<SerializedPayload, PendingCall<Result<T, CallError<E>>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    SerializedPayload::encode(request).map_err(|e| {
        let failed = CallError::Codec(format!("failed to encode request: {}", e));
        PendingCall::new(
            futures::future::ready(Err(failed)).boxed(),
            CancelHandle::new().0,
        )
    })
}

/// Performs calls on the peer. Cheap to clone.
#[derive(Clone)]
pub struct RpcTransport {
    inner: Arc<NodeInner>,
}

impl RpcTransport {
    pub fn downgrade(&self) -> WeakRpcTransport {
        WeakRpcTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn perform_single(
        &self,
        call: ServiceCallIdentifier,
        payload: SerializedPayload,
    ) -> PendingCall<CallOutcome> {
        let (cancel, signal) = CancelHandle::new();
        let node = self.inner.clone();
        let target = call.clone();
        let terminal: Next<SerializedPayload, CallOutcome> = Box::new(move |payload| {
            start_caller(&node, target, signal, move |link, result| {
                single::run_caller(link, payload, result)
            })
        });
        PendingCall::new(
            self.inner.chain.outgoing_single(&call, payload, terminal),
            cancel,
        )
    }

    pub fn perform_upstream(
        &self,
        call: ServiceCallIdentifier,
        payload: SerializedPayload,
        stream: EncodedStream,
    ) -> PendingCall<CallOutcome> {
        let (cancel, signal) = CancelHandle::new();
        let node = self.inner.clone();
        let target = call.clone();
        let terminal: Next<OutgoingStreamInput, CallOutcome> =
            Box::new(move |(payload, stream)| {
                start_caller(&node, target, signal, move |link, result| {
                    upstream::run_caller(link, payload, stream, result)
                })
            });
        PendingCall::new(
            self.inner
                .chain
                .outgoing_upstream(&call, (payload, stream), terminal),
            cancel,
        )
    }

    pub fn perform_downstream(
        &self,
        call: ServiceCallIdentifier,
        payload: SerializedPayload,
    ) -> PendingCall<StreamOutcome> {
        let (cancel, signal) = CancelHandle::new();
        let node = self.inner.clone();
        let target = call.clone();
        let terminal: Next<SerializedPayload, StreamOutcome> = Box::new(move |payload| {
            start_caller(&node, target, signal, move |link, result| {
                downstream::run_caller(link, payload, result)
            })
        });
        PendingCall::new(
            self.inner.chain.outgoing_downstream(&call, payload, terminal),
            cancel,
        )
    }

    pub fn perform_bistream(
        &self,
        call: ServiceCallIdentifier,
        payload: SerializedPayload,
        stream: EncodedStream,
    ) -> PendingCall<StreamOutcome> {
        let (cancel, signal) = CancelHandle::new();
        let node = self.inner.clone();
        let target = call.clone();
        let terminal: Next<OutgoingStreamInput, StreamOutcome> =
            Box::new(move |(payload, stream)| {
                start_caller(&node, target, signal, move |link, result| {
                    bistream::run_caller(link, payload, stream, result)
                })
            });
        PendingCall::new(
            self.inner
                .chain
                .outgoing_bistream(&call, (payload, stream), terminal),
            cancel,
        )
    }

    /// Performs a single call.
    pub fn single_call<Req, Resp, E>(
        &self,
        description: &SingleCallDescription<Req, Resp, E>,
        request: &Req,
    ) -> PendingCall<Result<Resp, CallError<E>>>
    where
        Req: WireType,
        Resp: WireType,
        E: WireType,
    {
        let payload = match encode_request(request) {
            Ok(payload) => payload,
            Err(failed) => return failed,
        };
        self.perform_single(description.identifier().clone(), payload)
            .map(decode_result::<Resp, E>)
    }

    /// Performs a cold upstream call. `stream` is only pulled once the
    /// callee asks for it.
    pub fn client_stream<Req, Item, Resp, E>(
        &self,
        description: &ColdUpstreamCallDescription<Req, Item, Resp, E>,
        request: &Req,
        stream: LocalStream<Item, E>,
    ) -> PendingCall<Result<Resp, CallError<E>>>
    where
        Req: WireType,
        Item: WireType,
        Resp: WireType,
        E: WireType,
    {
        let payload = match encode_request(request) {
            Ok(payload) => payload,
            Err(failed) => return failed,
        };
        self.perform_upstream(
            description.identifier().clone(),
            payload,
            encode_stream(stream),
        )
        .map(decode_result::<Resp, E>)
    }

    /// Performs a cold downstream call. The returned stream asks the callee
    /// to start when first polled and closes the call when dropped.
    pub fn server_stream<Req, Item, E>(
        &self,
        description: &ColdDownstreamCallDescription<Req, Item, E>,
        request: &Req,
    ) -> PendingCall<Result<RemoteStream<Item, E>, CallError<E>>>
    where
        Req: WireType,
        Item: WireType,
        E: WireType,
    {
        let payload = match encode_request(request) {
            Ok(payload) => payload,
            Err(failed) => return failed,
        };
        self.perform_downstream(description.identifier().clone(), payload)
            .map(open_stream::<Item, E>)
    }

    /// Performs a cold bistream call.
    pub fn bi_stream<Req, In, Out, E>(
        &self,
        description: &ColdBistreamCallDescription<Req, In, Out, E>,
        request: &Req,
        stream: LocalStream<In, E>,
    ) -> PendingCall<Result<RemoteStream<Out, E>, CallError<E>>>
    where
        Req: WireType,
        In: WireType,
        Out: WireType,
        E: WireType,
    {
        let payload = match encode_request(request) {
            Ok(payload) => payload,
            Err(failed) => return failed,
        };
        self.perform_bistream(
            description.identifier().clone(),
            payload,
            encode_stream(stream),
        )
        .map(open_stream::<Out, E>)
    }
}

fn open_stream<T: WireType, E: WireType>(
    outcome: Result<IncomingStream, CallFailure>,
) -> Result<RemoteStream<T, E>, CallError<E>> {
    outcome
        .map(decode_stream::<T, E>)
        .map_err(CallFailure::into_call_error)
}

/// A transport that does not keep its node alive.
#[derive(Clone)]
pub struct WeakRpcTransport {
    inner: Weak<NodeInner>,
}

impl WeakRpcTransport {
    pub fn upgrade(&self) -> Option<RpcTransport> {
        self.inner.upgrade().map(|inner| RpcTransport { inner })
    }
}

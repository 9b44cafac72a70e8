//! Session context shared by both ends of a connection.
//!
//! Each side keeps a key/value context where every item carries a revision.
//! A side changes the context through a transaction: the block runs against a
//! local snapshot, the recorded modifications are sent to the peer's built-in
//! update service together with the revisions they were based on, and the peer
//! applies them only if none of those revisions changed. A rejected
//! transaction refreshes the local context from the peer's answer and runs the
//! block again.
//!
//! Two transactions started at the same time on both sides may both be
//! accepted; the context is then left different on each side.

use crate::description::{ServiceDescription, SingleCallDescription};
use crate::error::{DescriptionError, SessionError};
use crate::interceptor::{
    CallOutcome, Execution, IncomingStreamInput, Next, OutgoingStreamInput, RpcExtension,
    StreamExecution, StreamOutcome,
};
use crate::node::{RpcTransport, WeakRpcTransport};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tandem_protocol::{SerializedPayload, ServiceCallIdentifier};

/// Service id of the built-in context update service.
pub const CONTEXT_UPDATE_SERVICE_ID: &str = "builtin:session.ContextUpdateService";

/// Call id of the update call.
pub const CONTEXT_UPDATE_CALL_ID: &str = "update";

/// Identifier of the session extension.
pub const SESSION_EXTENSION_ID: &str = "builtin:Session";

tokio::task_local! {
    static CURRENT_SESSION: Session;
}

/// The session of the connection whose incoming call is being executed.
///
/// Only set while an implementation runs on behalf of the peer.
pub fn current() -> Option<Session> {
    CURRENT_SESSION.try_with(|session| session.clone()).ok()
}

/// The update call: modifications in, verdict out.
pub fn update_call() -> SingleCallDescription<ContextUpdateRequest, ContextUpdateResult, ()> {
    SingleCallDescription::new(CONTEXT_UPDATE_SERVICE_ID, CONTEXT_UPDATE_CALL_ID)
}

/// A typed handle to one context entry.
pub struct ContextKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    /// Creates a key. Both sides must use the same qualified name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> std::fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextKey({})", self.name)
    }
}

/// One context entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Incremented on every change. The first value of a key has revision 1.
    pub revision: u64,
    pub value: Value,
}

/// A change of one key, with the revision it was based on (`None` when the
/// key was absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Modification {
    /// The key was read and must still be at this revision.
    Required { old_revision: Option<u64> },
    Set {
        old_revision: Option<u64>,
        new_item: ContextItem,
    },
    Remove { old_revision: u64 },
}

impl Modification {
    pub fn old_revision(&self) -> Option<u64> {
        match self {
            Modification::Required { old_revision } | Modification::Set { old_revision, .. } => {
                *old_revision
            }
            Modification::Remove { old_revision } => Some(*old_revision),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdateRequest {
    pub modifications: BTreeMap<String, Modification>,
}

/// Why the peer rejected a modification of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The key no longer exists on the peer.
    Removed,
    /// The key is at another revision on the peer.
    Updated { new_item: ContextItem },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ContextUpdateResult {
    Accepted,
    Rejected {
        reasons: BTreeMap<String, RejectionReason>,
    },
}

#[derive(Debug, Clone)]
enum Action {
    Required,
    Set(ContextItem),
    Remove,
}

#[derive(Debug, Clone)]
struct Touched {
    old: Option<ContextItem>,
    action: Action,
}

/// Records the reads and writes of one transaction attempt.
pub struct ContextMutator {
    snapshot: BTreeMap<String, ContextItem>,
    touched: BTreeMap<String, Touched>,
}

impl ContextMutator {
    fn new(snapshot: BTreeMap<String, ContextItem>) -> Self {
        Self {
            snapshot,
            touched: BTreeMap::new(),
        }
    }

    fn touch(&mut self, name: &str) -> &mut Touched {
        let snapshot = &self.snapshot;
        self.touched
            .entry(name.to_string())
            .or_insert_with(|| Touched {
                old: snapshot.get(name).cloned(),
                action: Action::Required,
            })
    }

    /// Reads a value as this transaction sees it. The read becomes a
    /// precondition of the transaction.
    pub fn get<T: DeserializeOwned>(
        &mut self,
        key: &ContextKey<T>,
    ) -> Result<Option<T>, SessionError> {
        let touched = self.touch(key.name);
        let value = match &touched.action {
            Action::Required => touched.old.as_ref().map(|item| item.value.clone()),
            Action::Set(item) => Some(item.value.clone()),
            Action::Remove => None,
        };
        value
            .map(|value| {
                serde_json::from_value(value).map_err(|source| SessionError::InvalidValue {
                    key: key.name.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub fn set<T: Serialize>(
        &mut self,
        key: &ContextKey<T>,
        value: &T,
    ) -> Result<(), SessionError> {
        let value = serde_json::to_value(value).map_err(|source| SessionError::InvalidValue {
            key: key.name.to_string(),
            source,
        })?;
        let touched = self.touch(key.name);
        let revision = touched.old.as_ref().map_or(1, |item| item.revision + 1);
        touched.action = Action::Set(ContextItem { revision, value });
        Ok(())
    }

    pub fn remove<T>(&mut self, key: &ContextKey<T>) {
        self.touch(key.name).action = Action::Remove;
    }

    fn into_request(self) -> (ContextUpdateRequest, BTreeMap<String, Touched>) {
        let modifications = self
            .touched
            .iter()
            .map(|(name, touched)| {
                let old_revision = touched.old.as_ref().map(|item| item.revision);
                let modification = match (&touched.action, old_revision) {
                    (Action::Set(item), _) => Modification::Set {
                        old_revision,
                        new_item: item.clone(),
                    },
                    (Action::Remove, Some(old_revision)) => Modification::Remove { old_revision },
                    (Action::Required, _) | (Action::Remove, None) => {
                        Modification::Required { old_revision }
                    }
                };
                (name.clone(), modification)
            })
            .collect();
        (ContextUpdateRequest { modifications }, self.touched)
    }
}

struct SessionState {
    context: Mutex<BTreeMap<String, ContextItem>>,
    /// Held for the whole duration of a local transaction.
    running_update: tokio::sync::Mutex<()>,
    transport: Mutex<Option<WeakRpcTransport>>,
}

/// Handle to a connection's session context. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    state: Arc<SessionState>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: Arc::new(SessionState {
                context: Mutex::new(BTreeMap::new()),
                running_update: tokio::sync::Mutex::new(()),
                transport: Mutex::new(None),
            }),
        }
    }

    fn transport(&self) -> Option<RpcTransport> {
        self.state
            .transport
            .lock()
            .as_ref()
            .and_then(WeakRpcTransport::upgrade)
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        key: &ContextKey<T>,
    ) -> Result<Option<T>, SessionError> {
        let value = self
            .state
            .context
            .lock()
            .get(key.name)
            .map(|item| item.value.clone());
        value
            .map(|value| {
                serde_json::from_value(value).map_err(|source| SessionError::InvalidValue {
                    key: key.name.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub fn item(&self, name: &str) -> Option<ContextItem> {
        self.state.context.lock().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ContextItem> {
        self.state.context.lock().clone()
    }

    /// Waits until no local transaction is running.
    pub async fn settled(&self) {
        drop(self.state.running_update.lock().await);
    }

    /// Runs `block` as a transaction, retrying it against a refreshed
    /// context while the peer rejects it.
    ///
    /// Transactions of one side run one at a time. Gives up after the node's
    /// configured number of attempts.
    pub async fn context_transaction<F>(&self, mut block: F) -> Result<(), SessionError>
    where
        F: FnMut(&mut ContextMutator) -> Result<(), SessionError>,
    {
        let transport = self.transport().ok_or(SessionError::NotBound)?;
        let attempts = transport.config().max_transaction_attempts;
        let update = update_call();
        let _running = self.state.running_update.lock().await;

        for attempt in 1..=attempts {
            let mut mutator = ContextMutator::new(self.snapshot());
            block(&mut mutator)?;
            let (request, touched) = mutator.into_request();
            if request.modifications.is_empty() {
                return Ok(());
            }

            let result = transport
                .single_call(&update, &request)
                .await
                .map_err(SessionError::Call)?;

            match result {
                ContextUpdateResult::Accepted => {
                    let mut context = self.state.context.lock();
                    for (name, touched) in touched {
                        match touched.action {
                            Action::Required => {}
                            Action::Set(item) => {
                                context.insert(name, item);
                            }
                            Action::Remove => {
                                context.remove(&name);
                            }
                        }
                    }
                    tracing::debug!(
                        "[{}] Context transaction accepted (attempt {})",
                        transport.label(),
                        attempt
                    );
                    return Ok(());
                }
                ContextUpdateResult::Rejected { reasons } => {
                    tracing::debug!(
                        "[{}] Context transaction rejected for {:?} (attempt {}/{})",
                        transport.label(),
                        reasons.keys().collect::<Vec<_>>(),
                        attempt,
                        attempts
                    );
                    let mut context = self.state.context.lock();
                    for (name, reason) in reasons {
                        match reason {
                            RejectionReason::Removed => {
                                context.remove(&name);
                            }
                            RejectionReason::Updated { new_item } => {
                                context.insert(name, new_item);
                            }
                        }
                    }
                }
            }
        }

        tracing::warn!(
            "[{}] Context transaction gave up after {} attempts",
            transport.label(),
            attempts
        );
        Err(SessionError::RetriesExhausted { attempts })
    }

    /// Sets one value in its own transaction.
    pub async fn set<T: Serialize>(
        &self,
        key: &ContextKey<T>,
        value: &T,
    ) -> Result<(), SessionError> {
        self.context_transaction(|mutator| mutator.set(key, value))
            .await
    }

    /// Removes one value in its own transaction.
    pub async fn remove<T>(&self, key: &ContextKey<T>) -> Result<(), SessionError> {
        self.context_transaction(|mutator| {
            mutator.remove(key);
            Ok(())
        })
        .await
    }

    /// Applies a peer's update if every revision it relies on is current.
    pub fn apply_update(&self, request: ContextUpdateRequest) -> ContextUpdateResult {
        let mut context = self.state.context.lock();
        let reasons: BTreeMap<String, RejectionReason> = request
            .modifications
            .iter()
            .filter(|(name, modification)| {
                modification.old_revision() != context.get(name.as_str()).map(|item| item.revision)
            })
            .map(|(name, _)| {
                let reason = match context.get(name.as_str()) {
                    Some(item) => RejectionReason::Updated {
                        new_item: item.clone(),
                    },
                    None => RejectionReason::Removed,
                };
                (name.clone(), reason)
            })
            .collect();

        if !reasons.is_empty() {
            return ContextUpdateResult::Rejected { reasons };
        }

        for (name, modification) in request.modifications {
            match modification {
                Modification::Required { .. } => {}
                Modification::Set { new_item, .. } => {
                    context.insert(name, new_item);
                }
                Modification::Remove { .. } => {
                    context.remove(&name);
                }
            }
        }
        ContextUpdateResult::Accepted
    }

    /// Runs `future` with this session as the current one, then waits for
    /// any transaction it left running.
    async fn attached<F: Future>(self, future: F) -> F::Output {
        let output = CURRENT_SESSION.scope(self.clone(), future).await;
        self.settled().await;
        output
    }
}

fn is_update_service(call: &ServiceCallIdentifier) -> bool {
    call.service_id == CONTEXT_UPDATE_SERVICE_ID
}

/// Keeps a [`Session`] in sync with the peer's.
pub struct SessionExtension {
    session: Session,
}

impl SessionExtension {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(),
        })
    }

    pub fn session(&self) -> Session {
        self.session.clone()
    }

    /// Creates one extension per connection.
    pub fn factory() -> impl Fn() -> Arc<dyn RpcExtension> + Send + Sync + 'static {
        || SessionExtension::new() as Arc<dyn RpcExtension>
    }

    /// Waits for a running transaction before `next`, except for the update
    /// service itself.
    fn after_update<In, Out>(
        &self,
        call: &ServiceCallIdentifier,
        input: In,
        next: Next<In, Out>,
    ) -> BoxFuture<'static, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        if is_update_service(call) {
            return next(input);
        }
        let session = self.session.clone();
        async move {
            session.settled().await;
            next(input).await
        }
        .boxed()
    }

    fn with_session<In, Out>(
        &self,
        call: &ServiceCallIdentifier,
        input: In,
        next: Next<In, Out>,
    ) -> BoxFuture<'static, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        if is_update_service(call) {
            return next(input);
        }
        // `next` may run handler code eagerly; it must see the session too.
        self.session
            .clone()
            .attached(async move { next(input).await })
            .boxed()
    }
}

impl RpcExtension for SessionExtension {
    fn identifier(&self) -> &str {
        SESSION_EXTENSION_ID
    }

    fn provided_services(self: Arc<Self>) -> Result<Vec<ServiceDescription>, DescriptionError> {
        let session = self.session.clone();
        let update = update_call().bind(move |request: ContextUpdateRequest| {
            let session = session.clone();
            async move { Ok::<_, ()>(session.apply_update(request)) }
        });
        Ok(vec![ServiceDescription::new(
            CONTEXT_UPDATE_SERVICE_ID,
            vec![update],
        )?])
    }

    fn bind(&self, transport: WeakRpcTransport) {
        *self.session.state.transport.lock() = Some(transport);
    }

    fn intercept_outgoing_single(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, CallOutcome>,
    ) -> BoxFuture<'static, CallOutcome> {
        self.after_update(call, payload, next)
    }

    fn intercept_outgoing_upstream(
        &self,
        call: &ServiceCallIdentifier,
        input: OutgoingStreamInput,
        next: Next<OutgoingStreamInput, CallOutcome>,
    ) -> BoxFuture<'static, CallOutcome> {
        self.after_update(call, input, next)
    }

    fn intercept_outgoing_downstream(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, StreamOutcome>,
    ) -> BoxFuture<'static, StreamOutcome> {
        self.after_update(call, payload, next)
    }

    fn intercept_outgoing_bistream(
        &self,
        call: &ServiceCallIdentifier,
        input: OutgoingStreamInput,
        next: Next<OutgoingStreamInput, StreamOutcome>,
    ) -> BoxFuture<'static, StreamOutcome> {
        self.after_update(call, input, next)
    }

    fn intercept_incoming_single(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, Execution>,
    ) -> BoxFuture<'static, Execution> {
        self.with_session(call, payload, next)
    }

    fn intercept_incoming_upstream(
        &self,
        call: &ServiceCallIdentifier,
        input: IncomingStreamInput,
        next: Next<IncomingStreamInput, Execution>,
    ) -> BoxFuture<'static, Execution> {
        self.with_session(call, input, next)
    }

    fn intercept_incoming_downstream(
        &self,
        call: &ServiceCallIdentifier,
        payload: SerializedPayload,
        next: Next<SerializedPayload, StreamExecution>,
    ) -> BoxFuture<'static, StreamExecution> {
        self.with_session(call, payload, next)
    }

    fn intercept_incoming_bistream(
        &self,
        call: &ServiceCallIdentifier,
        input: IncomingStreamInput,
        next: Next<IncomingStreamInput, StreamExecution>,
    ) -> BoxFuture<'static, StreamExecution> {
        self.with_session(call, input, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::description::SingleCallDescription;
    use crate::registry::ServiceRegistry;
    use crate::testing::TestPair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const USER: ContextKey<String> = ContextKey::new("test.user");
    const COUNTER: ContextKey<i64> = ContextKey::new("test.counter");

    struct Sessions {
        pair: TestPair,
        client: Session,
        server: Session,
    }

    async fn sessions(config: NodeConfig, registry: Arc<ServiceRegistry>) -> Sessions {
        let client = SessionExtension::new();
        let server = SessionExtension::new();
        let pair = TestPair::builder()
            .with_config(config)
            .with_server_registry(registry)
            .with_client_extension(client.clone())
            .with_server_extension(server.clone())
            .connect()
            .await;
        Sessions {
            pair,
            client: client.session(),
            server: server.session(),
        }
    }

    async fn default_sessions() -> Sessions {
        sessions(NodeConfig::default(), Arc::new(ServiceRegistry::new())).await
    }

    #[tokio::test]
    async fn test_set_is_accepted_on_both_sides() {
        let s = default_sessions().await;

        s.client.set(&USER, &"alice".to_string()).await.unwrap();
        assert_eq!(s.client.get(&USER).unwrap(), Some("alice".to_string()));
        assert_eq!(s.server.get(&USER).unwrap(), Some("alice".to_string()));
        assert_eq!(s.server.item(USER.name()).unwrap().revision, 1);

        s.client.set(&USER, &"bob".to_string()).await.unwrap();
        assert_eq!(s.server.item(USER.name()).unwrap().revision, 2);
        assert_eq!(s.client.snapshot(), s.server.snapshot());

        s.server.remove(&USER).await.unwrap();
        assert_eq!(s.client.get(&USER).unwrap(), None);
        assert_eq!(s.server.get(&USER).unwrap(), None);
        assert!(!s.pair.client.is_closed());
    }

    #[tokio::test]
    async fn test_stale_transaction_is_retried() {
        let s = default_sessions().await;

        // The server already holds a value the client has not seen.
        let mut seeded = ContextUpdateRequest::default();
        seeded.modifications.insert(
            COUNTER.name().to_string(),
            Modification::Set {
                old_revision: None,
                new_item: ContextItem {
                    revision: 1,
                    value: Value::from(100),
                },
            },
        );
        assert_eq!(s.server.apply_update(seeded), ContextUpdateResult::Accepted);

        let runs = AtomicUsize::new(0);
        s.client
            .context_transaction(|mutator| {
                runs.fetch_add(1, Ordering::SeqCst);
                let current = mutator.get(&COUNTER)?.unwrap_or(0);
                mutator.set(&COUNTER, &(current + 1))
            })
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(s.client.get(&COUNTER).unwrap(), Some(101));
        assert_eq!(s.server.get(&COUNTER).unwrap(), Some(101));
        assert_eq!(s.server.item(COUNTER.name()).unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let config = NodeConfig::default().with_max_transaction_attempts(1);
        let s = sessions(config, Arc::new(ServiceRegistry::new())).await;

        let mut seeded = ContextUpdateRequest::default();
        seeded.modifications.insert(
            COUNTER.name().to_string(),
            Modification::Set {
                old_revision: None,
                new_item: ContextItem {
                    revision: 1,
                    value: Value::from(5),
                },
            },
        );
        s.server.apply_update(seeded);

        let err = s.client.set(&COUNTER, &1).await.unwrap_err();
        assert!(matches!(err, SessionError::RetriesExhausted { attempts: 1 }));
        // The rejection still refreshed the local view.
        assert_eq!(s.client.get(&COUNTER).unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_alternating_writers_converge() {
        let s = default_sessions().await;

        for round in 0..10 {
            let session = if round % 2 == 0 { &s.client } else { &s.server };
            session
                .context_transaction(|mutator| {
                    let current = mutator.get(&COUNTER)?.unwrap_or(0);
                    mutator.set(&COUNTER, &(current + 1))
                })
                .await
                .unwrap();
        }

        assert_eq!(s.client.get(&COUNTER).unwrap(), Some(10));
        assert_eq!(s.client.snapshot(), s.server.snapshot());
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_writers_are_accepted() {
        let s = default_sessions().await;

        let dave = "dave".to_string();
        let (user, counter) = tokio::join!(
            s.client.set(&USER, &dave),
            s.server.set(&COUNTER, &3)
        );
        user.unwrap();
        counter.unwrap();

        assert_eq!(s.client.get(&USER).unwrap(), Some("dave".to_string()));
        assert_eq!(s.client.get(&COUNTER).unwrap(), Some(3));
        assert_eq!(s.client.snapshot(), s.server.snapshot());
        assert_eq!(s.server.item(USER.name()).unwrap().revision, 1);
        assert_eq!(s.client.item(COUNTER.name()).unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_local_transactions_are_serialized() {
        let s = default_sessions().await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let session = s.client.clone();
                tokio::spawn(async move {
                    session
                        .context_transaction(|mutator| {
                            let current = mutator.get(&COUNTER)?.unwrap_or(0);
                            mutator.set(&COUNTER, &(current + 1))
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(s.client.get(&COUNTER).unwrap(), Some(8));
        assert_eq!(s.server.get(&COUNTER).unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_apply_update_reports_conflicts() {
        let session = Session::new();
        let mut first = ContextUpdateRequest::default();
        first.modifications.insert(
            "a".to_string(),
            Modification::Set {
                old_revision: None,
                new_item: ContextItem {
                    revision: 1,
                    value: Value::from("x"),
                },
            },
        );
        assert_eq!(session.apply_update(first), ContextUpdateResult::Accepted);

        let mut stale = ContextUpdateRequest::default();
        stale
            .modifications
            .insert("a".to_string(), Modification::Required { old_revision: None });
        stale
            .modifications
            .insert("b".to_string(), Modification::Remove { old_revision: 3 });
        stale.modifications.insert(
            "c".to_string(),
            Modification::Set {
                old_revision: None,
                new_item: ContextItem {
                    revision: 1,
                    value: Value::from(true),
                },
            },
        );

        let ContextUpdateResult::Rejected { reasons } = session.apply_update(stale) else {
            panic!("expected a rejection");
        };
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons["b"], RejectionReason::Removed);
        assert!(matches!(
            &reasons["a"],
            RejectionReason::Updated { new_item } if new_item.revision == 1
        ));
        // Nothing was applied, not even the modification that matched.
        assert!(session.item("c").is_none());
    }

    #[tokio::test]
    async fn test_unbound_session_refuses_transactions() {
        let extension = SessionExtension::new();
        let err = extension
            .session()
            .set(&USER, &"nobody".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotBound));
    }

    #[tokio::test]
    async fn test_incoming_calls_see_the_session() {
        let whoami: SingleCallDescription<(), Option<String>, ()> =
            SingleCallDescription::new("test.Whoami", "whoami");
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(
            ServiceDescription::new(
                "test.Whoami",
                vec![whoami.bind(|_: ()| async move {
                    let session = current().expect("no current session");
                    Ok::<_, ()>(session.get(&USER).unwrap_or(None))
                })],
            )
            .unwrap(),
        );
        let s = sessions(NodeConfig::default(), registry).await;

        s.client.set(&USER, &"carol".to_string()).await.unwrap();
        let transport = s.pair.client.transport();
        let seen = transport.single_call(&whoami, &()).await.unwrap();
        assert_eq!(seen, Some("carol".to_string()));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_eager_handler_code_sees_the_session() {
        let attached: SingleCallDescription<(), bool, ()> =
            SingleCallDescription::new("test.Eager", "attached");
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(
            ServiceDescription::new(
                "test.Eager",
                vec![attached.bind(|_: ()| {
                    let seen = current().is_some();
                    async move { Ok::<_, ()>(seen) }
                })],
            )
            .unwrap(),
        );
        let s = sessions(NodeConfig::default(), registry).await;

        let transport = s.pair.client.transport();
        assert!(transport.single_call(&attached, &()).await.unwrap());
    }

    #[tokio::test]
    async fn test_context_wire_format() {
        let mut request = ContextUpdateRequest::default();
        request
            .modifications
            .insert("k".to_string(), Modification::Remove { old_revision: 2 });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "modifications": { "k": { "type": "remove", "old_revision": 2 } } })
        );

        let rejected: ContextUpdateResult = serde_json::from_value(serde_json::json!({
            "result": "rejected",
            "reasons": { "k": { "type": "removed" } }
        }))
        .unwrap();
        assert!(matches!(rejected, ContextUpdateResult::Rejected { .. }));
    }
}

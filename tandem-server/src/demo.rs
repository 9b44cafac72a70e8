//! The `demo.Echo` service: one call of every shape, plus a call that writes
//! to the connection's session context.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::session::{self, ContextKey};
use tandem_core::{
    CallError, ColdBistreamCallDescription, ColdDownstreamCallDescription,
    ColdUpstreamCallDescription, DescriptionError, LocalStream, PendingCall, RemoteStream,
    RpcTransport, ServiceDescription, ServiceDescriptor, SingleCallDescription,
};

pub const ECHO_SERVICE_ID: &str = "demo.Echo";

/// Upper bound for `repeat`.
pub const MAX_REPEATS: u32 = 1000;

/// Context entry written by `remember`.
pub const LAST_MESSAGE: ContextKey<String> = ContextKey::new("demo.Echo.last");

/// Errors declared by every `demo.Echo` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoError {
    TooManyRepeats { requested: u32, limit: u32 },
    NoSession,
    Session(String),
    Stream(String),
}

impl From<CallError<EchoError>> for EchoError {
    fn from(error: CallError<EchoError>) -> Self {
        match error {
            CallError::Application(error) => error,
            other => EchoError::Stream(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRequest {
    pub text: String,
    pub count: u32,
}

/// The typed call table shared by the service and its client.
#[derive(Clone)]
pub struct EchoCalls {
    pub echo: SingleCallDescription<String, String, EchoError>,
    pub join: ColdUpstreamCallDescription<String, String, String, EchoError>,
    pub repeat: ColdDownstreamCallDescription<RepeatRequest, String, EchoError>,
    pub uppercase: ColdBistreamCallDescription<(), String, String, EchoError>,
    pub remember: SingleCallDescription<String, u64, EchoError>,
}

impl Default for EchoCalls {
    fn default() -> Self {
        Self {
            echo: SingleCallDescription::new(ECHO_SERVICE_ID, "echo"),
            join: ColdUpstreamCallDescription::new(ECHO_SERVICE_ID, "join"),
            repeat: ColdDownstreamCallDescription::new(ECHO_SERVICE_ID, "repeat"),
            uppercase: ColdBistreamCallDescription::new(ECHO_SERVICE_ID, "uppercase"),
            remember: SingleCallDescription::new(ECHO_SERVICE_ID, "remember"),
        }
    }
}

/// Implementation of `demo.Echo`.
#[derive(Debug, Default)]
pub struct EchoService;

impl EchoService {
    pub async fn echo(&self, text: String) -> Result<String, EchoError> {
        Ok(text)
    }

    pub async fn join(
        &self,
        separator: String,
        parts: RemoteStream<String, EchoError>,
    ) -> Result<String, EchoError> {
        let parts: Vec<String> = parts
            .map(|part| part.map_err(EchoError::from))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
        Ok(parts.join(&separator))
    }

    pub fn repeat(
        &self,
        request: RepeatRequest,
    ) -> Result<LocalStream<String, EchoError>, EchoError> {
        if request.count > MAX_REPEATS {
            return Err(EchoError::TooManyRepeats {
                requested: request.count,
                limit: MAX_REPEATS,
            });
        }
        let text = request.text;
        Ok(futures::stream::iter((0..request.count).map(move |_| Ok(text.clone()))).boxed())
    }

    pub fn uppercase(
        &self,
        words: RemoteStream<String, EchoError>,
    ) -> LocalStream<String, EchoError> {
        words
            .map(|word| word.map(|w| w.to_uppercase()).map_err(EchoError::from))
            .boxed()
    }

    /// Stores `text` in the caller's session and returns its new revision.
    pub async fn remember(&self, text: String) -> Result<u64, EchoError> {
        let session = session::current().ok_or(EchoError::NoSession)?;
        session
            .set(&LAST_MESSAGE, &text)
            .await
            .map_err(|e| EchoError::Session(e.to_string()))?;
        session
            .item(LAST_MESSAGE.name())
            .map(|item| item.revision)
            .ok_or_else(|| EchoError::Session("value vanished after update".to_string()))
    }
}

pub struct EchoDescriptor;

impl ServiceDescriptor for EchoDescriptor {
    type Service = EchoService;

    const SERVICE_ID: &'static str = ECHO_SERVICE_ID;

    fn describe(service: Arc<EchoService>) -> Result<ServiceDescription, DescriptionError> {
        let calls = EchoCalls::default();

        let echo = {
            let service = service.clone();
            calls.echo.bind(move |text| {
                let service = service.clone();
                async move { service.echo(text).await }
            })
        };
        let join = {
            let service = service.clone();
            calls.join.bind(move |separator, parts| {
                let service = service.clone();
                async move { service.join(separator, parts).await }
            })
        };
        let repeat = {
            let service = service.clone();
            calls.repeat.bind(move |request| {
                let opened = service.repeat(request);
                async move { opened }
            })
        };
        let uppercase = {
            let service = service.clone();
            calls.uppercase.bind(move |(), words| {
                let upper = service.uppercase(words);
                async move { Ok(upper) }
            })
        };
        let remember = calls.remember.bind(move |text| {
            let service = service.clone();
            async move { service.remember(text).await }
        });

        ServiceDescription::new(
            Self::SERVICE_ID,
            vec![echo, join, repeat, uppercase, remember],
        )
    }
}

/// Describes a fresh [`EchoService`].
pub fn echo_service() -> Result<ServiceDescription, DescriptionError> {
    EchoDescriptor::describe(Arc::new(EchoService))
}

/// Typed client for `demo.Echo`.
#[derive(Clone)]
pub struct EchoClient {
    transport: RpcTransport,
    calls: EchoCalls,
}

impl EchoClient {
    pub fn new(transport: RpcTransport) -> Self {
        Self {
            transport,
            calls: EchoCalls::default(),
        }
    }

    pub fn echo(&self, text: &str) -> PendingCall<Result<String, CallError<EchoError>>> {
        self.transport.single_call(&self.calls.echo, &text.to_string())
    }

    pub fn join(
        &self,
        separator: &str,
        parts: LocalStream<String, EchoError>,
    ) -> PendingCall<Result<String, CallError<EchoError>>> {
        self.transport
            .client_stream(&self.calls.join, &separator.to_string(), parts)
    }

    pub fn repeat(
        &self,
        text: &str,
        count: u32,
    ) -> PendingCall<Result<RemoteStream<String, EchoError>, CallError<EchoError>>> {
        let request = RepeatRequest {
            text: text.to_string(),
            count,
        };
        self.transport.server_stream(&self.calls.repeat, &request)
    }

    pub fn uppercase(
        &self,
        words: LocalStream<String, EchoError>,
    ) -> PendingCall<Result<RemoteStream<String, EchoError>, CallError<EchoError>>> {
        self.transport.bi_stream(&self.calls.uppercase, &(), words)
    }

    pub fn remember(&self, text: &str) -> PendingCall<Result<u64, CallError<EchoError>>> {
        self.transport
            .single_call(&self.calls.remember, &text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{LoopbackConnection, RpcNode, ServiceRegistry, SessionExtension};

    struct Demo {
        client: EchoClient,
        client_session: Arc<SessionExtension>,
    }

    fn spawn(node: RpcNode) {
        tokio::spawn(async move { node.run().await });
    }

    async fn demo() -> Demo {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(echo_service().unwrap());

        let (client_end, server_end) = LoopbackConnection::pair();
        let client_session = SessionExtension::new();
        let client = RpcNode::builder(client_end)
            .with_extension(client_session.clone())
            .with_label("client")
            .build()
            .unwrap();
        let server = RpcNode::builder(server_end)
            .with_registry(registry)
            .with_extension(SessionExtension::new())
            .with_label("server")
            .build()
            .unwrap();
        let transport = client.transport();
        spawn(client);
        spawn(server);

        Demo {
            client: EchoClient::new(transport),
            client_session,
        }
    }

    fn words(items: &[&str]) -> LocalStream<String, EchoError> {
        let items: Vec<Result<String, EchoError>> =
            items.iter().map(|s| Ok(s.to_string())).collect();
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_echo() {
        let demo = demo().await;
        assert_eq!(demo.client.echo("hello").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_join() {
        let demo = demo().await;
        let joined = demo.client.join(", ", words(&["a", "b", "c"])).await.unwrap();
        assert_eq!(joined, "a, b, c");

        let empty = demo.client.join("-", words(&[])).await.unwrap();
        assert_eq!(empty, "");
    }

    #[tokio::test]
    async fn test_join_propagates_caller_error() {
        let demo = demo().await;
        let parts: LocalStream<String, EchoError> = futures::stream::iter(vec![
            Ok("a".to_string()),
            Err(EchoError::NoSession),
        ])
        .boxed();
        let err = demo.client.join(",", parts).await.unwrap_err();
        assert_eq!(err, CallError::Application(EchoError::NoSession));
    }

    #[tokio::test]
    async fn test_repeat() {
        let demo = demo().await;
        let stream = demo.client.repeat("hi", 3).await.unwrap();
        let items: Vec<String> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, vec!["hi", "hi", "hi"]);

        let err = match demo.client.repeat("hi", MAX_REPEATS + 1).await {
            Err(err) => err,
            Ok(_) => panic!("expected the repeat to be refused"),
        };
        assert_eq!(
            err,
            CallError::Application(EchoError::TooManyRepeats {
                requested: MAX_REPEATS + 1,
                limit: MAX_REPEATS
            })
        );
    }

    #[tokio::test]
    async fn test_uppercase() {
        let demo = demo().await;
        let stream = demo
            .client
            .uppercase(words(&["tandem", "rpc"]))
            .await
            .unwrap();
        let items: Vec<String> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, vec!["TANDEM", "RPC"]);
    }

    #[tokio::test]
    async fn test_remember_syncs_caller_session() {
        let demo = demo().await;
        assert_eq!(demo.client.remember("first").await.unwrap(), 1);
        assert_eq!(demo.client.remember("second").await.unwrap(), 2);

        let session = demo.client_session.session();
        assert_eq!(
            session.get(&LAST_MESSAGE).unwrap(),
            Some("second".to_string())
        );
        assert_eq!(session.item(LAST_MESSAGE.name()).unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_remember_without_session() {
        let service = EchoService;
        assert_eq!(
            service.remember("x".into()).await.unwrap_err(),
            EchoError::NoSession
        );
    }
}

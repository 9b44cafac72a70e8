//! High-level client API.

use crate::error::ClientError;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    NodeConfig, RpcExtension, RpcNode, RpcTransport, ServiceRegistry, Session, SessionExtension,
    StreamConnection,
};
use tokio::net::TcpStream;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Settings of the client's node.
    pub node: NodeConfig,
    /// Label used in log lines.
    pub label: String,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            node: NodeConfig::default(),
            label: "client".to_string(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_node_config(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A client connection to a tandem server.
///
/// Calls are made through [`Client::transport`] with typed client facades.
/// The server may call services in the client's registry over the same
/// connection.
pub struct Client {
    config: ClientConfig,
    registry: Arc<ServiceRegistry>,
    extensions: Vec<Arc<dyn RpcExtension>>,
    session: Option<Session>,
    node: Mutex<Option<RpcNode>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ServiceRegistry::new()),
            extensions: Vec::new(),
            session: None,
            node: Mutex::new(None),
        }
    }

    /// Serves `registry` to the server.
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_extension(mut self, extension: Arc<dyn RpcExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Keeps a session context in sync with the server's.
    pub fn with_session(mut self) -> Self {
        let extension = SessionExtension::new();
        self.session = Some(extension.session());
        self.with_extension(extension)
    }

    /// The synchronized session, if enabled.
    ///
    /// The session lives as long as the client; it is not reset by
    /// reconnecting.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Connects to the server and starts serving the connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;
        stream.set_nodelay(true).ok();

        let mut builder = RpcNode::builder(StreamConnection::new(stream))
            .with_registry(self.registry.clone())
            .with_config(self.config.node.clone())
            .with_label(self.config.label.clone());
        for extension in &self.extensions {
            builder = builder.with_extension(extension.clone());
        }
        let node = builder.build()?;

        let running = node.clone();
        let addr = self.config.addr;
        tokio::spawn(async move {
            match running.run().await {
                Ok(()) => tracing::debug!("Disconnected from {}", addr),
                Err(e) => tracing::warn!("Connection to {} failed: {}", addr, e),
            }
        });

        tracing::info!("Connected to {}", addr);
        *self.node.lock() = Some(node);
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.node
            .lock()
            .as_ref()
            .is_some_and(|node| !node.is_closed())
    }

    /// Returns a transport for performing calls on the server.
    pub fn transport(&self) -> Result<RpcTransport, ClientError> {
        self.node
            .lock()
            .as_ref()
            .filter(|node| !node.is_closed())
            .map(RpcNode::transport)
            .ok_or(ClientError::NotConnected)
    }

    /// Closes the connection. Pending calls fail with a connection error.
    pub async fn close(&self) {
        let node = self.node.lock().take();
        if let Some(node) = node {
            node.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tandem_core::{CallError, LocalStream, SingleCallDescription};
    use tandem_server::demo::{echo_service, EchoClient, EchoError, LAST_MESSAGE};
    use tandem_server::{Server, ServerConfig};
    use tokio::net::TcpListener;

    async fn start_server() -> (Arc<Server>, SocketAddr) {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(echo_service().unwrap());
        let server = Arc::new(Server::new(ServerConfig::default(), registry).with_sessions());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_not_connected() {
        let client = Client::new(ClientConfig::new("127.0.0.1:1".parse().unwrap()));
        assert!(!client.is_connected());
        assert!(matches!(client.transport(), Err(ClientError::NotConnected)));
        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(ClientConfig::new(addr));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_calls_and_session() {
        let (server, addr) = start_server().await;
        let client = Client::new(ClientConfig::new(addr)).with_session();
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(matches!(
            client.connect().await,
            Err(ClientError::AlreadyConnected)
        ));

        let echo = EchoClient::new(client.transport().unwrap());
        assert_eq!(echo.echo("ping").await.unwrap(), "ping");

        let parts: LocalStream<String, EchoError> =
            futures::stream::iter(vec![Ok("x".to_string()), Ok("y".to_string())]).boxed();
        assert_eq!(echo.join("+", parts).await.unwrap(), "x+y");

        let repeated: Vec<_> = echo
            .repeat("r", 2)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(repeated, vec!["r", "r"]);

        assert_eq!(echo.remember("note").await.unwrap(), 1);
        let session = client.session().unwrap();
        assert_eq!(session.get(&LAST_MESSAGE).unwrap(), Some("note".to_string()));

        client.close().await;
        assert!(!client.is_connected());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_remember_without_session_is_refused() {
        let (server, addr) = start_server().await;
        let client = Client::new(ClientConfig::new(addr));
        client.connect().await.unwrap();

        let echo = EchoClient::new(client.transport().unwrap());
        match echo.remember("lost").await {
            Err(CallError::Application(EchoError::Session(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_peer_calls_back_into_client() {
        let greet: SingleCallDescription<String, String, ()> =
            SingleCallDescription::new("client.Greeter", "greet");
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(
            tandem_core::ServiceDescription::new(
                "client.Greeter",
                vec![greet.bind(|name: String| async move { Ok(format!("hello {}", name)) })],
            )
            .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Client::new(ClientConfig::new(addr)).with_registry(registry);
        client.connect().await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let peer = RpcNode::builder(StreamConnection::new(stream))
            .with_label("peer")
            .build()
            .unwrap();
        let running = peer.clone();
        tokio::spawn(async move { running.run().await });

        let reply = peer
            .transport()
            .single_call(&greet, &"server".to_string())
            .await
            .unwrap();
        assert_eq!(reply, "hello server");

        peer.close().await;
        for _ in 0..100 {
            if !client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!client.is_connected());
    }
}

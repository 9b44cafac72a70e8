//! TCP server implementation.
//!
//! Every accepted connection gets its own [`RpcNode`] serving the shared
//! registry. Extensions are created per connection from factories, so each
//! connection has its own session context.

use crate::config::Config;
use crate::error::ServerError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{
    NodeConfig, RpcExtensionFactory, RpcNode, ServiceRegistry, SessionExtension,
    StreamConnection,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Settings of every per-connection node.
    pub node: NodeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            node: config.rpc.node_config(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_node_config(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for tandem.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ServiceRegistry>,
    extensions: Vec<Arc<dyn RpcExtensionFactory>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a server serving `registry`.
    pub fn new(config: ServerConfig, registry: Arc<ServiceRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            extensions: Vec::new(),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Adds an extension factory, invoked once per connection.
    pub fn with_extension(mut self, factory: impl RpcExtensionFactory) -> Self {
        self.extensions.push(Arc::new(factory));
        self
    }

    /// Gives every connection a synchronized session context.
    pub fn with_sessions(self) -> Self {
        self.with_extension(SessionExtension::factory())
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({} services)",
            listener.local_addr()?,
            self.registry.len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let node = match self.connection_node(tcp_stream, addr) {
                                Ok(node) => node,
                                Err(e) => {
                                    tracing::error!("[{}] Failed to set up node: {}", addr, e);
                                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                    continue;
                                }
                            };

                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);
                                let served = Self::handle_connection(&node, &mut conn_shutdown);
                                if let Err(e) = served.await {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Builds the node for one accepted connection.
    fn connection_node(&self, stream: TcpStream, addr: SocketAddr) -> Result<RpcNode, ServerError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Could not disable Nagle: {}", addr, e);
        }
        let mut builder = RpcNode::builder(StreamConnection::new(stream))
            .with_registry(self.registry.clone())
            .with_config(self.config.node.clone())
            .with_label(addr.to_string());
        for factory in &self.extensions {
            builder = builder.with_extension(factory.create());
        }
        Ok(builder.build()?)
    }

    /// Runs one connection's node until the peer leaves or the server stops.
    async fn handle_connection(
        node: &RpcNode,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tokio::select! {
            result = node.run() => Ok(result?),
            _ = shutdown.recv() => {
                tracing::debug!("[{}] Shutdown signal received", node.label());
                node.close().await;
                Err(ServerError::ShuttingDown)
            }
        }
    }

    /// Initiates server shutdown. Open connections are closed, failing
    /// their pending calls.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{echo_service, EchoClient};
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(echo_service().unwrap());
        let server = Arc::new(Server::new(config, registry).with_sessions());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> RpcNode {
        let stream = TcpStream::connect(addr).await.unwrap();
        let node = RpcNode::builder(StreamConnection::new(stream))
            .with_extension(SessionExtension::new())
            .with_label("test-client")
            .build()
            .unwrap();
        let running = node.clone();
        tokio::spawn(async move { running.run().await });
        node
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_server_config_from_file_config() {
        let mut config = Config::default();
        config.network.max_connections = 3;
        config.rpc.close_linger_ms = 10;
        let server_config = ServerConfig::from(&config);
        assert_eq!(server_config.max_connections, 3);
        assert_eq!(server_config.node.close_linger, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let server = Server::new(ServerConfig::default(), Arc::new(ServiceRegistry::new()));
        assert!(!server.is_running());
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_calls_over_tcp() {
        let (server, addr) = start(ServerConfig::default()).await;
        let node = connect(addr).await;
        let client = EchoClient::new(node.transport());

        assert_eq!(client.echo("over tcp").await.unwrap(), "over tcp");
        assert_eq!(client.remember("kept").await.unwrap(), 1);
        assert!(server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);

        node.close().await;
        wait_for(|| server.stats().connections_active.load(Ordering::Relaxed) == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_each_connection_has_its_own_session() {
        let (server, addr) = start(ServerConfig::default()).await;
        let first = EchoClient::new(connect(addr).await.transport());
        let second = EchoClient::new(connect(addr).await.transport());

        assert_eq!(first.remember("a").await.unwrap(), 1);
        assert_eq!(first.remember("b").await.unwrap(), 2);
        assert_eq!(second.remember("c").await.unwrap(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(ServerConfig::default().with_max_connections(1)).await;
        let first = connect(addr).await;
        let client = EchoClient::new(first.transport());
        assert_eq!(client.echo("one").await.unwrap(), "one");

        let _rejected = TcpStream::connect(addr).await.unwrap();
        wait_for(|| server.stats().connections_rejected.load(Ordering::Relaxed) == 1).await;
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, addr) = start(ServerConfig::default()).await;
        let node = connect(addr).await;
        let client = EchoClient::new(node.transport());
        assert_eq!(client.echo("x").await.unwrap(), "x");

        server.shutdown();
        wait_for(|| !server.is_running()).await;
        wait_for(|| node.is_closed()).await;
        assert!(client.echo("y").await.is_err());
    }
}

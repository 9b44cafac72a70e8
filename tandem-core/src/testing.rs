//! Test fixtures: a calculator service with one call per shape and helpers
//! that connect two nodes in memory.

use crate::config::NodeConfig;
use crate::connection::LoopbackConnection;
use crate::description::{
    ColdBistreamCallDescription, ColdDownstreamCallDescription, ColdUpstreamCallDescription,
    LocalStream, RemoteStream, ServiceDescription, ServiceDescriptor, SingleCallDescription,
};
use crate::error::{CallError, DescriptionError};
use crate::interceptor::RpcExtension;
use crate::node::{RpcNode, RpcNodeBuilder, RpcTransport};
use crate::pending::PendingCall;
use crate::registry::ServiceRegistry;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const CALCULATOR_ID: &str = "test.Calculator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum CalculatorError {
    Rejected { reason: String, code: i32 },
}

fn flatten(error: CallError<CalculatorError>) -> CalculatorError {
    match error {
        CallError::Application(error) => error,
        other => CalculatorError::Rejected {
            reason: other.to_string(),
            code: 0,
        },
    }
}

type Calc<Req, Resp> = SingleCallDescription<Req, Resp, CalculatorError>;

#[derive(Clone)]
pub(crate) struct CalculatorCalls {
    pub multiply: Calc<(i64, i64), i64>,
    pub error: Calc<String, ()>,
    pub slow: Calc<(), ()>,
    pub sum: ColdUpstreamCallDescription<(), i64, i64, CalculatorError>,
    pub sum_with_initial: ColdUpstreamCallDescription<i64, i64, i64, CalculatorError>,
    pub first: ColdUpstreamCallDescription<(), i64, Option<i64>, CalculatorError>,
    pub timer: ColdDownstreamCallDescription<i64, i64, CalculatorError>,
    pub broken_timer: ColdDownstreamCallDescription<i64, i64, CalculatorError>,
    pub multiply_each_by_two: ColdBistreamCallDescription<(), i64, i64, CalculatorError>,
}

impl CalculatorCalls {
    pub fn new() -> Self {
        Self {
            multiply: SingleCallDescription::new(CALCULATOR_ID, "multiply"),
            error: SingleCallDescription::new(CALCULATOR_ID, "error"),
            slow: SingleCallDescription::new(CALCULATOR_ID, "slow"),
            sum: ColdUpstreamCallDescription::new(CALCULATOR_ID, "sum"),
            sum_with_initial: ColdUpstreamCallDescription::new(CALCULATOR_ID, "sum_with_initial"),
            first: ColdUpstreamCallDescription::new(CALCULATOR_ID, "first"),
            timer: ColdDownstreamCallDescription::new(CALCULATOR_ID, "timer"),
            broken_timer: ColdDownstreamCallDescription::new(CALCULATOR_ID, "broken_timer"),
            multiply_each_by_two: ColdBistreamCallDescription::new(
                CALCULATOR_ID,
                "multiply_each_by_two",
            ),
        }
    }
}

pub(crate) struct Calculator;

impl Calculator {
    async fn multiply(&self, (a, b): (i64, i64)) -> Result<i64, CalculatorError> {
        Ok(a.checked_mul(b).expect("multiplication overflow"))
    }

    async fn sum(
        &self,
        initial: i64,
        mut numbers: RemoteStream<i64, CalculatorError>,
    ) -> Result<i64, CalculatorError> {
        let mut total = initial;
        while let Some(number) = numbers.next().await {
            total += number.map_err(flatten)?;
        }
        Ok(total)
    }

    fn timer(&self, count: i64) -> LocalStream<i64, CalculatorError> {
        futures::stream::iter(0..count)
            .then(|tick| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(tick)
            })
            .boxed()
    }

    /// Counts like `timer` but panics when it reaches `broken_at`.
    fn broken_timer(&self, broken_at: i64) -> LocalStream<i64, CalculatorError> {
        futures::stream::iter(0..)
            .map(move |tick| {
                if tick == broken_at {
                    panic!("tick {} is broken", tick);
                }
                Ok(tick)
            })
            .boxed()
    }
}

pub(crate) struct CalculatorDescriptor;

impl ServiceDescriptor for CalculatorDescriptor {
    type Service = Calculator;

    const SERVICE_ID: &'static str = CALCULATOR_ID;

    fn describe(service: Arc<Calculator>) -> Result<ServiceDescription, DescriptionError> {
        let calls = CalculatorCalls::new();
        let multiply = {
            let service = service.clone();
            calls.multiply.bind(move |factors| {
                let service = service.clone();
                async move { service.multiply(factors).await }
            })
        };
        let sum = {
            let service = service.clone();
            calls.sum.bind(move |(), numbers| {
                let service = service.clone();
                async move { service.sum(0, numbers).await }
            })
        };
        let sum_with_initial = {
            let service = service.clone();
            calls.sum_with_initial.bind(move |initial, numbers| {
                let service = service.clone();
                async move { service.sum(initial, numbers).await }
            })
        };
        let timer = {
            let service = service.clone();
            calls.timer.bind(move |count| {
                let ticks = service.timer(count);
                async move { Ok(ticks) }
            })
        };
        let broken_timer = {
            let service = service.clone();
            calls.broken_timer.bind(move |broken_at| {
                let ticks = service.broken_timer(broken_at);
                async move { Ok(ticks) }
            })
        };

        ServiceDescription::new(
            Self::SERVICE_ID,
            vec![
                multiply,
                calls.error.bind(|reason| async move {
                    Err(CalculatorError::Rejected { reason, code: 7 })
                }),
                calls.slow.bind(|()| async move {
                    futures::future::pending::<()>().await;
                    Ok(())
                }),
                sum,
                sum_with_initial,
                calls.first.bind(|(), mut numbers| async move {
                    numbers.next().await.transpose().map_err(flatten)
                }),
                timer,
                broken_timer,
                calls.multiply_each_by_two.bind(|(), numbers| async move {
                    let doubled = numbers.map(|number| number.map(|n| n * 2).map_err(flatten));
                    Ok(doubled.boxed())
                }),
            ],
        )
    }
}

pub(crate) fn calculator_registry() -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new());
    let description = CalculatorDescriptor::describe(Arc::new(Calculator))
        .expect("calculator description is consistent");
    registry.register(description);
    registry
}

/// Typed client facade over a transport.
#[derive(Clone)]
pub(crate) struct CalculatorClient {
    transport: RpcTransport,
    calls: CalculatorCalls,
}

impl CalculatorClient {
    pub fn new(transport: RpcTransport) -> Self {
        Self {
            transport,
            calls: CalculatorCalls::new(),
        }
    }

    pub fn multiply(&self, a: i64, b: i64) -> PendingCall<Result<i64, CallError<CalculatorError>>> {
        self.transport.single_call(&self.calls.multiply, &(a, b))
    }

    pub fn error(&self, reason: String) -> PendingCall<Result<(), CallError<CalculatorError>>> {
        self.transport.single_call(&self.calls.error, &reason)
    }

    pub fn slow(&self) -> PendingCall<Result<(), CallError<CalculatorError>>> {
        self.transport.single_call(&self.calls.slow, &())
    }

    pub fn sum(
        &self,
        numbers: LocalStream<i64, CalculatorError>,
    ) -> PendingCall<Result<i64, CallError<CalculatorError>>> {
        self.transport.client_stream(&self.calls.sum, &(), numbers)
    }

    pub fn sum_with_initial(
        &self,
        initial: i64,
        numbers: LocalStream<i64, CalculatorError>,
    ) -> PendingCall<Result<i64, CallError<CalculatorError>>> {
        self.transport
            .client_stream(&self.calls.sum_with_initial, &initial, numbers)
    }

    pub fn first(
        &self,
        numbers: LocalStream<i64, CalculatorError>,
    ) -> PendingCall<Result<Option<i64>, CallError<CalculatorError>>> {
        self.transport.client_stream(&self.calls.first, &(), numbers)
    }

    pub fn timer(
        &self,
        count: i64,
    ) -> PendingCall<Result<RemoteStream<i64, CalculatorError>, CallError<CalculatorError>>> {
        self.transport.server_stream(&self.calls.timer, &count)
    }

    pub fn broken_timer(
        &self,
        broken_at: i64,
    ) -> PendingCall<Result<RemoteStream<i64, CalculatorError>, CallError<CalculatorError>>> {
        self.transport
            .server_stream(&self.calls.broken_timer, &broken_at)
    }

    pub fn multiply_each_by_two(
        &self,
        numbers: LocalStream<i64, CalculatorError>,
    ) -> PendingCall<Result<RemoteStream<i64, CalculatorError>, CallError<CalculatorError>>> {
        self.transport
            .bi_stream(&self.calls.multiply_each_by_two, &(), numbers)
    }
}

fn spawn_node(builder: RpcNodeBuilder) -> RpcNode {
    let node = builder.build().expect("node builds");
    let running = node.clone();
    tokio::spawn(async move { running.run().await });
    node
}

/// Two running nodes connected in memory. The server serves the calculator.
pub(crate) struct TestPair {
    pub client: RpcNode,
    pub server: RpcNode,
}

impl TestPair {
    pub fn builder() -> TestPairBuilder {
        TestPairBuilder {
            config: NodeConfig::default(),
            server_registry: calculator_registry(),
            client_extensions: Vec::new(),
            server_extensions: Vec::new(),
        }
    }

    pub async fn with_config(config: NodeConfig) -> Self {
        Self::builder().with_config(config).connect().await
    }
}

pub(crate) struct TestPairBuilder {
    config: NodeConfig,
    server_registry: Arc<ServiceRegistry>,
    client_extensions: Vec<Arc<dyn RpcExtension>>,
    server_extensions: Vec<Arc<dyn RpcExtension>>,
}

impl TestPairBuilder {
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_server_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.server_registry = registry;
        self
    }

    pub fn with_client_extension(mut self, extension: Arc<dyn RpcExtension>) -> Self {
        self.client_extensions.push(extension);
        self
    }

    pub fn with_server_extension(mut self, extension: Arc<dyn RpcExtension>) -> Self {
        self.server_extensions.push(extension);
        self
    }

    pub async fn connect(self) -> TestPair {
        let (client_end, server_end) = LoopbackConnection::pair();
        let mut client = RpcNode::builder(client_end)
            .with_config(self.config.clone())
            .with_label("client");
        for extension in self.client_extensions {
            client = client.with_extension(extension);
        }
        let mut server = RpcNode::builder(server_end)
            .with_config(self.config)
            .with_registry(self.server_registry)
            .with_label("server");
        for extension in self.server_extensions {
            server = server.with_extension(extension);
        }
        TestPair {
            client: spawn_node(client),
            server: spawn_node(server),
        }
    }
}

pub(crate) async fn connected_pair() -> TestPair {
    TestPair::builder().connect().await
}

/// A running calculator node and the raw other end of its connection.
pub(crate) fn raw_peer(config: NodeConfig) -> (RpcNode, LoopbackConnection) {
    let (node_end, peer) = LoopbackConnection::pair();
    let node = spawn_node(
        RpcNode::builder(node_end)
            .with_config(config)
            .with_registry(calculator_registry())
            .with_label("server"),
    );
    (node, peer)
}

//! # tandem-core
//!
//! RPC engine for tandem.
//!
//! This crate provides:
//! - Typed call descriptions for single, cold upstream, cold downstream and
//!   cold bistream calls
//! - A mutable service registry
//! - Per-call caller and callee state machines with cancellation and cold
//!   stream flow control
//! - The RPC node that multiplexes calls over one connection
//! - Interceptor chains contributed by extensions
//! - Session context synchronization with optimistic concurrency

pub mod config;
pub mod connection;
pub mod description;
pub mod error;
pub mod interceptor;
pub mod node;
mod pending;
pub mod registry;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::NodeConfig;
pub use connection::{Connection, LoopbackConnection, StreamConnection};
pub use description::{
    CallShape, ColdBistreamCallDescription, ColdDownstreamCallDescription,
    ColdUpstreamCallDescription, LocalStream, RemoteStream, RunnableCallDescription,
    ServiceDescription, ServiceDescriptor, SingleCallDescription, WireType,
};
pub use error::{CallError, ConnectionError, DescriptionError, NodeError, SessionError};
pub use interceptor::{InterceptorChain, RpcExtension, RpcExtensionFactory};
pub use node::{RpcNode, RpcNodeBuilder, RpcTransport, WeakRpcTransport};
pub use pending::{CancelHandle, PendingCall};
pub use registry::ServiceRegistry;
pub use session::{ContextKey, Session, SessionExtension};

//! # tandem-server
//!
//! TCP server for tandem.
//!
//! This crate provides:
//! - TCP connection handling with one RPC node per connection
//! - Per-connection extensions, including session context synchronization
//! - YAML and environment based configuration
//! - The `demo.Echo` service

pub mod config;
pub mod demo;
pub mod error;
pub mod server;

pub use config::{Config, ConfigError, NetworkConfig, RpcConfig};
pub use demo::{echo_service, EchoClient, EchoError, EchoService};
pub use error::ServerError;
pub use server::{Server, ServerConfig, ServerStats};

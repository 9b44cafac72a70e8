//! # tandem-client
//!
//! Client library for tandem.
//!
//! This crate provides:
//! - Async TCP connect with timeout
//! - An RPC node bound to the socket, so the server may call back into
//!   services the client registers
//! - Optional session context synchronization

pub mod client;
pub mod error;

pub use client::{Client, ClientConfig};
pub use error::ClientError;

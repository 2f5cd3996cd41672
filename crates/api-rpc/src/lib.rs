//! JSON-RPC API Layer
//!
//! Exposes the command execution engine over JSON-RPC 2.0: submit, status,
//! cancel and list calls, a health probe, and a live event subscription.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use handler::RpcHandler;
pub use server::{RpcServer, RpcServerConfig};

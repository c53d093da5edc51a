//! `keystone` realizes the Model Context Protocol over `mortar`'s HTTP
//! engine: a JSON-RPC 2.0 dispatcher, a session table with a replayable
//! event history for SSE resumption, and the flat JSON configuration
//! document the server is assembled from.

pub mod config;
pub mod dispatch;
pub mod jsonrpc;
pub mod session;
pub mod toolset;

pub use crate::config::McpConfig;
pub use crate::dispatch::{Dispatcher, MethodCtx};
pub use crate::jsonrpc::{RequestId, RpcError};

//! `mortar` is an embeddable networking core: a single-threaded readiness
//! reactor, a socket layer spanning stream, datagram and local transports,
//! and an HTTP/1.1 server with routing, keep-alive, chunked and SSE
//! streaming, content negotiation and an optional worker pool.

pub mod http;
pub mod middleware;
pub mod net;
pub mod pool;

pub use crate::http::engine::{Acceptor, HttpConnection, ServerConfig, ServerCore};
pub use crate::http::request::HttpRequest;
pub use crate::http::response::{Body, HttpResponse};
pub use crate::net::addr::BindAddress;
pub use crate::net::reactor::{ConnHandle, Reactor, ReactorConfig, StopHandle};
pub use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};

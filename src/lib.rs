//! # drover
//!
//! Server-side HTTP protocol drivers: HTTP/1.0, HTTP/1.1 and HTTP/2 over any
//! async byte transport.
//!
//! The acceptor hands each socket and its [`Client`] to
//! [`Server::serve_connection`]. The driver parses requests, calls the
//! [`Handler`] and writes the responses back with the framing the protocol
//! requires. TLS, routing and connection acceptance stay with the caller.

pub mod body;
pub mod client;
mod connection;
pub mod error;
pub mod handler;
pub mod options;
pub mod request;
pub mod response;
pub mod server;
pub mod timeout;
pub mod transport;

// Re-exports
pub use body::Body;
pub use client::{Client, ClientIds, TlsInfo};
pub use error::{BoxError, ClientError, Error, H2Error, Result};
pub use handler::{DefaultErrorHandler, ErrorHandler, Handler, HandlerFuture};
pub use options::Options;
pub use request::{Protocol, Request, RequestHead};
pub use response::{BodyWriter, Push, Response, ResponseBody, TrailersSender, Upgraded};
pub use server::Server;
pub use timeout::TimeoutQueue;

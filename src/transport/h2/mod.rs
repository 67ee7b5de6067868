//! HTTP/2 server side (RFC 9113) with HPACK (RFC 7541).
//!
//! Frames are encoded and decoded in [`frame`]; [`connection`] holds the
//! per-connection state machine and [`driver`] runs it over a socket.

pub(crate) mod connection;
pub(crate) mod driver;
pub(crate) mod flow;
pub mod frame;
pub(crate) mod headers;
pub mod hpack;
pub(crate) mod stream;

pub(crate) use driver::serve;
pub use frame::{ErrorCode, CONNECTION_PREFACE};

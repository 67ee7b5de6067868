//! HTTP/1.0 and HTTP/1.1 (RFC 9112).

pub(crate) mod chunked;
pub(crate) mod driver;
pub(crate) mod encode;
pub(crate) mod parse;

pub(crate) use driver::{serve, Handoff, H2cUpgrade, Outcome};

//! Driver selection for one accepted socket.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::debug;

use crate::client::Client;
use crate::error::Result;
use crate::server::Context;
use crate::transport::h1::{self, Handoff, Outcome};
use crate::transport::{h2, Io};

/// ALPN protocol id that selects HTTP/2.
const ALPN_H2: &str = "h2";

/// The protocol currently driving a connection. The only transition is
/// HTTP/1.x to HTTP/2.
enum Driver<T> {
    Http1 { io: T, buffered: BytesMut },
    Http2(Handoff<T>),
}

/// Serve `io` until the connection ends; then close `client` and drop its
/// timeouts. A socket handed to an upgrade callback is left open.
pub(crate) async fn serve<T: Io>(io: T, client: Arc<Client>, ctx: Arc<Context>) -> Result<()> {
    let mut driver = if client.alpn() == Some(ALPN_H2) {
        Driver::Http2(Handoff {
            io,
            buffered: BytesMut::new(),
            upgrade: None,
        })
    } else {
        Driver::Http1 {
            io,
            buffered: BytesMut::new(),
        }
    };

    let result = loop {
        driver = match driver {
            Driver::Http1 { io, buffered } => match h1::serve(io, client.clone(), ctx.clone(), buffered).await {
                Ok(Outcome::Closed) => break Ok(()),
                Ok(Outcome::Upgraded) => {
                    ctx.timeouts.remove_client(client.id());
                    return Ok(());
                }
                Ok(Outcome::Http2(handoff)) => {
                    debug!(client = client.id(), h2c = handoff.upgrade.is_some(), "switching to http/2");
                    Driver::Http2(handoff)
                }
                Err(e) => break Err(e),
            },
            Driver::Http2(Handoff { io, buffered, upgrade }) => {
                break h2::serve(io, client.clone(), ctx.clone(), buffered, upgrade).await
            }
        };
    };

    ctx.timeouts.remove_client(client.id());
    client.close();
    if let Err(e) = &result {
        debug!(client = client.id(), error = %e, "connection ended with error");
    }
    result
}

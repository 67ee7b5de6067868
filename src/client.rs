//! Per-connection client identity and close/shutdown signalling.
//!
//! A [`Client`] is created by the acceptor for every accepted socket and
//! shared (behind an `Arc`) by the protocol driver, the request handlers and
//! the timeout queue. Closing it wakes every task waiting on
//! [`Client::closed`], which is how timeouts and handlers tear a connection
//! down without touching the socket themselves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// Read direction closed.
pub const CLOSED_RD: u8 = 1;
/// Write direction closed.
pub const CLOSED_WR: u8 = 2;
/// Both directions closed; the client is dead.
pub const CLOSED_RDWR: u8 = CLOSED_RD | CLOSED_WR;

/// TLS session details handed over by the acceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Negotiated ALPN protocol (`h2`, `http/1.1`).
    pub alpn: Option<String>,
    /// SNI host name the client asked for.
    pub server_name: Option<String>,
    /// Protocol version string, e.g. `TLSv1.3`.
    pub version: Option<String>,
}

impl TlsInfo {
    pub fn with_alpn(alpn: impl Into<String>) -> Self {
        Self {
            alpn: Some(alpn.into()),
            ..Self::default()
        }
    }
}

/// Monotonic client id source owned by the acceptor.
#[derive(Debug, Default)]
pub struct ClientIds(AtomicU64);

impl ClientIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id, starting at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// An accepted connection.
#[derive(Debug)]
pub struct Client {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    tls: Option<TlsInfo>,
    status: watch::Sender<u8>,
    shutdown: watch::Sender<bool>,
}

impl Client {
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        tls: Option<TlsInfo>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            local_addr,
            tls,
            status: watch::Sender::new(0),
            shutdown: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// ALPN protocol negotiated during the TLS handshake, if any.
    pub fn alpn(&self) -> Option<&str> {
        self.tls.as_ref()?.alpn.as_deref()
    }

    /// Current status bits (`CLOSED_RD`, `CLOSED_WR`).
    pub fn status(&self) -> u8 {
        *self.status.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.status() & CLOSED_RDWR == CLOSED_RDWR
    }

    pub fn close_read(&self) {
        self.mark(CLOSED_RD);
    }

    pub fn close_write(&self) {
        self.mark(CLOSED_WR);
    }

    /// Close both directions and wake everything waiting on [`Client::closed`].
    pub fn close(&self) {
        self.mark(CLOSED_RDWR);
    }

    fn mark(&self, bits: u8) {
        self.status.send_modify(|s| *s |= bits);
    }

    /// Resolves once both directions are closed.
    pub async fn closed(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| s & CLOSED_RDWR == CLOSED_RDWR).await;
    }

    /// Ask the driver to finish in-flight work and close (GOAWAY on HTTP/2,
    /// `connection: close` on the next HTTP/1.x response).
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once a graceful shutdown was requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }
}

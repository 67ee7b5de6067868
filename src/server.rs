//! Shared per-server state and the public entry point for accepted sockets.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use drover::{Client, ClientIds, Options, Request, Response, Server};
//!
//! let server = Server::new(Options::default(), |_req: Request| async {
//!     Ok(Response::ok("hello"))
//! })?;
//! let _sweeper = server.spawn_sweeper();
//!
//! let ids = ClientIds::new();
//! loop {
//!     let (tcp, remote) = listener.accept().await?;
//!     let client = Arc::new(Client::new(ids.next(), remote, tcp.local_addr()?, None));
//!     let server = server.clone();
//!     tokio::spawn(async move { server.serve_connection(tcp, client).await });
//! }
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::client::Client;
use crate::connection;
use crate::error::Result;
use crate::handler::{DefaultErrorHandler, ErrorHandler, Handler};
use crate::options::Options;
use crate::timeout::{TimeoutQueue, SWEEP_PERIOD};
use crate::transport::Io;

/// What every driver of a server needs.
pub(crate) struct Context {
    pub options: Options,
    pub handler: Arc<dyn Handler>,
    pub errors: Arc<dyn ErrorHandler>,
    pub timeouts: TimeoutQueue,
}

/// Serves accepted connections with one handler and one set of [`Options`].
///
/// Cheap to clone; clones share the timeout queue.
#[derive(Clone)]
pub struct Server {
    ctx: Arc<Context>,
}

impl Server {
    /// Fails with [`Error::Config`](crate::Error::Config) if `options` is invalid.
    pub fn new(options: Options, handler: impl Handler) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            ctx: Arc::new(Context {
                options,
                handler: Arc::new(handler),
                errors: Arc::new(DefaultErrorHandler),
                timeouts: TimeoutQueue::new(),
            }),
        })
    }

    /// Replace the renderer used for protocol errors and handler failures.
    pub fn error_handler(self, errors: impl ErrorHandler) -> Self {
        let ctx = &self.ctx;
        Self {
            ctx: Arc::new(Context {
                options: ctx.options.clone(),
                handler: ctx.handler.clone(),
                errors: Arc::new(errors),
                timeouts: ctx.timeouts.clone(),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.ctx.options
    }

    pub fn timeouts(&self) -> &TimeoutQueue {
        &self.ctx.timeouts
    }

    /// Start the background task that expires idle connections and streams.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.ctx.timeouts.spawn_sweeper(SWEEP_PERIOD)
    }

    /// Run the protocol driver for one accepted transport until it closes.
    ///
    /// The client's ALPN protocol selects HTTP/2 (`h2`) or HTTP/1.x. The
    /// client is closed when this returns, unless the socket was handed to
    /// an upgrade callback.
    pub async fn serve_connection<T: Io>(&self, io: T, client: Arc<Client>) -> Result<()> {
        connection::serve(io, client, self.ctx.clone()).await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.ctx.options)
            .field("timeouts", &self.ctx.timeouts.len())
            .finish()
    }
}

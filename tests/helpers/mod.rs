#![allow(dead_code)]

pub mod h1_client;
pub mod h2_client;

use std::sync::Arc;

use drover::{Client, Handler, Options, Server, TlsInfo};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

/// Pipe capacity between the test client and the driver.
const PIPE_SIZE: usize = 256 * 1024;

/// Install a trace-level subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("drover=trace")
        .with_test_writer()
        .try_init();
}

/// Server side of one driven connection.
pub struct Harness {
    pub client: Arc<Client>,
    pub server: Server,
    pub task: JoinHandle<drover::Result<()>>,
}

/// Serve an in-memory connection with `handler` and return the client end
/// of the pipe. `alpn` simulates the protocol negotiated by TLS.
pub fn connect(options: Options, handler: impl Handler, alpn: Option<&str>) -> (DuplexStream, Harness) {
    let server = Server::new(options, handler).expect("valid options");
    let (io, remote) = tokio::io::duplex(PIPE_SIZE);
    let client = Arc::new(Client::new(
        1,
        "127.0.0.1:50000".parse().unwrap(),
        "127.0.0.1:8080".parse().unwrap(),
        alpn.map(TlsInfo::with_alpn),
    ));
    let task = tokio::spawn({
        let server = server.clone();
        let client = client.clone();
        async move { server.serve_connection(remote, client).await }
    });
    (
        io,
        Harness {
            client,
            server,
            task,
        },
    )
}

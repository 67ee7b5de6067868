//! HTTP/2 connection driver.
//!
//! Three cooperating parts share one connection:
//! - a reader task that checks the client preface and decodes frames,
//! - a writer task that owns the write half and resolves DATA acks,
//! - the driver loop, which owns [`Connection`] and spawns one task per
//!   stream to run the handler.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::connection::{Connection, Dispatch};
use super::frame::{ErrorCode, Frame, FrameHeader, CONNECTION_PREFACE, FRAME_HEADER_SIZE};
use super::stream::{self, Outbound};
use crate::client::Client;
use crate::error::{Error, H2Error, Result};
use crate::server::Context;
use crate::transport::h1::H2cUpgrade;
use crate::transport::Io;

/// Bytes reserved in the read buffer before each socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Frame batches queued between the reader and the driver loop.
const FRAME_QUEUE: usize = 4;

type FrameBatch = Vec<std::result::Result<Frame, H2Error>>;
type WriteJob = (Bytes, Vec<oneshot::Sender<()>>);

/// Drive an HTTP/2 connection until it is closed or fully drained.
///
/// `buffered` holds bytes already read from the socket; it must start with
/// (a prefix of) the client connection preface.
pub(crate) async fn serve<T: Io>(
    io: T,
    client: Arc<Client>,
    ctx: Arc<Context>,
    buffered: BytesMut,
    upgrade: Option<H2cUpgrade>,
) -> Result<()> {
    debug!(client = client.id(), remote = %client.remote_addr(), upgraded = upgrade.is_some(), "serving http/2");
    let (read_half, write_half) = tokio::io::split(io);

    let (frame_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
    let reader = tokio::spawn(read_frames(read_half, buffered, ctx.options.max_frame_size, frame_tx));
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(write_half, write_rx, client.clone()));

    let (command_tx, mut commands) = mpsc::unbounded_channel();
    let (out_tx, mut outbound) = mpsc::unbounded_channel();
    let mut conn = Connection::new(client.clone(), ctx.clone(), command_tx);
    conn.preface();

    let mut failure = None;
    if let Some(H2cUpgrade { settings, head }) = upgrade {
        if let Err(e) = conn.adopt_upgrade(&settings, head) {
            conn.go_away(e.code(), &e.to_string());
            failure = Some(e);
        }
    }

    while failure.is_none() {
        dispatch(&mut conn, &ctx, &out_tx);
        flush(&mut conn, &write_tx);
        if conn.is_done() {
            debug!(client = client.id(), "http/2 connection drained");
            conn.go_away(ErrorCode::NoError, "drained");
            break;
        }

        tokio::select! {
            batch = frames.recv() => {
                let Some(batch) = batch else {
                    trace!(client = client.id(), "peer closed the connection");
                    break;
                };
                failure = receive(&mut conn, batch);
                while failure.is_none() {
                    match frames.try_recv() {
                        Ok(batch) => failure = receive(&mut conn, batch),
                        Err(_) => break,
                    }
                }
            }
            Some(event) = outbound.recv() => {
                conn.send(event);
                while let Ok(event) = outbound.try_recv() {
                    conn.send(event);
                }
            }
            Some(command) = commands.recv() => conn.command(command),
            _ = client.shutdown_requested(), if !conn.is_draining() => {
                debug!(client = client.id(), "shutdown requested");
                conn.go_away(ErrorCode::NoError, "shutdown");
            }
            _ = client.closed() => {
                trace!(client = client.id(), "client closed");
                break;
            }
        }
    }

    conn.abort_all();
    flush(&mut conn, &write_tx);
    drop(write_tx);
    reader.abort();
    match tokio::time::timeout(ctx.options.connection_timeout, writer).await {
        Ok(_) => {}
        Err(_) => {
            debug!(client = client.id(), "timed out flushing final frames");
            client.close();
        }
    }

    match failure {
        Some(e) => Err(Error::Http2(e)),
        None => Ok(()),
    }
}

/// Feed one batch to the connection; returns the connection error, if any.
fn receive(conn: &mut Connection, batch: FrameBatch) -> Option<H2Error> {
    for frame in batch {
        if let Err(e) = conn.receive(frame) {
            return Some(e);
        }
    }
    None
}

/// Start a task for every stream that became ready and is still alive.
fn dispatch(conn: &mut Connection, ctx: &Arc<Context>, out: &mpsc::UnboundedSender<Outbound>) {
    for item in conn.take_ready() {
        let stream_id = item.stream_id();
        if !conn.is_alive(stream_id) {
            trace!(stream_id, "stream reset before dispatch");
            continue;
        }
        let task = match item {
            Dispatch::Request(request) => tokio::spawn(stream::answer(
                ctx.handler.clone(),
                ctx.errors.clone(),
                request,
                out.clone(),
            )),
            Dispatch::Reply(stream_id, response) => {
                tokio::spawn(stream::send_response(stream_id, response, false, out.clone()))
            }
        };
        conn.set_task(stream_id, task.abort_handle());
    }
}

fn flush(conn: &mut Connection, write_tx: &mpsc::UnboundedSender<WriteJob>) {
    if conn.out.is_empty() && conn.acks.is_empty() {
        return;
    }
    let job = (conn.out.split().freeze(), std::mem::take(&mut conn.acks));
    // a closed writer drops the acks, which fails the waiting producers
    let _ = write_tx.send(job);
}

async fn read_frames<R>(mut io: R, mut buf: BytesMut, max_frame_size: u32, tx: mpsc::Sender<FrameBatch>)
where
    R: AsyncRead + Unpin,
{
    let preface_len = CONNECTION_PREFACE.len();
    loop {
        let n = buf.len().min(preface_len);
        if buf[..n] != CONNECTION_PREFACE[..n] {
            let _ = tx.send(vec![Err(H2Error::protocol("invalid connection preface"))]).await;
            return;
        }
        if n == preface_len {
            buf.advance(preface_len);
            break;
        }
        match io.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }

    loop {
        let mut batch = FrameBatch::new();
        while let Some(head) = FrameHeader::parse(&buf) {
            if head.length > max_frame_size {
                batch.push(Err(H2Error::connection(
                    ErrorCode::FrameSizeError,
                    format!("frame of {} octets", head.length),
                )));
                let _ = tx.send(batch).await;
                return;
            }
            let total = FRAME_HEADER_SIZE + head.length as usize;
            if buf.len() < total {
                buf.reserve(total - buf.len());
                break;
            }
            buf.advance(FRAME_HEADER_SIZE);
            let payload = buf.split_to(head.length as usize).freeze();
            let frame = Frame::decode(&head, payload);
            let fatal = matches!(frame, Err(H2Error::Connection { .. }));
            batch.push(frame);
            if fatal {
                let _ = tx.send(batch).await;
                return;
            }
        }
        if !batch.is_empty() && tx.send(batch).await.is_err() {
            return;
        }

        buf.reserve(READ_CHUNK);
        match io.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "http/2 read failed");
                return;
            }
        }
    }
}

async fn write_frames<W>(mut io: W, mut rx: mpsc::UnboundedReceiver<WriteJob>, client: Arc<Client>)
where
    W: AsyncWrite + Unpin,
{
    while let Some((mut bytes, mut acks)) = rx.recv().await {
        // coalesce whatever else is already queued
        if let Ok((more, more_acks)) = rx.try_recv() {
            let mut joined = BytesMut::from(&bytes[..]);
            joined.extend_from_slice(&more);
            while let Ok((more, extra)) = rx.try_recv() {
                joined.extend_from_slice(&more);
                acks.extend(extra);
            }
            acks.extend(more_acks);
            bytes = joined.freeze();
        }

        let write = async {
            io.write_all(&bytes).await?;
            io.flush().await
        };
        let result = tokio::select! {
            result = write => result,
            _ = client.closed() => return,
        };
        if let Err(e) = result {
            warn!(client = client.id(), error = %e, "http/2 write failed");
            client.close();
            return;
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
    let _ = io.shutdown().await;
}

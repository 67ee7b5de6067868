//! Per-stream state and the task that answers one stream.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

use super::flow::{RecvFlow, SendWindow};
use super::frame::{ErrorCode, Priority};
use crate::body::BodySender;
use crate::handler::{self, ErrorHandler, Handler};
use crate::request::{Request, RequestHead};
use crate::response::{Push, Response, ResponseBody};

/// Stream state bits. A stream with neither closed bit is open.
pub(crate) mod state {
    /// Promised by PUSH_PROMISE, response headers not sent yet.
    pub const RESERVED: u8 = 0x1;
    /// The peer sent END_STREAM.
    pub const REMOTE_CLOSED: u8 = 0x2;
    /// We sent END_STREAM.
    pub const LOCAL_CLOSED: u8 = 0x4;
    pub const CLOSED: u8 = REMOTE_CLOSED | LOCAL_CLOSED;
}

/// Queued outbound item waiting for flow-control credit.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Data {
        data: Bytes,
        end_stream: bool,
        /// Resolved once the last byte of `data` is handed to the writer.
        ack: Option<oneshot::Sender<()>>,
    },
    /// Trailers go out only after every queued DATA frame.
    Trailers(HeaderMap),
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub id: u32,
    pub state: u8,
    pub send: SendWindow,
    pub recv: RecvFlow,
    /// Producer of the request body; `None` when no body is expected or the
    /// body is complete.
    pub body: Option<BodySender>,
    /// Content-length announced by the request, if any.
    pub expected_len: Option<u64>,
    /// DATA payload bytes received (padding excluded).
    pub received: u64,
    pub pending: VecDeque<Outgoing>,
    pub priority: Priority,
    pub headers_sent: bool,
    /// The handler task, aborted on reset.
    pub task: Option<AbortHandle>,
    /// Request head kept for push promises; `None` when pushing is off.
    pub head: Option<RequestHead>,
}

impl Stream {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: 0,
            send: SendWindow::new(send_window),
            recv: RecvFlow::new(recv_window),
            body: None,
            expected_len: None,
            received: 0,
            pending: VecDeque::new(),
            priority: Priority::default(),
            headers_sent: false,
            task: None,
            head: None,
        }
    }

    pub fn is(&self, bits: u8) -> bool {
        self.state & bits == bits
    }

    pub fn remote_closed(&self) -> bool {
        self.is(state::REMOTE_CLOSED)
    }

    pub fn local_closed(&self) -> bool {
        self.is(state::LOCAL_CLOSED)
    }

    /// Both directions done and nothing left to write.
    pub fn is_finished(&self) -> bool {
        self.is(state::CLOSED) && self.pending.is_empty()
    }

    /// Reset: fail the body consumer and stop the handler.
    pub fn cancel(&mut self, err: crate::error::Error) {
        if let Some(body) = self.body.take() {
            body.push(crate::body::BodyEvent::Error(err));
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // dropped acks wake the producer with an error
        self.pending.clear();
    }
}

/// Message from a stream task to the driver.
#[derive(Debug)]
pub(crate) enum Outbound {
    Response {
        stream_id: u32,
        status: StatusCode,
        headers: HeaderMap,
        end_stream: bool,
        pushes: Vec<Push>,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        ack: Option<oneshot::Sender<()>>,
    },
    Trailers {
        stream_id: u32,
        trailers: HeaderMap,
    },
    Reset {
        stream_id: u32,
        code: ErrorCode,
    },
}

/// Run the handler for one stream and feed its response to the driver.
pub(crate) async fn answer(
    handler: Arc<dyn Handler>,
    errors: Arc<dyn ErrorHandler>,
    request: Request,
    tx: mpsc::UnboundedSender<Outbound>,
) {
    let stream_id = request.stream_id();
    let head_only = request.method() == Method::HEAD;
    let response = handler::respond(handler, errors, request).await;
    send_response(stream_id, response, head_only, tx).await;
}

/// Statuses that never carry content.
fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

/// Emit `response` on `stream_id`: HEADERS, DATA as flow control allows,
/// then trailers or an empty END_STREAM DATA frame.
pub(crate) async fn send_response(
    stream_id: u32,
    mut response: Response,
    head_only: bool,
    tx: mpsc::UnboundedSender<Outbound>,
) {
    let trailers = response.trailers.take();
    let bodyless = head_only || is_bodyless(response.status);
    let end_stream = bodyless || (response.body.is_empty() && trailers.is_none());
    let mut headers = std::mem::take(&mut response.headers);
    if !is_bodyless(response.status) && !headers.contains_key(CONTENT_LENGTH) {
        if let Some(len) = response.body.len() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
    }
    let head = Outbound::Response {
        stream_id,
        status: response.status,
        headers,
        end_stream,
        pushes: std::mem::take(&mut response.pushes),
    };
    if tx.send(head).is_err() || end_stream {
        return;
    }

    match response.body {
        ResponseBody::Empty => {}
        ResponseBody::Full(data) => {
            let end_stream = trailers.is_none();
            if tx.send(Outbound::Data { stream_id, data, end_stream, ack: None }).is_err() {
                return;
            }
            if end_stream {
                return;
            }
        }
        ResponseBody::Stream(mut rx) => loop {
            match rx.recv().await {
                Some(Ok(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    let (ack, written) = oneshot::channel();
                    let item = Outbound::Data { stream_id, data, end_stream: false, ack: Some(ack) };
                    if tx.send(item).is_err() || written.await.is_err() {
                        // stream reset or connection gone: the writer sees a disconnect
                        return;
                    }
                }
                Some(Err(e)) => {
                    debug!(stream_id, error = %e, "response body aborted");
                    let _ = tx.send(Outbound::Reset { stream_id, code: ErrorCode::InternalError });
                    return;
                }
                None => break,
            }
        },
    }

    let last = match trailers {
        Some(rx) => match rx.await {
            Ok(trailers) if !trailers.is_empty() => Outbound::Trailers { stream_id, trailers },
            _ => Outbound::Data { stream_id, data: Bytes::new(), end_stream: true, ack: None },
        },
        None => Outbound::Data { stream_id, data: Bytes::new(), end_stream: true, ack: None },
    };
    let _ = tx.send(last);
}

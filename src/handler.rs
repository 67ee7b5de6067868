//! Application seams: the request handler and the error page renderer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use tokio::task::JoinHandle;

use crate::error::BoxError;
use crate::request::{Request, RequestHead};
use crate::response::Response;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, BoxError>> + Send>>;

/// Produces a response for every parsed request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    fn handle(&self, request: Request) -> HandlerFuture {
        Box::pin(self(request))
    }
}

/// Renders error responses for protocol failures (400, 413, 431, 501, 505)
/// and handler failures (500).
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle_error(
        &self,
        status: StatusCode,
        reason: Option<&str>,
        request: Option<&RequestHead>,
    ) -> Response;
}

/// Minimal HTML error page.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error(
        &self,
        status: StatusCode,
        _reason: Option<&str>,
        _request: Option<&RequestHead>,
    ) -> Response {
        let title = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error")
        );
        let page = format!(
            "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\
             <body><h1>{title}</h1></body></html>\n"
        );
        Response::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
            .with_body(Bytes::from(page))
    }
}

/// Aborts the handler task if the driver stops waiting for it.
struct AbortOnDrop(JoinHandle<Result<Response, BoxError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the handler in its own task and turn failures into a 500.
pub(crate) async fn respond(
    handler: Arc<dyn Handler>,
    errors: Arc<dyn ErrorHandler>,
    request: Request,
) -> Response {
    let head = request.head().clone();
    let mut task = AbortOnDrop(tokio::spawn(handler.handle(request)));

    match (&mut task.0).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::error!(method = %head.method, uri = %head.uri, error = %err, "handler failed");
            let reason = err.to_string();
            errors.handle_error(StatusCode::INTERNAL_SERVER_ERROR, Some(&reason), Some(&head))
        }
        Err(join) => {
            if join.is_panic() {
                tracing::error!(method = %head.method, uri = %head.uri, "handler panicked");
            }
            errors.handle_error(StatusCode::INTERNAL_SERVER_ERROR, None, Some(&head))
        }
    }
}

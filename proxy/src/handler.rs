use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::io;

use crate::record::RequestRecord;

/// Body of a handler response.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Pieces produced lazily; the framer decides how they go on the wire.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        ResponseBody::Full(value)
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        ResponseBody::Full(value.into())
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(value.as_bytes()))
    }
}

/// What an upstream handler hands back: status, headers and a body. The
/// middleware frames it onto the wire; handlers never write sockets.
pub struct HandlerResponse {
    pub status: StatusCode,
    /// Overrides the canonical reason phrase on the status line.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl HandlerResponse {
    pub fn new(status: StatusCode) -> Self {
        HandlerResponse {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// An empty response with an explicit `Content-Length: 0`.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status).header(CONTENT_LENGTH, HeaderValue::from(0u64))
    }

    /// A complete in-memory response; content length is filled in from the
    /// body.
    pub fn full(status: StatusCode, content_type: HeaderValue, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, HeaderValue::from(body.len() as u64))
            .body(body)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<ResponseBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

pub type HandlerFuture<'a> = BoxFuture<'a, anyhow::Result<Option<HandlerResponse>>>;

/// An upstream handler or host-bound sub-app.
///
/// The return is deliberately three-state: `Err` aborts the request,
/// `Ok(Some(..))` is the response, `Ok(None)` means "declined, fall
/// through to the next handler in line".
pub trait HttpHandler: Send + Sync + 'static {
    fn invoke<'a>(&'a self, req: &'a mut RequestRecord) -> HandlerFuture<'a>;
}

/// Adapter turning a plain async fn into a [`HttpHandler`].
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut RequestRecord) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        HandlerFn(f)
    }
}

impl<F> HttpHandler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut RequestRecord) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn invoke<'a>(&'a self, req: &'a mut RequestRecord) -> HandlerFuture<'a> {
        (self.0)(req)
    }
}

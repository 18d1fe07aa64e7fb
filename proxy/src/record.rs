use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::io::BoxedIo;
use wsgiprox_shared::uri::{Scheme, split_path_query};

/// Inner protocol of a request. Everything the middleware frames keys off
/// this: chunked encoding exists only on HTTP/1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }

    pub fn from_minor(minor: u8) -> Option<Protocol> {
        match minor {
            0 => Some(Protocol::Http10),
            1 => Some(Protocol::Http11),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity body of a request: the connection stream positioned at the
/// first unread body byte, capped at the declared content length.
///
/// The body also keeps the tunnel alive: the stream it wraps is the whole
/// duplex connection, and the tunnel side takes it back out with
/// [`Body::take_io`] once the handler is done reading.
#[derive(Default)]
pub struct Body {
    io: Option<BoxedIo>,
    remaining: u64,
}

impl Body {
    pub fn empty() -> Self {
        Body {
            io: None,
            remaining: 0,
        }
    }

    pub fn new(io: BoxedIo, content_length: u64) -> Self {
        Body {
            io: Some(io),
            remaining: content_length,
        }
    }

    /// Bytes of body left to read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Take the underlying connection stream out of the body. Reads after
    /// this return EOF.
    pub fn take_io(&mut self) -> Option<BoxedIo> {
        self.io.take()
    }

    pub fn has_io(&self) -> bool {
        self.io.is_some()
    }

    /// Drain the rest of the body into one buffer.
    pub async fn bytes(&mut self) -> io::Result<Bytes> {
        let mut buf = Vec::with_capacity(self.remaining.min(64 * 1024) as usize);
        self.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let Some(io) = me.io.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let limit = me.remaining.min(dst.remaining() as u64) as usize;
        let mut sub = dst.take(limit);
        ready!(Pin::new(io).poll_read(cx, &mut sub))?;

        let n = sub.filled().len();
        unsafe {
            dst.assume_init(n);
        }
        dst.advance(n);
        me.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("remaining", &self.remaining)
            .field("attached", &self.io.is_some())
            .finish()
    }
}

/// The environment handed to the upstream handler. Header names follow the
/// CGI convention: upper-cased, `-` mapped to `_`, prefixed with `HTTP_`
/// except for `CONTENT_LENGTH` and `CONTENT_TYPE`.
pub struct RequestRecord {
    pub method: String,
    pub protocol: Protocol,
    pub scheme: Scheme,
    /// Path + query after rewriting.
    pub request_uri: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: Body,
    /// Set when the CONNECT/absolute-URI host matched a registered virtual
    /// host.
    pub matched_host: Option<String>,
    /// The proxy's own declared virtual hostname, or the matched alias.
    pub proxy_host: String,
    /// Hosting servers that own the raw client stream directly can park it
    /// here for the extractor registry.
    pub raw_socket: Option<BoxedIo>,
}

impl RequestRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> u64 {
        self.header("CONTENT_LENGTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Re-derive `path` and `query` after `request_uri` changed.
    pub fn sync_path_query(&mut self) {
        let (path, query) = split_path_query(&self.request_uri);
        self.path = path;
        self.query = query;
    }
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("method", &self.method)
            .field("protocol", &self.protocol)
            .field("scheme", &self.scheme)
            .field("request_uri", &self.request_uri)
            .field("matched_host", &self.matched_host)
            .field("proxy_host", &self.proxy_host)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn body_over(content: &'static [u8], content_length: u64) -> Body {
        let (mut near, far) = tokio::io::duplex(1024);
        near.write_all(content).await.unwrap();
        drop(near);
        Body::new(Box::new(far), content_length)
    }

    #[tokio::test]
    async fn body_stops_at_content_length() {
        let mut body = body_over(b"0123456789tail", 10).await;
        let bytes = body.bytes().await.unwrap();
        assert_eq!(&bytes[..], b"0123456789");
        assert_eq!(body.remaining(), 0);
    }

    #[tokio::test]
    async fn body_after_take_io_is_empty() {
        let mut body = body_over(b"data", 4).await;
        let io = body.take_io();
        assert!(io.is_some());
        assert!(!body.has_io());
        assert_eq!(body.bytes().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn empty_body_reads_eof() {
        let mut body = Body::empty();
        assert_eq!(body.bytes().await.unwrap().len(), 0);
    }

    #[test]
    fn sync_path_query_splits_on_first_question_mark() {
        let mut req = RequestRecord {
            method: "GET".to_string(),
            protocol: Protocol::Http11,
            scheme: Scheme::Http,
            request_uri: "/prefix/http://example.com/p?foo=bar".to_string(),
            path: String::new(),
            query: String::new(),
            headers: HashMap::new(),
            body: Body::empty(),
            matched_host: None,
            proxy_host: String::new(),
            raw_socket: None,
        };
        req.sync_path_query();
        assert_eq!(req.path, "/prefix/http://example.com/p");
        assert_eq!(req.query, "foo=bar");
        assert_eq!(req.request_uri, format!("{}?{}", req.path, req.query));
    }
}

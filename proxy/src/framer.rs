use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::ProxyError;
use crate::handler::{HandlerResponse, ResponseBody};
use crate::record::Protocol;
use crate::spool::SpooledBody;

/// How a response body goes onto the wire. Decided from the handler's
/// headers and the inner protocol before any body byte is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The handler supplied its own framing (`Content-Length` or an
    /// explicit `Transfer-Encoding`); emit everything verbatim.
    Passthrough,
    /// No length given, HTTP/1.1 inside: chunked transfer encoding.
    Chunked,
    /// No length given, HTTP/1.0 inside: the body has to be buffered and
    /// measured, there is no other framing signal the client could use.
    Buffered,
}

pub fn decide_framing(headers: &HeaderMap, protocol: Protocol) -> Framing {
    if headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING) {
        Framing::Passthrough
    } else {
        match protocol {
            Protocol::Http11 => Framing::Chunked,
            Protocol::Http10 => Framing::Buffered,
        }
    }
}

/// Writes a complete, well-framed HTTP response onto a stream the
/// middleware owns end-to-end. Over a CONNECT tunnel there is no hosting
/// server left to delegate framing to.
pub struct ResponseFramer<W> {
    writer: W,
    protocol: Protocol,
    headers_sent: bool,
}

impl<W: AsyncWrite + Unpin> ResponseFramer<W> {
    pub fn new(writer: W, protocol: Protocol) -> Self {
        ResponseFramer {
            writer,
            protocol,
            headers_sent: false,
        }
    }

    /// Once true, the status line and headers are on the wire and only body
    /// bytes may follow.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub async fn send(&mut self, resp: HandlerResponse) -> Result<(), ProxyError> {
        let framing = decide_framing(&resp.headers, self.protocol);
        trace!("framing response as {framing:?}");

        match framing {
            Framing::Passthrough => {
                self.write_head(resp.status, resp.reason.as_deref(), &resp.headers, None)
                    .await?;
                self.emit_plain(resp.body).await?;
            }
            Framing::Chunked => {
                self.write_head(
                    resp.status,
                    resp.reason.as_deref(),
                    &resp.headers,
                    Some("Transfer-Encoding: chunked\r\n".to_string()),
                )
                .await?;
                self.emit_chunked(resp.body).await?;
            }
            Framing::Buffered => {
                let mut spool = SpooledBody::new();
                drain_into(resp.body, &mut spool).await?;
                self.write_head(
                    resp.status,
                    resp.reason.as_deref(),
                    &resp.headers,
                    Some(format!("Content-Length: {}\r\n", spool.len())),
                )
                .await?;
                spool.write_into(&mut self.writer).await?;
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Status line plus headers plus the terminating blank line, nothing
    /// else. The WebSocket upgrade path uses this: the 101 goes out, then
    /// the socket changes protocol.
    pub async fn send_head(
        &mut self,
        status: StatusCode,
        reason: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<(), ProxyError> {
        self.write_head(status, reason, headers, None).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_head(
        &mut self,
        status: StatusCode,
        reason: Option<&str>,
        headers: &HeaderMap,
        framing_header: Option<String>,
    ) -> Result<(), ProxyError> {
        let mut head = Vec::with_capacity(256);

        let reason = reason.or_else(|| status.canonical_reason());
        match reason {
            Some(reason) if !reason.is_empty() => head.extend_from_slice(
                format!("{} {} {}\r\n", self.protocol, status.as_u16(), reason).as_bytes(),
            ),
            _ => head
                .extend_from_slice(format!("{} {}\r\n", self.protocol, status.as_u16()).as_bytes()),
        }

        for (name, value) in headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        if let Some(extra) = framing_header {
            head.extend_from_slice(extra.as_bytes());
        }
        head.extend_from_slice(b"\r\n");

        self.writer.write_all(&head).await?;
        self.headers_sent = true;
        Ok(())
    }

    async fn emit_plain(&mut self, body: ResponseBody) -> Result<(), ProxyError> {
        match body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => self.writer.write_all(&bytes).await?,
            ResponseBody::Stream(mut stream) => {
                while let Some(piece) = stream.next().await {
                    self.writer.write_all(&piece?).await?;
                }
            }
        }
        Ok(())
    }

    async fn emit_chunked(&mut self, body: ResponseBody) -> Result<(), ProxyError> {
        match body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => self.write_chunk(&bytes).await?,
            ResponseBody::Stream(mut stream) => {
                while let Some(piece) = stream.next().await {
                    self.write_chunk(&piece?).await?;
                }
            }
        }
        self.writer.write_all(b"0\r\n\r\n").await?;
        Ok(())
    }

    async fn write_chunk(&mut self, piece: &[u8]) -> Result<(), ProxyError> {
        // A zero-length chunk would terminate the body early.
        if piece.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(format!("{:X}\r\n", piece.len()).as_bytes())
            .await?;
        self.writer.write_all(piece).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Flush and shut the stream down; on TLS this sends close_notify so
    /// the client sees a clean EOF instead of truncation.
    pub async fn finish(mut self) -> Result<(), ProxyError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

async fn drain_into(body: ResponseBody, spool: &mut SpooledBody) -> Result<(), ProxyError> {
    match body {
        ResponseBody::Empty => {}
        ResponseBody::Full(bytes) => spool.push(&bytes).await?,
        ResponseBody::Stream(mut stream) => {
            while let Some(piece) = stream.next().await {
                spool.push(&piece?).await?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use http::HeaderValue;
    use http::header::CONTENT_TYPE;

    fn pieces(parts: &[&'static str]) -> ResponseBody {
        let items: Vec<std::io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        ResponseBody::Stream(stream::iter(items).boxed())
    }

    fn text(out: &[u8]) -> String {
        String::from_utf8_lossy(out).to_string()
    }

    #[tokio::test]
    async fn content_length_passes_through_untouched() {
        let resp = HandlerResponse::full(
            StatusCode::OK,
            HeaderValue::from_static("text/plain"),
            "hello",
        );

        let mut out: Vec<u8> = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, Protocol::Http11);
        framer.send(resp).await.unwrap();

        let wire = text(&out);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-length: 5\r\n"));
        assert!(!wire.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn http11_without_length_is_chunked() {
        let resp = HandlerResponse::new(StatusCode::OK)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .body(pieces(&["hello ", "", "world"]));

        let mut out: Vec<u8> = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, Protocol::Http11);
        framer.send(resp).await.unwrap();

        let wire = text(&out);
        assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!wire.to_ascii_lowercase().contains("content-length"));
        // The empty middle piece is skipped, not emitted as a terminator.
        assert!(wire.ends_with("6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn http10_without_length_is_buffered_and_measured() {
        let resp = HandlerResponse::new(StatusCode::OK).body(pieces(&["hello ", "world"]));

        let mut out: Vec<u8> = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, Protocol::Http10);
        framer.send(resp).await.unwrap();

        let wire = text(&out);
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(wire.contains("Content-Length: 11\r\n"));
        assert!(!wire.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(wire.ends_with("\r\n\r\nhello world"));
    }

    #[tokio::test]
    async fn reason_phrase_can_be_overridden() {
        let resp = HandlerResponse::empty(StatusCode::METHOD_NOT_ALLOWED)
            .with_reason("HTTPS Proxy Not Supported");

        let mut out: Vec<u8> = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, Protocol::Http11);
        framer.send(resp).await.unwrap();

        assert!(text(&out).starts_with("HTTP/1.1 405 HTTPS Proxy Not Supported\r\n"));
    }

    #[tokio::test]
    async fn send_head_terminates_header_block() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::UPGRADE,
            HeaderValue::from_static("websocket"),
        );

        let mut out: Vec<u8> = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, Protocol::Http11);
        assert!(!framer.headers_sent());
        framer
            .send_head(StatusCode::SWITCHING_PROTOCOLS, None, &headers)
            .await
            .unwrap();

        assert!(framer.headers_sent());
        let wire = text(&out);
        assert!(wire.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn empty_body_on_http10_gets_zero_length() {
        let resp = HandlerResponse::new(StatusCode::OK);

        let mut out: Vec<u8> = Vec::new();
        let mut framer = ResponseFramer::new(&mut out, Protocol::Http10);
        framer.send(resp).await.unwrap();

        assert!(text(&out).contains("Content-Length: 0\r\n"));
    }
}

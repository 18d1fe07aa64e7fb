use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;
use crate::io::{BoxedIo, RewindStream};
use crate::record::{Body, Protocol, RequestRecord};
use wsgiprox_shared::uri::{Scheme, split_path_query};

/// Upper bound on a request head (request line + headers + terminator).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// A parsed request line plus headers, already normalized to the CGI
/// convention.
#[derive(Debug)]
pub struct Head {
    pub method: String,
    pub protocol: Protocol,
    /// The request target exactly as sent: origin-form inside a tunnel,
    /// absolute-form or authority-form on the outer connection.
    pub target: String,
    pub headers: HashMap<String, String>,
}

/// Read one request head off the stream. Returns the head and whatever was
/// over-read past the header terminator; those bytes belong to the entity
/// body and must be replayed in front of the stream.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(Head, Bytes), ProxyError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = head_end(&buf) {
            let head_bytes = buf.split_to(end);
            let head = parse_head_block(&head_bytes)?;
            return Ok((head, buf.freeze()));
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::HeadTooLarge);
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                ProxyError::ClientGone
            } else {
                ProxyError::MalformedHeaders
            });
        }
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_head_block(head: &[u8]) -> Result<Head, ProxyError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let request_line =
        std::str::from_utf8(&head[..line_end]).map_err(|_| ProxyError::MalformedRequestLine)?;
    if request_line.split_ascii_whitespace().count() < 3 {
        return Err(ProxyError::MalformedRequestLine);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed
        .parse(head)
        .map_err(|_| ProxyError::MalformedHeaders)?;
    if status.is_partial() {
        return Err(ProxyError::MalformedHeaders);
    }

    let method = parsed
        .method
        .ok_or(ProxyError::MalformedRequestLine)?
        .to_string();
    let target = parsed
        .path
        .ok_or(ProxyError::MalformedRequestLine)?
        .to_string();
    let protocol = parsed
        .version
        .and_then(Protocol::from_minor)
        .ok_or(ProxyError::MalformedRequestLine)?;

    let mut map = HashMap::new();
    for header in parsed.headers.iter() {
        // Duplicates overwrite; last one wins.
        map.insert(
            env_header_name(header.name),
            String::from_utf8_lossy(header.value).trim().to_string(),
        );
    }

    Ok(Head {
        method,
        protocol,
        target,
        headers: map,
    })
}

/// Normalize a wire header name to the CGI convention: upper-cased,
/// `-` → `_`, `HTTP_`-prefixed except for the two entity headers.
pub fn env_header_name(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase().replace('-', "_");
    match upper.as_str() {
        "CONTENT_LENGTH" | "CONTENT_TYPE" => upper,
        _ => format!("HTTP_{upper}"),
    }
}

/// Build the record for a request read off the outer (hosting) connection.
/// The target is kept verbatim; the connection stream rides along under the
/// body so the CONNECT path can hijack it.
pub fn outer_record(head: Head, leftover: Bytes, io: BoxedIo) -> RequestRecord {
    build_record(head, leftover, io, Scheme::Http, None)
}

/// Build the record for a request parsed inside a CONNECT tunnel. The
/// origin-form target is re-anchored onto the CONNECT authority:
/// `{scheme}://{authority}{target}`.
pub fn tunnel_record(
    head: Head,
    leftover: Bytes,
    io: BoxedIo,
    scheme: Scheme,
    authority: &str,
) -> RequestRecord {
    build_record(head, leftover, io, scheme, Some(authority))
}

fn build_record(
    head: Head,
    leftover: Bytes,
    io: BoxedIo,
    scheme: Scheme,
    authority: Option<&str>,
) -> RequestRecord {
    let request_uri = match authority {
        Some(authority) => format!("{}://{}{}", scheme, authority, head.target),
        None => head.target,
    };
    let (path, query) = split_path_query(&request_uri);

    let content_length = head
        .headers
        .get("CONTENT_LENGTH")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let body = Body::new(RewindStream::new(io, leftover).boxed(), content_length);

    RequestRecord {
        method: head.method,
        protocol: head.protocol,
        scheme,
        request_uri,
        path,
        query,
        headers: head.headers,
        body,
        matched_host: None,
        proxy_host: String::new(),
        raw_socket: None,
    }
}

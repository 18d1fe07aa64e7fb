use futures_util::future::BoxFuture;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::trace;

use crate::error::ProxyError;
use crate::framer::ResponseFramer;
use crate::io::BoxedIo;
use crate::record::RequestRecord;

/// A server-side WebSocket riding the (possibly TLS-wrapped) tunnel stream.
pub type WsSocket = WebSocketStream<BoxedIo>;

/// Application endpoint for intercepted WebSocket flows. The upgrade
/// response has already been written when `serve` runs, so the endpoint
/// only ever pumps messages; it has no way to send a second status.
pub trait WsEndpoint: Send + Sync + 'static {
    fn serve(&self, ws: WsSocket, req: RequestRecord) -> BoxFuture<'static, ()>;
}

pub(crate) fn wants_upgrade(req: &RequestRecord) -> bool {
    req.header("HTTP_UPGRADE")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Answer the handshake already parsed into `req` with a 101, switch the
/// stream over to WebSocket framing and hand both to the endpoint.
pub(crate) async fn upgrade(
    endpoint: &dyn WsEndpoint,
    mut req: RequestRecord,
) -> Result<(), ProxyError> {
    let Some(key) = req.header("HTTP_SEC_WEBSOCKET_KEY").map(str::to_string) else {
        return Err(ProxyError::MalformedHeaders);
    };
    let Some(mut io) = req.body.take_io() else {
        return Err(ProxyError::MissingTunnelStream);
    };

    let accept = derive_accept_key(key.as_bytes());
    let mut headers = HeaderMap::new();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&accept).map_err(|_| ProxyError::MalformedHeaders)?,
    );

    // The blank line goes out after the upgrade headers, before the first
    // frame.
    {
        let mut framer = ResponseFramer::new(&mut io, req.protocol);
        framer
            .send_head(StatusCode::SWITCHING_PROTOCOLS, None, &headers)
            .await?;
    }

    trace!("websocket upgraded for {}", req.request_uri);
    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    endpoint.serve(ws, req).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Body, Protocol};
    use std::collections::HashMap;
    use wsgiprox_shared::uri::Scheme;

    fn upgrade_record(headers: HashMap<String, String>) -> RequestRecord {
        RequestRecord {
            method: "GET".to_string(),
            protocol: Protocol::Http11,
            scheme: Scheme::Https,
            request_uri: "/websocket".to_string(),
            path: "/websocket".to_string(),
            query: String::new(),
            headers,
            body: Body::empty(),
            matched_host: None,
            proxy_host: "wsgiprox".to_string(),
            raw_socket: None,
        }
    }

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("HTTP_UPGRADE".to_string(), "WebSocket".to_string());
        assert!(wants_upgrade(&upgrade_record(headers)));

        assert!(!wants_upgrade(&upgrade_record(HashMap::new())));
    }
}

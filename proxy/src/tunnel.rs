use std::sync::Arc;

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::error::ProxyError;
use crate::framer::ResponseFramer;
use crate::handler::HandlerResponse;
use crate::io::BoxedIo;
use crate::middleware::{ProxyMiddleware, proxy_auth_required};
use crate::parser;
use crate::record::RequestRecord;
use crate::ws;
use wsgiprox_shared::tls::tunnel_server_config;
use wsgiprox_shared::uri::{HostPort, Scheme};

/// Acknowledgement written on the raw client stream once the tunnel is
/// hijacked. HTTP/1.0 plus close on purpose: the tunnel is single-use and
/// some clients mis-handle keep-alive here.
pub(crate) const CONNECT_ACK: &[u8] =
    b"HTTP/1.0 200 Connection Established\r\nProxy-Connection: close\r\nServer: wsgiprox\r\n\r\n";

pub(crate) enum TunnelOutcome {
    /// The connection was taken over; everything owed to the client is
    /// already on the wire (or the tunnel died trying).
    Hijacked,
    /// No tunnel was opened; the hosting server still owns the connection
    /// and should write this response.
    Respond(HandlerResponse, RequestRecord),
}

/// Drive one CONNECT end to end: hijack the raw stream, gate on auth,
/// answer 200-established, terminate TLS with a CA-minted leaf, parse the
/// tunneled request and stream back the routed response.
pub(crate) async fn handle_connect(
    mw: &ProxyMiddleware,
    mut outer: RequestRecord,
) -> Result<TunnelOutcome, ProxyError> {
    let Some(target) = HostPort::parse(&outer.request_uri, 443) else {
        debug!("unparseable CONNECT target {:?}", outer.request_uri);
        return Ok(TunnelOutcome::Respond(
            HandlerResponse::empty(StatusCode::BAD_REQUEST),
            outer,
        ));
    };

    let Some(raw) = mw.extractors().extract(&mut outer) else {
        debug!("no raw-socket idiom matched; CONNECT unsupported on this host");
        let resp = HandlerResponse::empty(StatusCode::METHOD_NOT_ALLOWED)
            .with_reason("HTTPS Proxy Not Supported");
        return Ok(TunnelOutcome::Respond(resp, outer));
    };

    if let Some(realm) = mw.router().resolver.auth_realm(&outer) {
        trace!("CONNECT to {target} demands credentials for realm {realm}");
        let mut raw = raw;
        let mut framer = ResponseFramer::new(&mut raw, outer.protocol);
        framer.send(proxy_auth_required(&realm)).await?;
        raw.shutdown().await.ok();
        return Ok(TunnelOutcome::Hijacked);
    }

    let (scheme, mut io) = wrap_tls(mw, raw, &target).await?;

    let (head, leftover) = parser::read_head(&mut io).await?;
    let authority = target.authority_for(scheme);
    let mut inner = parser::tunnel_record(head, leftover, io, scheme, &authority);
    trace!("tunneled request: {} {}", inner.method, inner.request_uri);

    // Proxy credentials arrive on the CONNECT, not on the tunneled request;
    // resolvers keyed on them need the header inside too.
    if let Some(auth) = outer.headers.get("HTTP_PROXY_AUTHORIZATION") {
        inner
            .headers
            .entry("HTTP_PROXY_AUTHORIZATION".to_string())
            .or_insert_with(|| auth.clone());
    }

    if mw.websockets_enabled()
        && ws::wants_upgrade(&inner)
        && let Some(endpoint) = mw.ws_endpoint()
    {
        mw.router().bind(&mut inner);
        ws::upgrade(endpoint.as_ref(), inner).await?;
        return Ok(TunnelOutcome::Hijacked);
    }

    let routed = mw.router().route(&mut inner).await;
    let Some(io) = inner.body.take_io() else {
        return Err(ProxyError::MissingTunnelStream);
    };

    let mut framer = ResponseFramer::new(io, inner.protocol);
    match routed {
        Ok(resp) => framer.send(resp).await?,
        Err(ProxyError::Upstream(err)) => {
            // Headers have not been written yet, so a clean 500 is still
            // possible; mid-body failures surface as I/O errors instead and
            // tear the tunnel down.
            warn!("upstream handler failed in tunnel: {err:#}");
            framer
                .send(HandlerResponse::empty(StatusCode::INTERNAL_SERVER_ERROR))
                .await?;
        }
        Err(other) => return Err(other),
    }
    framer.finish().await?;

    Ok(TunnelOutcome::Hijacked)
}

/// Acknowledge the CONNECT and terminate TLS on the tunnel. Port 80 keeps
/// the tunnel in the clear; everything else gets a leaf minted for the
/// target host. A failed handshake aborts with nothing further written.
async fn wrap_tls(
    mw: &ProxyMiddleware,
    mut raw: BoxedIo,
    target: &HostPort,
) -> Result<(Scheme, BoxedIo), ProxyError> {
    raw.write_all(CONNECT_ACK).await?;
    raw.flush().await?;

    if target.port == 80 {
        trace!("CONNECT to port 80; tunneling cleartext http");
        return Ok((Scheme::Http, raw));
    }

    let key = mw
        .ca()
        .certified_key_for(&target.host, mw.use_wildcard_certs())?;
    let config = tunnel_server_config(key);

    trace!("accepting TLS for {}", target.host);
    let tls = TlsAcceptor::from(Arc::new(config))
        .accept(raw)
        .await
        .map_err(ProxyError::Handshake)?;

    Ok((Scheme::Https, Box::new(tls)))
}

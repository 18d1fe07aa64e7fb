use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use http::header::PROXY_AUTHENTICATE;
use http::{HeaderValue, StatusCode};
use tracing::{debug, error};

use crate::certapp::CertDownloadApp;
use crate::error::ProxyError;
use crate::extract::SocketExtractors;
use crate::handler::{HandlerResponse, HttpHandler};
use crate::record::RequestRecord;
use crate::resolver::Resolver;
use crate::router::{HostAppMap, Router};
use crate::tunnel::{self, TunnelOutcome};
use crate::ws::WsEndpoint;
use wsgiprox_shared::uri::Scheme;
use wsgiprox_shared::{CaOptions, CertAuthority};

/// Configuration of the middleware. The defaults mirror a plain
/// interception setup: auto-generated CA under `~/.wsgiprox`, wildcard
/// leaves, cert download on, `wsgiprox` as the proxy's own virtual host.
pub struct ProxyOptions {
    /// Directory holding the CA file and minted leaves.
    pub ca_root_dir: Option<PathBuf>,
    /// Filename of the CA root PEM within `ca_root_dir`.
    pub ca_file: String,
    /// Human CN for an auto-generated CA.
    pub ca_name: String,
    /// Sub-directory for per-host minted leaves.
    pub ca_certs_dir: String,
    /// Mint one wildcard leaf per parent domain instead of one per host.
    pub use_wildcard_certs: bool,
    /// Expose `/download/pem` and `/download/p12` on the proxy host.
    pub enable_cert_download: bool,
    /// Permit the `Upgrade: websocket` branch (requires a `WsEndpoint`).
    pub enable_websockets: bool,
    /// The virtual hostname reserved for the proxy itself.
    pub proxy_host: String,
    /// Additional virtual-host-to-handler bindings.
    pub proxy_apps: HostAppMap,
    /// Hosting-server idioms for recovering the raw client stream.
    pub socket_extractors: SocketExtractors,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            ca_root_dir: None,
            ca_file: "wsgiprox-ca.pem".to_string(),
            ca_name: "wsgiprox https proxy CA".to_string(),
            ca_certs_dir: "certs".to_string(),
            use_wildcard_certs: true,
            enable_cert_download: true,
            enable_websockets: true,
            proxy_host: "wsgiprox".to_string(),
            proxy_apps: HashMap::new(),
            socket_extractors: SocketExtractors::builtin(),
        }
    }
}

/// What a dispatch did with the request.
pub enum DispatchResult {
    /// The connection was hijacked for a tunnel; nothing left to write.
    Hijacked,
    /// An ordinary response the hosting server should deliver. The record
    /// rides along; its body still owns the connection stream.
    Respond {
        response: HandlerResponse,
        record: RequestRecord,
    },
}

/// The intercepting middleware itself: converts proxy-style requests
/// (absolute-URI and CONNECT-tunneled, WebSocket included) into ordinary
/// invocations of the upstream handler. The upstream never learns whether
/// the client spoke HTTP, HTTPS or WebSocket.
pub struct ProxyMiddleware {
    router: Router,
    ca: CertAuthority,
    extractors: SocketExtractors,
    ws_endpoint: Option<Arc<dyn WsEndpoint>>,
    use_wildcard_certs: bool,
    enable_websockets: bool,
}

impl ProxyMiddleware {
    pub fn new(
        upstream: Arc<dyn HttpHandler>,
        resolver: Arc<dyn Resolver>,
        opts: ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let ca = CertAuthority::open(CaOptions {
            root_dir: opts.ca_root_dir,
            ca_file: opts.ca_file,
            ca_name: opts.ca_name,
            certs_dir: opts.ca_certs_dir,
        })?;

        let mut host_apps = opts.proxy_apps;
        let proxy_app: Option<Arc<dyn HttpHandler>> = if opts.enable_cert_download {
            Some(Arc::new(CertDownloadApp::new(ca.clone())))
        } else {
            None
        };
        host_apps.entry(opts.proxy_host.clone()).or_insert(proxy_app);

        Ok(ProxyMiddleware {
            router: Router::new(upstream, resolver, host_apps, opts.proxy_host),
            ca,
            extractors: opts.socket_extractors,
            ws_endpoint: None,
            use_wildcard_certs: opts.use_wildcard_certs,
            enable_websockets: opts.enable_websockets,
        })
    }

    pub fn with_ws_endpoint(mut self, endpoint: Arc<dyn WsEndpoint>) -> Self {
        self.ws_endpoint = Some(endpoint);
        self
    }

    pub fn ca(&self) -> &CertAuthority {
        &self.ca
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn extractors(&self) -> &SocketExtractors {
        &self.extractors
    }

    pub(crate) fn ws_endpoint(&self) -> Option<&Arc<dyn WsEndpoint>> {
        self.ws_endpoint.as_ref()
    }

    pub(crate) fn websockets_enabled(&self) -> bool {
        self.enable_websockets && self.ws_endpoint.is_some()
    }

    pub(crate) fn use_wildcard_certs(&self) -> bool {
        self.use_wildcard_certs
    }

    /// Entry point for the hosting server: one request record in, either a
    /// response to deliver or a hijacked connection.
    pub async fn dispatch(&self, mut req: RequestRecord) -> DispatchResult {
        if req.is_connect() {
            return match tunnel::handle_connect(self, req).await {
                Ok(TunnelOutcome::Respond(response, record)) => {
                    DispatchResult::Respond { response, record }
                }
                Ok(TunnelOutcome::Hijacked) => DispatchResult::Hijacked,
                Err(err) => {
                    // The tunnel owned the connection; there is nobody left
                    // to send an error to.
                    debug!("tunnel aborted: {err}");
                    DispatchResult::Hijacked
                }
            };
        }

        if is_proxy_shaped(&req.request_uri) {
            req.scheme = if req.request_uri.starts_with("https://") {
                Scheme::Https
            } else {
                Scheme::Http
            };

            if let Some(realm) = self.router.resolver.auth_realm(&req) {
                return DispatchResult::Respond {
                    response: proxy_auth_required(&realm),
                    record: req,
                };
            }

            let routed = self.router.route(&mut req).await;
            respond_or_500(routed, req)
        } else {
            // Origin-form request: not proxy traffic, pass through as-is.
            req.proxy_host = self.router.proxy_host.clone();
            let routed = self.router.invoke_upstream(&mut req).await;
            respond_or_500(routed, req)
        }
    }
}

fn is_proxy_shaped(request_uri: &str) -> bool {
    request_uri.starts_with("http://") || request_uri.starts_with("https://")
}

fn respond_or_500(
    routed: Result<HandlerResponse, ProxyError>,
    record: RequestRecord,
) -> DispatchResult {
    match routed {
        Ok(response) => DispatchResult::Respond { response, record },
        Err(err) => {
            error!("handler failed: {err}");
            DispatchResult::Respond {
                response: HandlerResponse::empty(StatusCode::INTERNAL_SERVER_ERROR),
                record,
            }
        }
    }
}

/// The 407 challenge sent when a resolver demands credentials.
pub(crate) fn proxy_auth_required(realm: &str) -> HandlerResponse {
    let mut resp = HandlerResponse::empty(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
        resp.headers.insert(PROXY_AUTHENTICATE, value);
    }
    resp
}

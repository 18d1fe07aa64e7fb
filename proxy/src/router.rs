use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use tracing::trace;

use crate::error::ProxyError;
use crate::handler::{HandlerResponse, HttpHandler};
use crate::record::RequestRecord;
use crate::resolver::Resolver;
use wsgiprox_shared::uri;

/// Virtual hostname to sub-app. A `None` value marks the host as internal
/// without binding a handler: the path is stripped to unprefixed form and
/// the request falls through to the upstream handler.
pub type HostAppMap = HashMap<String, Option<Arc<dyn HttpHandler>>>;

/// Dispatches proxy-shaped requests: host-bound sub-apps get the raw path,
/// everything else is rewritten by the resolver and handed upstream.
pub struct Router {
    pub(crate) upstream: Arc<dyn HttpHandler>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) host_apps: HostAppMap,
    pub(crate) proxy_host: String,
}

impl Router {
    pub fn new(
        upstream: Arc<dyn HttpHandler>,
        resolver: Arc<dyn Resolver>,
        host_apps: HostAppMap,
        proxy_host: String,
    ) -> Self {
        Router {
            upstream,
            resolver,
            host_apps,
            proxy_host,
        }
    }

    /// Apply host matching and URI rewriting to the record; the sub-app is
    /// returned (not invoked) when the host mapped to one. After this the
    /// record's `request_uri`, `path` and `query` are final.
    pub fn bind(&self, req: &mut RequestRecord) -> Option<Arc<dyn HttpHandler>> {
        let absolute = req.request_uri.clone();
        match uri::absolute_host(&absolute) {
            Some(host) if self.host_apps.contains_key(&host) => {
                trace!("request host {host} matched a registered virtual host");
                req.matched_host = Some(host.clone());
                req.proxy_host = host.clone();
                req.request_uri =
                    uri::strip_authority(&absolute).unwrap_or_else(|| "/".to_string());
                req.sync_path_query();
                self.host_apps.get(&host).and_then(Clone::clone)
            }
            _ => {
                req.proxy_host = self.proxy_host.clone();
                req.request_uri = self.resolver.resolve(&absolute, req);
                req.sync_path_query();
                None
            }
        }
    }

    /// Full routing for a proxy-shaped request: bind, give a matched
    /// sub-app first refusal, then the upstream handler.
    pub async fn route(&self, req: &mut RequestRecord) -> Result<HandlerResponse, ProxyError> {
        if let Some(app) = self.bind(req) {
            if let Some(resp) = app.invoke(req).await.map_err(ProxyError::Upstream)? {
                return Ok(resp);
            }
            trace!("sub-app for {:?} declined; falling through", req.matched_host);
        }
        self.invoke_upstream(req).await
    }

    /// Hand the record to the upstream handler as-is.
    pub async fn invoke_upstream(
        &self,
        req: &mut RequestRecord,
    ) -> Result<HandlerResponse, ProxyError> {
        match self
            .upstream
            .invoke(req)
            .await
            .map_err(ProxyError::Upstream)?
        {
            Some(resp) => Ok(resp),
            None => Ok(HandlerResponse::empty(StatusCode::NOT_FOUND)),
        }
    }
}

use bytes::Bytes;
use http::{HeaderValue, StatusCode};

use crate::handler::{HandlerFuture, HandlerResponse, HttpHandler};
use crate::record::RequestRecord;
use wsgiprox_shared::CertAuthority;

/// Sub-app bound to the proxy's own virtual host that hands out the CA
/// root certificate so clients can trust the interception. Serves exactly
/// two paths; everything else is declined so the router falls through to
/// the upstream handler.
pub struct CertDownloadApp {
    ca: CertAuthority,
}

impl CertDownloadApp {
    pub fn new(ca: CertAuthority) -> Self {
        CertDownloadApp { ca }
    }
}

impl HttpHandler for CertDownloadApp {
    fn invoke<'a>(&'a self, req: &'a mut RequestRecord) -> HandlerFuture<'a> {
        Box::pin(async move {
            match req.path.as_str() {
                "/download/pem" => Ok(Some(HandlerResponse::full(
                    StatusCode::OK,
                    HeaderValue::from_static("application/x-x509-ca-cert"),
                    Bytes::copy_from_slice(self.ca.root_pem()),
                ))),
                "/download/p12" => {
                    let p12 = self.ca.root_pkcs12()?;
                    Ok(Some(HandlerResponse::full(
                        StatusCode::OK,
                        HeaderValue::from_static("application/x-pkcs12"),
                        p12,
                    )))
                }
                _ => Ok(None),
            }
        })
    }
}

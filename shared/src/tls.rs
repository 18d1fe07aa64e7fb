use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

/// Serves one pre-minted leaf for every handshake on a tunnel. The leaf was
/// chosen from the CONNECT authority before the handshake started, so the
/// client hello's SNI is not consulted.
#[derive(Debug)]
pub struct LeafCertResolver {
    key: Arc<CertifiedKey>,
}

impl LeafCertResolver {
    pub fn new(key: Arc<CertifiedKey>) -> Self {
        Self { key }
    }
}

impl ResolvesServerCert for LeafCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }
}

/// Server-side TLS configuration for a single intercepted tunnel: the minted
/// leaf, no client auth, http/1.1 inside.
pub fn tunnel_server_config(key: Arc<CertifiedKey>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(LeafCertResolver::new(key)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

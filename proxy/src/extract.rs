use tracing::trace;

use crate::io::BoxedIo;
use crate::record::RequestRecord;

type ExtractorFn = Box<dyn Fn(&mut RequestRecord) -> Option<BoxedIo> + Send + Sync>;

/// Ordered registry of hosting-server idioms for recovering the raw client
/// stream from a request record. The first idiom that produces a stream
/// wins; CONNECT is answered `405` when none does.
///
/// Hosting adapters with their own way of parking the socket register an
/// extractor up front.
pub struct SocketExtractors {
    entries: Vec<(String, ExtractorFn)>,
}

impl SocketExtractors {
    /// The built-in idioms: a socket parked on the record's `raw_socket`
    /// slot, then the stream underlying the body.
    pub fn builtin() -> Self {
        let mut this = Self::none();
        this.push("raw-socket", |req| req.raw_socket.take());
        this.push("body-stream", |req| req.body.take_io());
        this
    }

    /// No idioms at all; every CONNECT is refused with `405`.
    pub fn none() -> Self {
        SocketExtractors {
            entries: Vec::new(),
        }
    }

    /// Register an idiom ahead of the ones already present.
    pub fn register(
        &mut self,
        name: &str,
        f: impl Fn(&mut RequestRecord) -> Option<BoxedIo> + Send + Sync + 'static,
    ) {
        self.entries.insert(0, (name.to_string(), Box::new(f)));
    }

    fn push(
        &mut self,
        name: &str,
        f: impl Fn(&mut RequestRecord) -> Option<BoxedIo> + Send + Sync + 'static,
    ) {
        self.entries.push((name.to_string(), Box::new(f)));
    }

    pub fn extract(&self, req: &mut RequestRecord) -> Option<BoxedIo> {
        for (name, extractor) in &self.entries {
            if let Some(io) = extractor(req) {
                trace!("raw socket recovered via {name} idiom");
                return Some(io);
            }
        }
        None
    }
}

impl Default for SocketExtractors {
    fn default() -> Self {
        Self::builtin()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Body, Protocol, RequestRecord};
    use std::collections::HashMap;
    use wsgiprox_shared::uri::Scheme;

    fn connect_record() -> RequestRecord {
        RequestRecord {
            method: "CONNECT".to_string(),
            protocol: Protocol::Http11,
            scheme: Scheme::Http,
            request_uri: "example.com:443".to_string(),
            path: "example.com:443".to_string(),
            query: String::new(),
            headers: HashMap::new(),
            body: Body::empty(),
            matched_host: None,
            proxy_host: String::new(),
            raw_socket: None,
        }
    }

    #[tokio::test]
    async fn raw_socket_slot_wins_over_body() {
        let (a, b) = tokio::io::duplex(8);
        let mut req = connect_record();
        req.raw_socket = Some(Box::new(a));
        req.body = Body::new(Box::new(b), 0);

        let extractors = SocketExtractors::builtin();
        assert!(extractors.extract(&mut req).is_some());
        assert!(req.raw_socket.is_none());
        assert!(req.body.has_io());
    }

    #[tokio::test]
    async fn falls_back_to_body_stream() {
        let (_a, b) = tokio::io::duplex(8);
        let mut req = connect_record();
        req.body = Body::new(Box::new(b), 0);

        let extractors = SocketExtractors::builtin();
        assert!(extractors.extract(&mut req).is_some());
        assert!(!req.body.has_io());
    }

    #[tokio::test]
    async fn empty_registry_never_extracts() {
        let (_a, b) = tokio::io::duplex(8);
        let mut req = connect_record();
        req.body = Body::new(Box::new(b), 0);

        assert!(SocketExtractors::none().extract(&mut req).is_none());
        assert!(req.body.has_io());
    }
}

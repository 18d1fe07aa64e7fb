use std::fmt::Display;

use http::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(value: &str) -> Option<Scheme> {
        match value {
            "https" => Some(Scheme::Https),
            "http" => Some(Scheme::Http),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authority of a CONNECT target (`host:port`, port optional in the
/// input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn parse(target: &str, default_port: u16) -> Option<HostPort> {
        let uri = Uri::try_from(target).ok()?;
        match uri.host() {
            Some(host) => Some(HostPort {
                host: host.to_string(),
                port: uri.port_u16().unwrap_or(default_port),
            }),
            // A bare name ("wsgiprox") parses as a path-only URI.
            None if !target.is_empty() && !target.contains('/') => Some(HostPort {
                host: target.to_string(),
                port: default_port,
            }),
            None => None,
        }
    }

    /// The authority as a client would write it in an absolute URL: the
    /// scheme's default port is left out.
    pub fn authority_for(&self, scheme: Scheme) -> String {
        if self.port == scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Split a request URI into path and query at the first `?`.
pub fn split_path_query(request_uri: &str) -> (String, String) {
    match request_uri.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (request_uri.to_string(), String::new()),
    }
}

/// The host component of an absolute URL, if it has one.
pub fn absolute_host(url: &str) -> Option<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    let uri = Uri::try_from(url).ok()?;
    uri.host().map(str::to_string)
}

/// Strip scheme and authority from an absolute URL, leaving `path[?query]`.
pub fn strip_authority(url: &str) -> Option<String> {
    let uri = Uri::try_from(url).ok()?;
    uri.host()?;
    let path = match uri.path() {
        "" => "/",
        p => p,
    };
    Some(match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_defaults() {
        let hp = HostPort::parse("example.com:443", 443).unwrap();
        assert_eq!(hp.host, "example.com");
        assert_eq!(hp.port, 443);

        let hp = HostPort::parse("example.com", 443).unwrap();
        assert_eq!(hp.port, 443);

        let hp = HostPort::parse("wsgiprox", 443).unwrap();
        assert_eq!(hp.host, "wsgiprox");
    }

    #[test]
    fn authority_omits_default_port() {
        let hp = HostPort::parse("example.com:443", 443).unwrap();
        assert_eq!(hp.authority_for(Scheme::Https), "example.com");

        let hp = HostPort::parse("example.com:8443", 443).unwrap();
        assert_eq!(hp.authority_for(Scheme::Https), "example.com:8443");

        let hp = HostPort::parse("example.com:80", 80).unwrap();
        assert_eq!(hp.authority_for(Scheme::Http), "example.com");
    }

    #[test]
    fn path_query_split() {
        assert_eq!(
            split_path_query("/a/b?c=d"),
            ("/a/b".to_string(), "c=d".to_string())
        );
        assert_eq!(split_path_query("/a/b"), ("/a/b".to_string(), String::new()));
        assert_eq!(
            split_path_query("/p?x=1?y=2"),
            ("/p".to_string(), "x=1?y=2".to_string())
        );
    }

    #[test]
    fn absolute_host_requires_scheme() {
        assert_eq!(
            absolute_host("http://example.com/p?q=1"),
            Some("example.com".to_string())
        );
        assert_eq!(absolute_host("/prefix/http://example.com/p"), None);
        assert_eq!(absolute_host("/just/a/path"), None);
    }

    #[test]
    fn strip_authority_keeps_path_and_query() {
        assert_eq!(
            strip_authority("https://wsgiprox/path/file?foo=bar"),
            Some("/path/file?foo=bar".to_string())
        );
        assert_eq!(
            strip_authority("http://example.com"),
            Some("/".to_string())
        );
    }
}

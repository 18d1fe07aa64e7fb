use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::record::RequestRecord;

/// Policy mapping an absolute URL to the rewritten path handed to the
/// upstream handler. A resolver may also gate authentication by demanding a
/// realm; credential validation stays inside the resolver.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, absolute_url: &str, req: &RequestRecord) -> String;

    /// A realm here means "this request must carry proxy credentials"; the
    /// middleware answers 407 until it does.
    fn auth_realm(&self, _req: &RequestRecord) -> Option<String> {
        None
    }
}

/// Injects one fixed prefix: `https://example.com/p` becomes
/// `/prefix/https://example.com/p`.
pub struct FixedResolver {
    prefix: String,
}

impl FixedResolver {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        FixedResolver { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for FixedResolver {
    fn default() -> Self {
        FixedResolver::new("/prox/")
    }
}

impl Resolver for FixedResolver {
    fn resolve(&self, absolute_url: &str, _req: &RequestRecord) -> String {
        format!("{}{}", self.prefix, absolute_url)
    }
}

/// Demands `Proxy-Authorization: Basic` credentials and uses the supplied
/// username as the rewrite prefix. Anything decodable passes; the username
/// *is* the routing choice, the password is ignored.
pub struct ProxyAuthResolver {
    realm: String,
}

impl ProxyAuthResolver {
    pub fn new(realm: &str) -> Self {
        ProxyAuthResolver {
            realm: realm.to_string(),
        }
    }

    fn basic_user(req: &RequestRecord) -> Option<String> {
        let value = req.header("HTTP_PROXY_AUTHORIZATION")?;
        let (kind, token) = value.split_once(' ')?;
        if !kind.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = BASE64.decode(token.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let user = match decoded.split_once(':') {
            Some((user, _password)) => user,
            None => decoded.as_str(),
        };
        if user.is_empty() {
            None
        } else {
            Some(user.to_string())
        }
    }
}

impl Resolver for ProxyAuthResolver {
    fn resolve(&self, absolute_url: &str, req: &RequestRecord) -> String {
        match Self::basic_user(req) {
            Some(user) => format!("/{user}/{absolute_url}"),
            None => format!("/{absolute_url}"),
        }
    }

    fn auth_realm(&self, req: &RequestRecord) -> Option<String> {
        if Self::basic_user(req).is_some() {
            None
        } else {
            Some(self.realm.clone())
        }
    }
}

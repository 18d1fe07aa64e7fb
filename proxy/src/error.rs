use std::error::Error;
use std::io;

use wsgiprox_shared::CaError;

#[derive(Debug)]
pub enum ProxyError {
    Io(io::Error),
    /// The client dropped the connection; stop draining and clean up.
    ClientGone,
    /// TLS setup over the tunnel failed after the 200-established line.
    Handshake(io::Error),
    Ca(CaError),
    MalformedRequestLine,
    MalformedHeaders,
    HeadTooLarge,
    /// The tunnel stream went missing mid-flow (a handler took it).
    MissingTunnelStream,
    /// The upstream handler failed.
    Upstream(anyhow::Error),
}

impl Error for ProxyError {}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "Io({e})"),
            ProxyError::ClientGone => write!(f, "ClientGone"),
            ProxyError::Handshake(e) => write!(f, "Handshake({e})"),
            ProxyError::Ca(e) => write!(f, "Ca({e})"),
            ProxyError::MalformedRequestLine => write!(f, "MalformedRequestLine"),
            ProxyError::MalformedHeaders => write!(f, "MalformedHeaders"),
            ProxyError::HeadTooLarge => write!(f, "HeadTooLarge"),
            ProxyError::MissingTunnelStream => write!(f, "MissingTunnelStream"),
            ProxyError::Upstream(e) => write!(f, "Upstream({e})"),
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => ProxyError::ClientGone,
            _ => ProxyError::Io(value),
        }
    }
}

impl From<CaError> for ProxyError {
    fn from(value: CaError) -> Self {
        ProxyError::Ca(value)
    }
}

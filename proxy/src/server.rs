use std::sync::Arc;

use http::HeaderValue;
use http::header::CONNECTION;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::error::ProxyError;
use crate::framer::ResponseFramer;
use crate::io::BoxedIo;
use crate::middleware::{DispatchResult, ProxyMiddleware};
use crate::parser;

/// Reference hosting server: a plain HTTP/1 accept loop in front of the
/// middleware. It parks the client stream under the request's body so the
/// built-in `body-stream` extractor idiom can hijack it for CONNECT, and it
/// frames non-hijacked responses itself.
///
/// Embedders with their own server only need to reproduce what
/// [`serve_connection`] does: build a record, call
/// [`ProxyMiddleware::dispatch`], deliver `Respond` results.
pub fn start_server(listener: TcpListener, mw: Arc<ProxyMiddleware>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            trace!("proxy listening on {addr}");
        }
        while let Ok((stream, addr)) = listener.accept().await {
            let mw = mw.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(mw, stream).await {
                    debug!("connection from {addr} ended: {err}");
                }
            });
        }
        error!("proxy accept loop finished");
    })
}

/// Serve a single client connection: one request, one response (or a
/// hijacked tunnel). Client-side connection pooling is out of scope, so
/// every response goes out with `Connection: close`.
pub async fn serve_connection(
    mw: Arc<ProxyMiddleware>,
    stream: TcpStream,
) -> Result<(), ProxyError> {
    let mut io: BoxedIo = Box::new(stream);
    let (head, leftover) = parser::read_head(&mut io).await?;
    let record = parser::outer_record(head, leftover, io);

    match mw.dispatch(record).await {
        DispatchResult::Hijacked => Ok(()),
        DispatchResult::Respond {
            mut response,
            mut record,
        } => {
            let Some(io) = record.body.take_io() else {
                return Err(ProxyError::MissingTunnelStream);
            };
            response
                .headers
                .insert(CONNECTION, HeaderValue::from_static("close"));

            let mut framer = ResponseFramer::new(io, record.protocol);
            framer.send(response).await?;
            framer.finish().await
        }
    }
}

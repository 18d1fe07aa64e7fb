#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod certapp;
pub mod error;
pub mod extract;
pub mod framer;
pub mod handler;
pub mod io;
pub mod middleware;
pub mod parser;
pub mod record;
pub mod resolver;
pub mod router;
pub mod server;
mod spool;
pub mod tunnel;
pub mod ws;

pub use error::ProxyError;
pub use handler::{HandlerFn, HandlerResponse, HttpHandler, ResponseBody};
pub use middleware::{DispatchResult, ProxyMiddleware, ProxyOptions};
pub use record::{Body, Protocol, RequestRecord};
pub use resolver::{FixedResolver, ProxyAuthResolver, Resolver};
pub use ws::{WsEndpoint, WsSocket};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TEST_INIT_LOGGER: OnceCell<()> = OnceCell::new();

pub fn init_test_logging() {
    TEST_INIT_LOGGER.get_or_init(|| {
        tracing_subscriber::fmt()
            .without_time()
            .with_line_number(true)
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

//! Server-side JSON-RPC 2.0 dispatch.
//!
//! Applications register named methods, each with a parameter spec and a handler, on a
//! [`Dispatcher`].  Request text is posted to the dispatcher, which parses it, validates each
//! call, invokes handlers, and hands the serialized reply to a response sink.  Posting can happen
//! on the caller's thread ([`Dispatcher::post`]) or be queued on an [`Executor`]
//! ([`Dispatcher::async_post`]), normally the [`WorkerPool`] in this crate.
//!
//! This crate has no transport.  Where the request text comes from and where the reply goes is
//! up to the application.
//!
//! ```no_run
//! use jsonrpc_dispatch::{Dispatcher, ParamSpec, ValueKind};
//! use serde_json::json;
//!
//! let dispatcher = Dispatcher::<()>::with_workers(4)?;
//! dispatcher.register(
//!     "add",
//!     ParamSpec::named([("a", ValueKind::Int), ("b", ValueKind::Int)]),
//!     |params, _context| {
//!         let a = params["a"].as_i64().unwrap_or_default();
//!         let b = params["b"].as_i64().unwrap_or_default();
//!         Ok(json!(a + b))
//!     },
//! )?;
//! dispatcher.set_response_sink(|response| println!("{response}"));
//!
//! dispatcher.async_post(r#"{"jsonrpc":"2.0","method":"add","params":{"a":2,"b":3},"id":1}"#, ())?;
//! # Ok::<(), anyhow::Error>(())
//! ```
mod error;
mod executor;
mod pool;
mod registry;
mod server;
mod shared;
mod validate;

pub use error::{
    ErrorKind, InvalidServerErrorCode, PoolError, RegistryError, RpcError, ServerErrorCode,
    SERVER_ERROR_MAX, SERVER_ERROR_MIN,
};
pub use executor::{Executor, Inline, Task};
pub use pool::{default_worker_count, WorkerPool, WorkerPoolConfig};
pub use registry::{Handler, HandlerResult, MethodDescriptor, MethodRegistry, ParamSpec};
pub use server::{Dispatcher, ResponseSink};
pub use shared::{ErrorObject, Reply, Response, ResponsePayload, ValueKind, JSONRPC_VERSION};
pub use validate::{check_params, Request};

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a subscriber that writes through the test harness.
    /// Safe to call multiple times.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}

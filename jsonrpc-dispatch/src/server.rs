//! The dispatch engine: turns one posted message (a single request or a batch) into response text
//! and hands that text to the response sink.
//!
//! Everything that can go wrong with the request data becomes a JSON-RPC error response.  Nothing
//! the client sends can make `post` fail or panic, and every posted message produces exactly one
//! call to the sink.
//!
//! The per-call path is:
//!
//! 1. Shape check ([`Request::from_object`])
//! 2. Method lookup
//! 3. Params check ([`validate::check_params`])
//! 4. Handler invocation
//!
//! Each step either moves on to the next or produces an [`RpcError`], which carries the request
//! id once one is known.
//!
//! The registry is behind a reader-writer lock.  A handler's descriptor is looked up and cloned
//! under the read lock, which is released before the handler runs.  That keeps concurrent calls
//! from serializing on each other, and lets a handler register or unregister methods without
//! deadlocking.
use crate::error::{ErrorKind, PoolError, RegistryError, RpcError};
use crate::executor::{panic_message, Executor, Inline};
use crate::pool::WorkerPool;
use crate::registry::{HandlerResult, MethodRegistry, ParamSpec};
use crate::shared::{Reply, Response, ValueKind};
use crate::validate::{self, Request};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::*;

/// Receives the serialized reply for every posted message
pub type ResponseSink = Arc<dyn Fn(String) + Send + Sync>;

/// Handed to zero-parameter methods in place of whatever `params` the request had
static NO_PARAMS: Value = Value::Null;

/// Used only if even a plain internal error response can't be serialized
const FALLBACK_RESPONSE: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;

/// A JSON-RPC 2.0 request dispatcher.
///
/// `C` is the handler context: a value supplied with each posted message and passed by reference
/// to the handler of every call in it.  `X` is the executor that runs
/// [`async_post`](Self::async_post) work; by default that's a [`WorkerPool`] owned by the
/// dispatcher, so dropping the dispatcher drains and stops the pool.
///
/// All methods take `&self`; share the dispatcher between threads with an `Arc`.
pub struct Dispatcher<C, X = WorkerPool> {
    shared: Arc<Shared<C>>,
    executor: X,
}

/// The part of the dispatcher that queued work needs.
///
/// Tasks on the executor hold this, never the dispatcher itself, so a task can't end up owning
/// (and therefore dropping, and therefore joining) the pool that runs it.
struct Shared<C> {
    registry: RwLock<MethodRegistry<C>>,
    sink: RwLock<ResponseSink>,
}

impl<C, X> Dispatcher<C, X> {
    /// Create a dispatcher with an empty registry and a sink that discards everything
    pub fn new(executor: X) -> Self {
        let sink: ResponseSink = Arc::new(|_response: String| {});

        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(MethodRegistry::new()),
                sink: RwLock::new(sink),
            }),
            executor,
        }
    }

    /// Register a method.
    ///
    /// The handler gets the request's `params` (`null` for methods whose spec is empty) and the
    /// context passed with the message.  Fails if the name is already taken, in which case the
    /// existing method is left alone.
    pub fn register<F>(
        &self,
        name: impl Into<String>,
        params: ParamSpec,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Value, &C) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(method = %name, param_count = params.len(), "Registering method");

        self.shared
            .registry
            .write()
            .register(name, params, Box::new(handler))
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        debug!(method = name, "Unregistering method");
        self.shared.registry.write().unregister(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.shared.registry.read().exists(name)
    }

    /// The number of registered methods
    pub fn count(&self) -> usize {
        self.shared.registry.read().count()
    }

    /// Replace the response sink.
    ///
    /// Messages already being processed may still deliver to the old sink.
    pub fn set_response_sink<F>(&self, sink: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.shared.sink.write() = Arc::new(sink);
    }

    /// Process a message and return the reply text, without involving the sink.
    pub fn handle(&self, request: &str, context: &C) -> String {
        self.shared.handle(request, context)
    }

    /// Process a message on the calling thread and deliver the reply to the sink before
    /// returning.
    pub fn post(&self, request: &str, context: C) {
        self.shared.post(request, &context)
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }
}

impl<C, X> Dispatcher<C, X>
where
    C: Send + 'static,
    X: Executor,
{
    /// Queue a message on the executor and return immediately.
    ///
    /// The message is processed exactly like [`post`](Self::post), on whichever thread the
    /// executor picks.  The only failure is an executor that no longer accepts work, in which
    /// case the message is dropped and the sink is not called.
    pub fn async_post(&self, request: impl Into<String>, context: C) -> Result<(), PoolError> {
        let shared = Arc::clone(&self.shared);
        let request = request.into();

        self.executor
            .execute(Box::new(move || shared.post(&request, &context)))
            .map_err(|e| {
                error!(error = %e, "Executor rejected request");
                e
            })
    }
}

impl<C> Dispatcher<C, WorkerPool> {
    /// Create a dispatcher with its own worker pool, already started with `workers` threads
    pub fn with_workers(workers: usize) -> Result<Self, PoolError> {
        let pool = WorkerPool::new();
        pool.start(workers)?;
        Ok(Self::new(pool))
    }
}

impl<C> Dispatcher<C, Inline> {
    /// Create a dispatcher whose `async_post` runs synchronously on the caller's thread
    pub fn inline() -> Self {
        Self::new(Inline)
    }
}

impl<C, X: std::fmt::Debug> std::fmt::Debug for Dispatcher<C, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &*self.shared.registry.read())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl<C> Shared<C> {
    fn post(&self, request: &str, context: &C) {
        let response = self.handle(request, context);

        // Clone the sink out so it's not called with the lock held
        let sink = self.sink.read().clone();
        trace!(len = response.len(), "Delivering response");
        sink(response);
    }

    #[instrument(skip_all, fields(len = request.len()))]
    fn handle(&self, request: &str, context: &C) -> String {
        let reply = self.reply(request, context);

        serde_json::to_string(&reply).unwrap_or_else(|e| {
            error!(error = %e, "Error serializing reply");
            serde_json::to_string(&Response::from(RpcError::new(ErrorKind::InternalError, None)))
                .unwrap_or_else(|_| FALLBACK_RESPONSE.to_string())
        })
    }

    fn reply(&self, request: &str, context: &C) -> Reply {
        let root: Value = match serde_json::from_str(request) {
            Ok(root) => root,
            Err(e) => {
                debug!(error = %e, "Request is not valid JSON");
                return parse_error();
            }
        };

        match root {
            Value::Object(request) => Reply::Single(self.call(&request, context)),
            Value::Array(batch) => {
                // One element that isn't an object spoils the whole batch
                if !batch.iter().all(Value::is_object) {
                    debug!(len = batch.len(), "Batch contains a non-object element");
                    return parse_error();
                }

                debug!(len = batch.len(), "Handling batch");
                Reply::Batch(
                    batch
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|request| self.call(request, context))
                        .collect(),
                )
            }
            other => {
                debug!(kind = %ValueKind::of(&other), "Request is neither an object nor an array");
                parse_error()
            }
        }
    }

    /// Run one request object through the whole per-call path.  Always produces a response.
    fn call(&self, request: &Map<String, Value>, context: &C) -> Response {
        Request::from_object(request)
            .and_then(|request| self.invoke(request, context))
            .unwrap_or_else(Response::from)
    }

    #[instrument(skip_all, fields(method = %request.method, id = %request.id))]
    fn invoke(&self, request: Request<'_>, context: &C) -> Result<Response, RpcError> {
        let Request { id, method, params } = request;

        let descriptor = self.registry.read().get(method).ok_or_else(|| {
            debug!("Method not found");
            RpcError::method_not_found(id)
        })?;

        validate::check_params(descriptor.params(), params, id)?;

        let params = match params {
            Some(params) if descriptor.param_count() > 0 => params,
            _ => &NO_PARAMS,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| descriptor.invoke(params, context))) {
            Ok(Ok(result)) => Ok(Response::success(id.clone(), result)),
            Ok(Err(e)) => match e.downcast_ref::<ErrorKind>() {
                Some(kind) => {
                    debug!(error = %kind, code = kind.code(), "Handler reported a protocol error");
                    Err(RpcError::new(*kind, Some(id.clone())))
                }
                None => {
                    error!(error = ?e, "Error handling method invocation");
                    Err(RpcError::internal_error(id))
                }
            },
            Err(payload) => {
                error!(
                    panic = panic_message(payload.as_ref()),
                    "Handler panicked"
                );
                Err(RpcError::internal_error(id))
            }
        }
    }
}

fn parse_error() -> Reply {
    Response::from(RpcError::parse_error()).into()
}

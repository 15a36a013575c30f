//! Error types.
//!
//! There are two very different kinds of errors in this crate:
//!
//! - Protocol errors ([`ErrorKind`] and [`RpcError`]), which are caused by the request data and
//!   are always turned into a JSON-RPC error response.  They never escape from
//!   [`crate::Dispatcher::post`].
//! - API misuse errors ([`RegistryError`], [`PoolError`]), which indicate a bug in the setup code
//!   of whoever is using this crate, and are returned directly to the caller of the offending
//!   method.
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Lowest code in the range the JSON-RPC spec reserves for implementation-defined server errors
pub const SERVER_ERROR_MIN: i32 = -32099;

/// Highest code in the range the JSON-RPC spec reserves for implementation-defined server errors
pub const SERVER_ERROR_MAX: i32 = -32000;

/// An error code in the reserved server error range `[-32099, -32000]`.
///
/// The only way to get one of these is [`ServerErrorCode::new`], so holding one is proof that the
/// code is in range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServerErrorCode(i32);

impl ServerErrorCode {
    pub fn new(code: i32) -> Result<Self, InvalidServerErrorCode> {
        if (SERVER_ERROR_MIN..=SERVER_ERROR_MAX).contains(&code) {
            Ok(Self(code))
        } else {
            Err(InvalidServerErrorCode { code })
        }
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error(
    "server error code {code} is outside the reserved range [{min}, {max}]",
    min = SERVER_ERROR_MIN,
    max = SERVER_ERROR_MAX
)]
pub struct InvalidServerErrorCode {
    pub code: i32,
}

/// The fixed set of JSON-RPC protocol errors.
///
/// The `Display` impl yields the canonical message for each kind, which is also the message that
/// goes out on the wire.
///
/// Handlers that want to fail with something more specific than an internal error can return one
/// of these (wrapped in `anyhow::Error`) and the dispatcher will report it as-is.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Parse error")]
    ParseError,

    #[error("Invalid Request")]
    InvalidRequest,

    #[error("Method not found")]
    MethodNotFound,

    #[error("Invalid params")]
    InvalidParams,

    #[error("Internal error")]
    InternalError,

    #[error("Server error")]
    ServerError(ServerErrorCode),
}

impl ErrorKind {
    /// Make a server error with an implementation-defined code.
    ///
    /// Fails immediately if the code is not in the reserved range.
    pub fn server_error(code: i32) -> Result<Self, InvalidServerErrorCode> {
        ServerErrorCode::new(code).map(Self::ServerError)
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError(code) => code.get(),
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// A protocol error together with the id of the request that caused it, if that id is known.
///
/// This is the error type of the whole per-call dispatch path; it's converted into an error
/// response at the end.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind} (code {})", .kind.code())]
pub struct RpcError {
    pub kind: ErrorKind,
    pub id: Option<Value>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, id: Option<Value>) -> Self {
        Self { kind, id }
    }

    /// Parse errors never have an id; if the text can't be parsed there's no way to know it
    pub fn parse_error() -> Self {
        Self::new(ErrorKind::ParseError, None)
    }

    pub fn invalid_request(id: Option<&Value>) -> Self {
        Self::new(ErrorKind::InvalidRequest, id.cloned())
    }

    pub fn method_not_found(id: &Value) -> Self {
        Self::new(ErrorKind::MethodNotFound, Some(id.clone()))
    }

    pub fn invalid_params(id: &Value) -> Self {
        Self::new(ErrorKind::InvalidParams, Some(id.clone()))
    }

    pub fn internal_error(id: &Value) -> Self {
        Self::new(ErrorKind::InternalError, Some(id.clone()))
    }
}

/// Misuse of the method registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Method '{method}' is already registered")]
    DuplicateMethod { method: String },

    #[error("Method '{method}' is not registered")]
    UnknownMethod { method: String },
}

/// Misuse of a worker pool, or failure to start its threads
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("The worker pool has already been started")]
    AlreadyStarted,

    #[error("The worker pool is shutting down and no longer accepts work")]
    ShutDown,

    #[error("Failed to spawn worker thread {index}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

//! Types that make up the JSON-RPC wire format, and the classification of JSON values into the
//! kinds that parameter specs are written in terms of.
use crate::error::RpcError;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// The only protocol version this crate speaks
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker that always serializes as the `"2.0"` version tag
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TwoPointZero;

impl Serialize for TwoPointZero {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

/// The kind of a JSON value, as far as parameter validation is concerned.
///
/// Integers are split the same way most JSON value trees split them: anything that fits in an
/// `i64` is [`ValueKind::Int`], and only integers too large for that are [`ValueKind::UInt`].
/// Every other number is [`ValueKind::Real`], even if it happens to have no fractional part
/// (`1.0` is real, `1` is an int).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    UInt,
    Real,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() => Self::Int,
            Value::Number(n) if n.is_u64() => Self::UInt,
            Value::Number(_) => Self::Real,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Either of the integer kinds; these are the only kinds accepted as a request id
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::UInt)
    }
}

/// The `error` member of an error response
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

/// Either the `result` or the `error` member of a response; exactly one is ever present
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(ErrorObject),
}

/// A single JSON-RPC response.
///
/// Success and error responses share the `jsonrpc` and `id` members.  An error response for a
/// request whose id could not be determined has `"id": null`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Response {
    jsonrpc: TwoPointZero,
    id: Option<Value>,
    #[serde(flatten)]
    payload: ResponsePayload,
}

impl Response {
    /// Wrap a method's result in a success response, echoing the request id as-is
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(error: RpcError) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload: ResponsePayload::Error(ErrorObject {
                code: error.kind.code(),
                message: error.kind.message(),
            }),
            id: error.id,
        }
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn payload(&self) -> &ResponsePayload {
        &self.payload
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }
}

impl From<RpcError> for Response {
    fn from(error: RpcError) -> Self {
        Self::error(error)
    }
}

/// Everything that can be sent back for one posted message: a single response, or one response
/// per element of a batch, in the same order as the batch
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Single(Response),
    Batch(Vec<Response>),
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self::Single(response)
    }
}

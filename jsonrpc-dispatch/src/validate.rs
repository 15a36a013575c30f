//! Validation of a single request object: first its JSON-RPC shape, then its `params` against the
//! target method's [`ParamSpec`].
use crate::error::RpcError;
use crate::registry::ParamSpec;
use crate::shared::{ValueKind, JSONRPC_VERSION};
use serde_json::{Map, Value};
use tracing::*;

/// A request object that has passed the shape check.
///
/// Borrows everything from the parsed request; nothing here outlives a single call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Request<'a> {
    /// Always an integer (signed or unsigned); echoed verbatim in the response
    pub id: &'a Value,
    pub method: &'a str,
    pub params: Option<&'a Value>,
}

impl<'a> Request<'a> {
    /// Check that `object` is a JSON-RPC 2.0 request.
    ///
    /// It must have an integer `id`, a string `method`, and `"jsonrpc": "2.0"`.  A request
    /// without an id is rejected like any other malformed request; this crate does not support
    /// notifications.
    ///
    /// If the shape is wrong but there is an integer `id`, the error carries it.
    pub fn from_object(object: &'a Map<String, Value>) -> Result<Self, RpcError> {
        let id = object
            .get("id")
            .filter(|id| ValueKind::of(id).is_integer());

        let Some(id) = id else {
            debug!(id = ?object.get("id"), "Request has a missing or non-integer id");
            return Err(RpcError::invalid_request(None));
        };

        let Some(method) = object.get("method").and_then(Value::as_str) else {
            debug!(%id, method = ?object.get("method"), "Request has a missing or non-string method");
            return Err(RpcError::invalid_request(Some(id)));
        };

        match object.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            version => {
                debug!(%id, ?version, "Request has a missing or unsupported protocol version");
                return Err(RpcError::invalid_request(Some(id)));
            }
        }

        Ok(Self {
            id,
            method,
            params: object.get("params"),
        })
    }
}

/// Check a request's `params` against the method's parameter spec.
///
/// Methods that take no parameters accept any `params`, including none at all; whatever was
/// sent is not looked at.  Otherwise `params` must be present, have exactly as many elements as
/// the method declares, have the same shape (object for named, array for positional), and every
/// value must be of exactly the declared kind.
pub fn check_params(spec: &ParamSpec, params: Option<&Value>, id: &Value) -> Result<(), RpcError> {
    if spec.is_empty() {
        return Ok(());
    }

    let invalid = |reason: &str| {
        debug!(%id, reason, "Invalid params");
        RpcError::invalid_params(id)
    };

    let Some(params) = params else {
        return Err(invalid("method requires params but none were provided"));
    };

    match (spec, params) {
        (ParamSpec::Named(expected), Value::Object(actual)) => {
            if actual.len() != expected.len() {
                return Err(invalid("wrong number of named params"));
            }

            for (name, value) in actual {
                match expected.get(name) {
                    None => return Err(invalid("unknown named param")),
                    Some(kind) if *kind != ValueKind::of(value) => {
                        debug!(param = %name, expected = %kind, actual = %ValueKind::of(value), "Param kind mismatch");
                        return Err(invalid("named param has the wrong kind"));
                    }
                    Some(_) => {}
                }
            }

            Ok(())
        }
        (ParamSpec::Positional(expected), Value::Array(actual)) => {
            if actual.len() != expected.len() {
                return Err(invalid("wrong number of positional params"));
            }

            for (position, (kind, value)) in expected.iter().zip(actual).enumerate() {
                if *kind != ValueKind::of(value) {
                    debug!(position, expected = %kind, actual = %ValueKind::of(value), "Param kind mismatch");
                    return Err(invalid("positional param has the wrong kind"));
                }
            }

            Ok(())
        }
        (_, _) => Err(invalid("params shape does not match the method's parameter spec")),
    }
}

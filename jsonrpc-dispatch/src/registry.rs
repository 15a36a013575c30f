//! The method registry: a map from method name to the parameter spec and handler for that method.
use crate::error::RegistryError;
use crate::shared::ValueKind;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// The result of a method handler.
///
/// Handlers are application code, so they fail with `anyhow`.  If the error is (or wraps) an
/// [`crate::ErrorKind`], that's what the client sees; anything else is reported as an internal
/// error.
pub type HandlerResult = anyhow::Result<Value>;

/// A type-erased method handler.
///
/// The first argument is the request's `params` (or `null` for methods that take no
/// parameters), the second is the handler context passed to `post`.
pub type Handler<C> = Box<dyn Fn(&Value, &C) -> HandlerResult + Send + Sync>;

/// The expected shape of a method's `params`.
///
/// The shape is fixed when the method is registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamSpec {
    /// `params` is an object; each key maps to the kind its value must have
    Named(BTreeMap<String, ValueKind>),

    /// `params` is an array; each element must have the kind at the same position
    Positional(Vec<ValueKind>),
}

impl ParamSpec {
    /// A method that takes no parameters at all.  Any `params` in the request are ignored.
    pub fn none() -> Self {
        Self::Positional(Vec::new())
    }

    pub fn named<K: Into<String>>(params: impl IntoIterator<Item = (K, ValueKind)>) -> Self {
        Self::Named(
            params
                .into_iter()
                .map(|(name, kind)| (name.into(), kind))
                .collect(),
        )
    }

    pub fn positional(params: impl IntoIterator<Item = ValueKind>) -> Self {
        Self::Positional(params.into_iter().collect())
    }

    /// The number of parameters a request must supply
    pub fn len(&self) -> usize {
        match self {
            Self::Named(params) => params.len(),
            Self::Positional(params) => params.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry entry binding a method name to its parameter spec and handler
pub struct MethodDescriptor<C> {
    name: String,
    params: ParamSpec,
    handler: Handler<C>,
}

impl<C> MethodDescriptor<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &ParamSpec {
        &self.params
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub(crate) fn invoke(&self, params: &Value, context: &C) -> HandlerResult {
        (self.handler)(params, context)
    }
}

impl<C> fmt::Debug for MethodDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Map of method names to their descriptors.
///
/// This type does no locking of its own; mutation needs `&mut self`.  [`crate::Dispatcher`]
/// keeps its registry behind a reader-writer lock so it can be shared with worker threads.
///
/// Descriptors are reference counted so that a caller can look one up, drop whatever lock
/// protects the registry, and then invoke the handler.
pub struct MethodRegistry<C> {
    methods: HashMap<String, Arc<MethodDescriptor<C>>>,
}

impl<C> MethodRegistry<C> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a new method.
    ///
    /// Fails if a method with this name already exists, in which case the registry is unchanged.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        params: ParamSpec,
        handler: Handler<C>,
    ) -> Result<(), RegistryError> {
        use std::collections::hash_map::Entry;

        let name = name.into();
        match self.methods.entry(name) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateMethod {
                method: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                let name = entry.key().clone();
                entry.insert(Arc::new(MethodDescriptor {
                    name,
                    params,
                    handler,
                }));
                Ok(())
            }
        }
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        self.methods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UnknownMethod {
                method: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodDescriptor<C>>> {
        self.methods.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.methods.len()
    }

    /// Names of all registered methods, in no particular order
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl<C> Default for MethodRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for MethodRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

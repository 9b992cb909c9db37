//! Operation registry for the callee side of the bridge.
//!
//! Maps operation names to typed handlers over a target object. Built once
//! at host startup; an unregistered name is an `unknown_operation` fault.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::protocol::{Call, Fault};

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn from_call(call: &Call) -> Self {
        Self::new(call.args.clone(), call.kwargs.clone())
    }

    /// Look up an argument by position, falling back to its keyword name.
    fn lookup(&self, position: usize, name: &str) -> Option<&Value> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }

    pub fn optional<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
    ) -> Result<Option<T>, Fault> {
        match self.lookup(position, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                Fault::invalid_argument(format!("argument {name} (#{position}): {e}"))
            }),
        }
    }

    pub fn required<T: DeserializeOwned>(&self, position: usize, name: &str) -> Result<T, Fault> {
        self.optional(position, name)?
            .ok_or_else(|| Fault::invalid_argument(format!("missing argument {name} (#{position})")))
    }

    pub fn or_default<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
        default: T,
    ) -> Result<T, Fault> {
        Ok(self.optional(position, name)?.unwrap_or(default))
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

type BoxedHandler<T> = Box<dyn Fn(&T, &CallArgs) -> Result<Value, Fault> + Send + Sync>;

/// Registry mapping operation names to handlers on `T`.
pub struct Registry<T> {
    operations: HashMap<String, BoxedHandler<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Register a handler whose return value is serialized as the result.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register<R, F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&T, &CallArgs) -> Result<R, Fault> + Send + Sync + 'static,
    {
        let name = name.into();
        let boxed: BoxedHandler<T> = Box::new(move |target, args| {
            let value = handler(target, args)?;
            serde_json::to_value(value)
                .map_err(|e| Fault::internal(format!("failed to serialize result: {e}")))
        });
        self.operations.insert(name, boxed);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted (for diagnostics).
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn invoke(&self, target: &T, operation: &str, args: &CallArgs) -> Result<Value, Fault> {
        let handler = self
            .operations
            .get(operation)
            .ok_or_else(|| Fault::unknown_operation(operation))?;
        handler(target, args)
    }
}

/// Cross-cutting behaviour run around every dispatched operation.
///
/// An error from `pre` skips the operation; an error from `post` replaces
/// its result. Both surface as `hook_failed` faults.
pub trait Hook<T>: Send + Sync {
    fn name(&self) -> &str;

    fn pre(&self, _operation: &str, _target: &T) -> Result<(), Fault> {
        Ok(())
    }

    fn post(&self, _operation: &str, _target: &T) -> Result<(), Fault> {
        Ok(())
    }
}

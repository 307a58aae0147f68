//! Callables, objects and namespaces on the host side

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::HostError;
use crate::host::value::HostValue;

/// Something host code can call with positional arguments
pub trait HostCallable: Send + Sync {
    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError>;

    /// Printable form, used when logging which callable misbehaved
    fn describe(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// A host object the bridge can look methods and items up on
pub trait HostObject: Send + Sync + fmt::Debug {
    /// Bound method by name
    fn method(&self, name: &str) -> Option<HostFunction>;

    /// Subscript with a string key
    fn get_item(&self, _key: &str) -> Option<HostValue> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

pub type HostObjectRef = Arc<dyn HostObject>;

/// Where the bridge resolves its named helper functions
pub trait HostNamespace: Send + Sync {
    fn lookup(&self, name: &str) -> Option<HostFunction>;
}

/// Shared handle to a host callable
#[derive(Clone)]
pub struct HostFunction(Arc<dyn HostCallable>);

struct ClosureCallable<F> {
    name: String,
    func: F,
}

impl<F> HostCallable for ClosureCallable<F>
where
    F: Fn(Vec<HostValue>) -> Result<HostValue, HostError> + Send + Sync + 'static,
{
    fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        (self.func)(args)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl HostFunction {
    /// Wrap a Rust closure as a host callable
    ///
    /// # Example
    /// ```
    /// use virt_bridge_core_rs::{HostFunction, HostValue};
    ///
    /// let double = HostFunction::new("double", |args| {
    ///     let n = args[0].as_int().unwrap_or(0);
    ///     Ok(HostValue::Int(n * 2))
    /// });
    /// assert_eq!(double.call(vec![HostValue::Int(21)]).unwrap(), HostValue::Int(42));
    /// ```
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        HostFunction(Arc::new(ClosureCallable {
            name: name.into(),
            func,
        }))
    }

    pub fn from_callable(callable: Arc<dyn HostCallable>) -> Self {
        HostFunction(callable)
    }

    pub fn call(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        self.0.call(args)
    }

    pub fn describe(&self) -> String {
        self.0.describe()
    }

    pub fn ptr_eq(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Concrete callable behind the handle
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.0.describe())
    }
}

/// Host object backed by a fixed method table and item map
///
/// Handy for embedders without a real interpreter and for tests.
#[derive(Debug, Default)]
pub struct MethodTable {
    type_name: String,
    methods: HashMap<String, HostFunction>,
    items: HashMap<String, HostValue>,
}

impl MethodTable {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, name: impl Into<String>, func: HostFunction) -> Self {
        self.methods.insert(name.into(), func);
        self
    }

    pub fn with_item(mut self, key: impl Into<String>, value: HostValue) -> Self {
        self.items.insert(key.into(), value);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn into_value(self) -> HostValue {
        HostValue::Object(Arc::new(self))
    }
}

impl HostObject for MethodTable {
    fn method(&self, name: &str) -> Option<HostFunction> {
        self.methods.get(name).cloned()
    }

    fn get_item(&self, key: &str) -> Option<HostValue> {
        self.items.get(key).cloned()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Namespace backed by an in-process function table
#[derive(Default)]
pub struct StaticNamespace {
    functions: RwLock<HashMap<String, HostFunction>>,
}

impl StaticNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, func: HostFunction) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), func);
    }

    pub fn remove(&self, name: &str) -> Option<HostFunction> {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl HostNamespace for StaticNamespace {
    fn lookup(&self, name: &str) -> Option<HostFunction> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

//! Values exchanged between code units, host functions and binary modules.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use anyhow::Context;

pub const ES_MODULE_FLAG: &str = "__esModule";
pub const DEFAULT_EXPORT: &str = "default";

/// A callable export. Host functions receive a [`HostCall`] so that calls coming from a binary
/// module can reach its linear memory.
pub type HostFn = Rc<dyn Fn(&mut HostCall<'_>, &[Value]) -> anyhow::Result<Vec<Value>>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Rc<str>),
    Function(HostFn),
    Object(Exports),
}

impl Value {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&mut HostCall<'_>, &[Value]) -> anyhow::Result<Vec<Value>> + 'static,
    {
        Value::Function(Rc::new(f))
    }

    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_i32(&self) -> anyhow::Result<i32> {
        match self {
            Value::I32(v) => Ok(*v),
            Value::Bool(b) => Ok(i32::from(*b)),
            other => anyhow::bail!("expected i32, got {}", other.type_name()),
        }
    }

    pub fn as_i64(&self) -> anyhow::Result<i64> {
        match self {
            Value::I64(v) => Ok(*v),
            Value::I32(v) => Ok(i64::from(*v)),
            other => anyhow::bail!("expected i64, got {}", other.type_name()),
        }
    }

    pub fn as_f32(&self) -> anyhow::Result<f32> {
        match self {
            Value::F32(v) => Ok(*v),
            other => anyhow::bail!("expected f32, got {}", other.type_name()),
        }
    }

    pub fn as_f64(&self) -> anyhow::Result<f64> {
        match self {
            Value::F64(v) => Ok(*v),
            Value::F32(v) => Ok(f64::from(*v)),
            Value::I32(v) => Ok(f64::from(*v)),
            other => anyhow::bail!("expected f64, got {}", other.type_name()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFn> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Exports> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}i32"),
            Value::I64(v) => write!(f, "{v}i64"),
            Value::F32(v) => write!(f, "{v}f32"),
            Value::F64(v) => write!(f, "{v}f64"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Function(_) => f.write_str("[function]"),
            Value::Object(o) => write!(f, "[object {{{}}}]", o.keys().join(", ")),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A shared, progressively populated exports object.
///
/// Cloning yields another handle to the same object; identity is observable through
/// [`Exports::ptr_eq`].
#[derive(Clone, Default)]
pub struct Exports(Rc<RefCell<BTreeMap<String, Value>>>);

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a plain value as a namespace object whose `default` export is `value`.
    pub fn namespace(value: Value) -> Self {
        if let Value::Object(obj) = &value {
            if obj.is_es_module() {
                return obj.clone();
            }
        }
        let ns = Exports::new();
        ns.mark_es_module();
        ns.set(DEFAULT_EXPORT, value);
        ns
    }

    pub fn set(&self, name: &str, value: Value) {
        self.0.borrow_mut().insert(name.to_owned(), value);
    }

    /// Adds `name` only if it is not already exported.
    pub fn define(&self, name: &str, value: Value) -> bool {
        let mut map = self.0.borrow_mut();
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_owned(), value);
        true
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().contains_key(name)
    }

    pub fn function(&self, name: &str) -> Option<HostFn> {
        match self.0.borrow().get(name) {
            Some(Value::Function(f)) => Some(f.clone()),
            _ => None,
        }
    }

    /// Calls the function exported as `name` outside of any binary module.
    pub fn call(&self, name: &str, args: &[Value]) -> anyhow::Result<Vec<Value>> {
        let f = self
            .function(name)
            .with_context(|| format!("export {name:?} is not a function"))?;
        f(&mut HostCall::detached(), args)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn mark_es_module(&self) {
        self.set(ES_MODULE_FLAG, Value::Bool(true));
    }

    pub fn is_es_module(&self) -> bool {
        matches!(self.get(ES_MODULE_FLAG), Some(Value::Bool(true)))
    }

    /// The `default` export of an ES-style module, the object itself otherwise.
    pub fn default_export(&self) -> Value {
        if self.is_es_module() {
            self.get(DEFAULT_EXPORT).unwrap_or_default()
        } else {
            Value::Object(self.clone())
        }
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.borrow().iter()).finish()
    }
}

/// Linear memory of the binary module on the other side of an import call.
pub trait GuestMemory {
    fn read(&mut self, offset: usize, len: usize) -> anyhow::Result<Vec<u8>>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Per-call context handed to a [`HostFn`].
pub struct HostCall<'a> {
    memory: Option<&'a mut dyn GuestMemory>,
    caller: Option<&'a str>,
}

impl HostCall<'static> {
    pub fn detached() -> Self {
        HostCall {
            memory: None,
            caller: None,
        }
    }
}

impl<'a> HostCall<'a> {
    pub fn from_module(memory: &'a mut dyn GuestMemory, module_id: &'a str) -> Self {
        HostCall {
            memory: Some(memory),
            caller: Some(module_id),
        }
    }

    /// Id of the binary module making this call, if any.
    pub fn caller_module(&self) -> Option<&str> {
        self.caller
    }

    pub fn read_bytes(&mut self, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
        let memory = self
            .memory
            .as_deref_mut()
            .context("host function needs guest memory but was called directly")?;
        let offset = usize::try_from(ptr).with_context(|| format!("negative pointer {ptr}"))?;
        let len = usize::try_from(len).with_context(|| format!("negative length {len}"))?;
        memory.read(offset, len)
    }

    pub fn read_str(&mut self, ptr: i32, len: i32) -> anyhow::Result<String> {
        let bytes = self.read_bytes(ptr, len)?;
        String::from_utf8(bytes).context("guest string is not UTF-8")
    }

    pub fn write_bytes(&mut self, ptr: i32, bytes: &[u8]) -> anyhow::Result<()> {
        let memory = self
            .memory
            .as_deref_mut()
            .context("host function needs guest memory but was called directly")?;
        let offset = usize::try_from(ptr).with_context(|| format!("negative pointer {ptr}"))?;
        memory.write(offset, bytes)
    }
}

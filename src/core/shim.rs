//! Host functions the binary module calls back into.
//!
//! Lookup is two-tier: a fixed table of named handlers per namespace, then,
//! for bindings namespaces only, a default handler that does nothing and
//! returns zero. Handlers see linear memory read-only and the host heap
//! mutably through [`HostCtx`].

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tracing::warn;
use wasmtime::Val;

use crate::config::ImportConfig;

pub const HANDLE_UNDEFINED: u32 = 0;
pub const HANDLE_NULL: u32 = 1;
pub const HANDLE_TRUE: u32 = 2;
pub const HANDLE_FALSE: u32 = 3;
const RESERVED_HANDLES: u32 = 4;

/// Upper bound on host array lengths a module may request.
pub const MAX_ARRAY_LEN: usize = 1 << 20;

/// Core-namespace entries that are not functions.
pub const CORE_MEMORY: &str = "memory";
pub const CORE_TABLE: &str = "table";
pub const CORE_TABLE_ALIAS: &str = "__indirect_function_table";

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ShimError {
    /// Raised on purpose by the module through `__wbindgen_throw`.
    #[error("{0}")]
    Thrown(String),

    #[error("memory access out of bounds: ptr={ptr} len={len} memory={size}")]
    OutOfBounds { ptr: u32, len: u32, size: usize },

    #[error("missing argument #{index}")]
    MissingArgument { index: usize },

    #[error("handle {0} does not refer to a live value")]
    DeadHandle(u32),

    #[error("array length or index {value} outside 0..={max}")]
    ArrayBounds { value: i64, max: usize },
}

/// Reads `len` bytes at `ptr` as UTF-8, replacing invalid sequences.
pub fn decode_string(memory: &[u8], ptr: u32, len: u32) -> Result<String, ShimError> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= memory.len())
        .ok_or(ShimError::OutOfBounds {
            ptr,
            len,
            size: memory.len(),
        })?;
    Ok(String::from_utf8_lossy(&memory[start..end]).into_owned())
}

/// Builds the error a module raises with `(ptr, len)` pointing at its message.
pub fn throw_host_error(memory: &[u8], ptr: u32, len: u32) -> ShimError {
    match decode_string(memory, ptr, len) {
        Ok(message) => ShimError::Thrown(message),
        Err(e) => e,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomNode {
    Document,
    Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Elements are handles into the same heap.
    Array(Vec<u32>),
    Node(DomNode),
}

impl HostValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
            HostValue::String(s) => !s.is_empty(),
            HostValue::Array(_) | HostValue::Node(_) => true,
        }
    }

    pub fn as_number(&self) -> f64 {
        match self {
            HostValue::Number(n) => *n,
            HostValue::Bool(b) => f64::from(u8::from(*b)),
            HostValue::Null => 0.0,
            _ => f64::NAN,
        }
    }
}

/// Handle table for values the module holds by reference.
///
/// The first four handles are fixed constants and survive `drop_ref`.
#[derive(Debug, Clone)]
pub struct HostHeap {
    slots: Vec<Option<HostValue>>,
    free: Vec<u32>,
}

impl Default for HostHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHeap {
    pub fn new() -> Self {
        Self {
            slots: vec![
                Some(HostValue::Undefined),
                Some(HostValue::Null),
                Some(HostValue::Bool(true)),
                Some(HostValue::Bool(false)),
            ],
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: HostValue) -> u32 {
        match value {
            HostValue::Undefined => return HANDLE_UNDEFINED,
            HostValue::Null => return HANDLE_NULL,
            HostValue::Bool(true) => return HANDLE_TRUE,
            HostValue::Bool(false) => return HANDLE_FALSE,
            _ => {}
        }
        if let Some(h) = self.free.pop() {
            self.slots[h as usize] = Some(value);
            h
        } else {
            self.slots.push(Some(value));
            (self.slots.len() - 1) as u32
        }
    }

    pub fn get(&self, handle: u32) -> Option<&HostValue> {
        self.slots.get(handle as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut HostValue> {
        self.slots.get_mut(handle as usize).and_then(|s| s.as_mut())
    }

    /// Dead or unknown handles read as `undefined`, like a missing property.
    pub fn value_or_undefined(&self, handle: u32) -> &HostValue {
        self.get(handle).unwrap_or(&HostValue::Undefined)
    }

    pub fn drop_ref(&mut self, handle: u32) {
        if handle < RESERVED_HANDLES {
            return;
        }
        if let Some(slot) = self.slots.get_mut(handle as usize) {
            if slot.take().is_some() {
                self.free.push(handle);
            }
        }
    }

    /// Live values, reserved constants excluded.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .skip(RESERVED_HANDLES as usize)
            .filter(|s| s.is_some())
            .count()
    }
}

/// What a handler sees while it runs.
pub struct HostCtx<'a> {
    pub memory: &'a [u8],
    pub heap: &'a mut HostHeap,
}

pub type HostFn = Arc<dyn Fn(&mut HostCtx<'_>, &[Val]) -> Result<Option<Val>, ShimError> + Send + Sync>;

pub fn host_fn<F>(f: F) -> HostFn
where
    F: Fn(&mut HostCtx<'_>, &[Val]) -> Result<Option<Val>, ShimError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Declared,
    Fallback,
}

#[derive(Clone)]
pub struct HostCallable {
    pub namespace: String,
    pub name: String,
    pub kind: CallableKind,
    func: HostFn,
}

impl std::fmt::Debug for HostCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCallable")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl HostCallable {
    pub fn invoke(&self, ctx: &mut HostCtx<'_>, args: &[Val]) -> Result<Option<Val>, ShimError> {
        (self.func)(ctx, args)
    }

    pub fn is_fallback(&self) -> bool {
        self.kind == CallableKind::Fallback
    }
}

pub trait ImportResolver: Send + Sync {
    /// `None` means the import cannot be satisfied and instantiation must
    /// not proceed.
    fn resolve(&self, namespace: &str, name: &str) -> Option<HostCallable>;
}

/// Calls that landed on the default handler, keyed by `namespace.name`.
#[derive(Debug, Clone, Default)]
pub struct FallbackLog {
    calls: Arc<Mutex<HashMap<String, u64>>>,
}

impl FallbackLog {
    pub fn record(&self, namespace: &str, name: &str) {
        let key = format!("{}.{}", namespace, name);
        warn!("Called unimplemented import {}; returning default", key);
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        *calls.entry(key).or_insert(0) += 1;
    }

    pub fn count(&self, qualified_name: &str) -> u64 {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(qualified_name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.values().sum()
    }

    pub fn names(&self) -> Vec<String> {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = calls.keys().cloned().collect();
        names.sort();
        names
    }
}

/// The default resolver: `env` helpers plus the wasm-bindgen style `wbg`
/// surface.
#[derive(Clone)]
pub struct ImportShim {
    core_namespace: String,
    bindings_namespaces: Vec<String>,
    core: HashMap<String, HostFn>,
    bindings: HashMap<String, HostFn>,
    fallbacks: FallbackLog,
}

impl ImportShim {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            core_namespace: config.core_namespace.clone(),
            bindings_namespaces: config.bindings_namespaces.clone(),
            core: core_table(),
            bindings: bindings_table(),
            fallbacks: FallbackLog::default(),
        }
    }

    pub fn core_namespace(&self) -> &str {
        &self.core_namespace
    }

    pub fn is_bindings_namespace(&self, namespace: &str) -> bool {
        self.bindings_namespaces.iter().any(|ns| ns == namespace)
    }

    pub fn fallbacks(&self) -> &FallbackLog {
        &self.fallbacks
    }

    /// Same handlers, empty fallback log. One per module instance.
    pub fn with_fresh_log(&self) -> Self {
        Self {
            fallbacks: FallbackLog::default(),
            ..self.clone()
        }
    }

    /// Adds or replaces a bindings handler.
    pub fn define_binding<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut HostCtx<'_>, &[Val]) -> Result<Option<Val>, ShimError> + Send + Sync + 'static,
    {
        self.bindings.insert(name.to_string(), Arc::new(f));
    }

    pub fn declares(&self, namespace: &str, name: &str) -> bool {
        if namespace == self.core_namespace {
            self.core.contains_key(name)
        } else if self.is_bindings_namespace(namespace) {
            self.bindings.contains_key(name)
        } else {
            false
        }
    }

    fn fallback(&self, namespace: &str, name: &str) -> HostCallable {
        let log = self.fallbacks.clone();
        let (ns, n) = (namespace.to_string(), name.to_string());
        HostCallable {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: CallableKind::Fallback,
            func: host_fn(move |_ctx, _args| {
                log.record(&ns, &n);
                Ok(None)
            }),
        }
    }
}

impl ImportResolver for ImportShim {
    fn resolve(&self, namespace: &str, name: &str) -> Option<HostCallable> {
        let declared = |func: &HostFn| HostCallable {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: CallableKind::Declared,
            func: Arc::clone(func),
        };
        if namespace == self.core_namespace {
            return self.core.get(name).map(declared);
        }
        if self.is_bindings_namespace(namespace) {
            return Some(
                self.bindings
                    .get(name)
                    .map(declared)
                    .unwrap_or_else(|| self.fallback(namespace, name)),
            );
        }
        None
    }
}

// Argument readers accept any numeric value so a module declaring a slightly
// different signature still gets sensible input.

pub fn arg_u32(args: &[Val], index: usize) -> Result<u32, ShimError> {
    Ok(arg_i64(args, index)? as u32)
}

pub fn arg_i64(args: &[Val], index: usize) -> Result<i64, ShimError> {
    match args.get(index) {
        Some(Val::I32(v)) => Ok(i64::from(*v)),
        Some(Val::I64(v)) => Ok(*v),
        Some(Val::F32(bits)) => Ok(f32::from_bits(*bits) as i64),
        Some(Val::F64(bits)) => Ok(f64::from_bits(*bits) as i64),
        _ => Err(ShimError::MissingArgument { index }),
    }
}

pub fn arg_f64(args: &[Val], index: usize) -> Result<f64, ShimError> {
    match args.get(index) {
        Some(Val::I32(v)) => Ok(f64::from(*v)),
        Some(Val::I64(v)) => Ok(*v as f64),
        Some(Val::F32(bits)) => Ok(f64::from(f32::from_bits(*bits))),
        Some(Val::F64(bits)) => Ok(f64::from_bits(*bits)),
        _ => Err(ShimError::MissingArgument { index }),
    }
}

/// Reads an array length, or an index, that must stay within `0..=max`.
fn arg_array_bound(args: &[Val], index: usize, max: usize) -> Result<usize, ShimError> {
    let value = arg_i64(args, index)?;
    usize::try_from(value)
        .ok()
        .filter(|v| *v <= max)
        .ok_or(ShimError::ArrayBounds { value, max })
}

fn handle(h: u32) -> Option<Val> {
    Some(Val::I32(h as i32))
}

fn core_table() -> HashMap<String, HostFn> {
    let mut t: HashMap<String, HostFn> = HashMap::new();
    t.insert(
        "getStringFromWasm0".to_string(),
        host_fn(|ctx, args| {
            let s = decode_string(ctx.memory, arg_u32(args, 0)?, arg_u32(args, 1)?)?;
            Ok(handle(ctx.heap.insert(HostValue::String(s))))
        }),
    );
    t.insert("__wbindgen_throw".to_string(), host_fn(throw_handler));
    t
}

fn throw_handler(ctx: &mut HostCtx<'_>, args: &[Val]) -> Result<Option<Val>, ShimError> {
    Err(throw_host_error(ctx.memory, arg_u32(args, 0)?, arg_u32(args, 1)?))
}

fn bindings_table() -> HashMap<String, HostFn> {
    let mut t: HashMap<String, HostFn> = HashMap::new();
    let mut def = |name: &str, f: HostFn| {
        t.insert(name.to_string(), f);
    };

    def(
        "__wbindgen_object_drop_ref",
        host_fn(|ctx, args| {
            ctx.heap.drop_ref(arg_u32(args, 0)?);
            Ok(None)
        }),
    );
    def(
        "__wbg_body_942ea927546a04ba",
        host_fn(|ctx, _args| Ok(handle(ctx.heap.insert(HostValue::Node(DomNode::Body))))),
    );
    def(
        "__wbindgen_document_d249400bd7bd996d",
        host_fn(|ctx, _args| Ok(handle(ctx.heap.insert(HostValue::Node(DomNode::Document))))),
    );
    def(
        "__wbindgen_string_new",
        host_fn(|ctx, args| {
            let s = decode_string(ctx.memory, arg_u32(args, 0)?, arg_u32(args, 1)?)?;
            Ok(handle(ctx.heap.insert(HostValue::String(s))))
        }),
    );
    def("__wbindgen_throw", host_fn(throw_handler));
    def(
        "__wbindgen_number_get",
        host_fn(|ctx, args| {
            let n = ctx.heap.value_or_undefined(arg_u32(args, 0)?).as_number();
            Ok(Some(Val::from(n)))
        }),
    );
    def(
        "__wbindgen_number_new",
        host_fn(|ctx, args| Ok(handle(ctx.heap.insert(HostValue::Number(arg_f64(args, 0)?))))),
    );
    def(
        "__wbindgen_boolean_get",
        host_fn(|ctx, args| {
            let truthy = ctx.heap.value_or_undefined(arg_u32(args, 0)?).is_truthy();
            Ok(Some(Val::I32(i32::from(truthy))))
        }),
    );
    def(
        "__wbindgen_boolean_new",
        host_fn(|_ctx, args| {
            let h = if arg_i64(args, 0)? != 0 {
                HANDLE_TRUE
            } else {
                HANDLE_FALSE
            };
            Ok(handle(h))
        }),
    );
    def(
        "__wbindgen_is_undefined",
        host_fn(|ctx, args| {
            let v = ctx.heap.value_or_undefined(arg_u32(args, 0)?);
            Ok(Some(Val::I32(i32::from(*v == HostValue::Undefined))))
        }),
    );
    def(
        "__wbindgen_is_null",
        host_fn(|ctx, args| {
            let v = ctx.heap.value_or_undefined(arg_u32(args, 0)?);
            Ok(Some(Val::I32(i32::from(*v == HostValue::Null))))
        }),
    );
    def(
        "__wbindgen_array_new",
        host_fn(|ctx, args| {
            let len = arg_array_bound(args, 0, MAX_ARRAY_LEN)?;
            Ok(handle(
                ctx.heap
                    .insert(HostValue::Array(vec![HANDLE_UNDEFINED; len])),
            ))
        }),
    );
    def(
        "__wbindgen_array_get",
        host_fn(|ctx, args| {
            let arr = arg_u32(args, 0)?;
            let idx = arg_u32(args, 1)? as usize;
            let h = match ctx.heap.get(arr) {
                Some(HostValue::Array(items)) => items.get(idx).copied().unwrap_or(HANDLE_UNDEFINED),
                _ => HANDLE_UNDEFINED,
            };
            Ok(handle(h))
        }),
    );
    def(
        "__wbindgen_array_set",
        host_fn(|ctx, args| {
            let arr = arg_u32(args, 0)?;
            let idx = arg_array_bound(args, 1, MAX_ARRAY_LEN - 1)?;
            let val = arg_u32(args, 2)?;
            match ctx.heap.get_mut(arr) {
                Some(HostValue::Array(items)) => {
                    // Writing past the end grows the array, holes read as undefined.
                    if idx >= items.len() {
                        items.resize(idx + 1, HANDLE_UNDEFINED);
                    }
                    items[idx] = val;
                    Ok(None)
                }
                _ => Err(ShimError::DeadHandle(arr)),
            }
        }),
    );
    t
}

//! Turns validated module bytes into a running, callable instance.
//!
//! Every import is resolved before anything is allocated, so an
//! unsatisfiable import never produces a half-built instance. Host callables
//! are wrapped with the exact function type the module declares.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info};
use wasmtime::{
    Caller, Engine, Extern, ExternType, Func, FuncType, Instance, Linker, Memory, MemoryType,
    Module, Ref, RefType, Store, Table, TableType, Val, ValType,
};

use crate::config::{BootConfig, MemoryLimits, TableLimits};
use crate::error::{BootError, BootResult};
use crate::shim::{
    FallbackLog, HostCallable, HostCtx, HostHeap, ImportResolver, ImportShim, ShimError,
    CORE_MEMORY, CORE_TABLE, CORE_TABLE_ALIAS,
};

/// Per-store data visible to host callables.
#[derive(Debug, Default)]
pub struct HostState {
    pub heap: HostHeap,
    /// Host-allocated memory, used when the module does not export its own.
    pub memory: Option<Memory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Memory,
    Table,
    Global,
    Other,
}

impl ExportKind {
    fn of(ext: &Extern) -> Self {
        match ext {
            Extern::Func(_) => ExportKind::Function,
            Extern::Memory(_) | Extern::SharedMemory(_) => ExportKind::Memory,
            Extern::Table(_) => ExportKind::Table,
            Extern::Global(_) => ExportKind::Global,
            #[allow(unreachable_patterns)]
            _ => ExportKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub kind: ExportKind,
}

struct Live {
    store: Store<HostState>,
    instance: Instance,
}

/// A ready module. Calls are serialized through an internal lock.
pub struct ModuleInstance {
    live: Mutex<Live>,
    exports: Vec<ExportInfo>,
    fallbacks: FallbackLog,
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

impl ModuleInstance {
    fn live(&self) -> MutexGuard<'_, Live> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn exports(&self) -> &[ExportInfo] {
        &self.exports
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e.name == name)
    }

    pub fn is_callable(&self, name: &str) -> bool {
        self.exports
            .iter()
            .any(|e| e.name == name && e.kind == ExportKind::Function)
    }

    /// Calls into the module. Host throws and traps become `ModuleCall`.
    pub fn call(&self, name: &str, args: &[Val]) -> BootResult<Vec<Val>> {
        let mut guard = self.live();
        let Live { store, instance } = &mut *guard;

        let func = instance
            .get_func(&mut *store, name)
            .ok_or_else(|| BootError::ModuleCall {
                export: name.to_string(),
                message: "no exported function with this name".to_string(),
            })?;
        let mut results = func
            .ty(&*store)
            .results()
            .map(|t| Val::default_for_ty(&t).unwrap_or(Val::I32(0)))
            .collect::<Vec<_>>();

        func.call(&mut *store, args, &mut results).map_err(|e| {
            let err = module_call_error(name, &e);
            error!("{}", err);
            err
        })?;
        Ok(results)
    }

    /// Calls that landed on the no-op default handler.
    pub fn fallbacks(&self) -> &FallbackLog {
        &self.fallbacks
    }

    /// Host values the module still holds handles to.
    pub fn live_handles(&self) -> usize {
        self.live().store.data().heap.live()
    }
}

fn module_call_error(export: &str, err: &wasmtime::Error) -> BootError {
    let message = if let Some(shim) = err.downcast_ref::<ShimError>() {
        shim.to_string()
    } else if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        format!("trap: {}", trap)
    } else {
        format!("{:#}", err)
    };
    BootError::ModuleCall {
        export: export.to_string(),
        message,
    }
}

/// Coerces whatever a host callable produced to the declared result type.
fn coerce(value: &Val, ty: &ValType) -> Option<Val> {
    let (int, float) = match value {
        Val::I32(v) => (i64::from(*v), f64::from(*v)),
        Val::I64(v) => (*v, *v as f64),
        Val::F32(bits) => {
            let f = f32::from_bits(*bits);
            (f as i64, f64::from(f))
        }
        Val::F64(bits) => {
            let f = f64::from_bits(*bits);
            (f as i64, f)
        }
        _ => return Val::default_for_ty(ty),
    };
    match ty {
        ValType::I32 => Some(Val::I32(int as i32)),
        ValType::I64 => Some(Val::I64(int)),
        ValType::F32 => Some(Val::F32((float as f32).to_bits())),
        ValType::F64 => Some(Val::F64(float.to_bits())),
        _ => Val::default_for_ty(ty),
    }
}

struct ResolvedFunc {
    namespace: String,
    name: String,
    ty: FuncType,
    callable: HostCallable,
}

#[derive(Clone)]
pub struct Instantiator {
    engine: Engine,
    memory: MemoryLimits,
    table: TableLimits,
    shim: ImportShim,
}

impl Instantiator {
    pub fn new(config: &BootConfig) -> Self {
        Self {
            engine: Engine::default(),
            memory: config.memory,
            table: config.table,
            shim: ImportShim::new(&config.imports),
        }
    }

    /// Replaces the import shim, e.g. one with extra bindings defined.
    pub fn with_shim(mut self, shim: ImportShim) -> Self {
        self.shim = shim;
        self
    }

    pub fn shim_mut(&mut self) -> &mut ImportShim {
        &mut self.shim
    }

    pub fn instantiate(&self, bytes: &[u8]) -> BootResult<ModuleInstance> {
        let module = Module::from_binary(&self.engine, bytes).map_err(|source| {
            error!("Module compilation failed ({} bytes): {:#}", bytes.len(), source);
            BootError::Instantiation { source }
        })?;

        let shim = self.shim.with_fresh_log();
        let funcs = self.resolve_imports(&module, &shim)?;
        debug!("Resolved {} function imports", funcs.len());

        let mut store = Store::new(&self.engine, HostState::default());
        let memory = Memory::new(
            &mut store,
            MemoryType::new(self.memory.initial_pages, Some(self.memory.maximum_pages)),
        )
        .map_err(|source| BootError::Instantiation { source })?;
        let table = Table::new(
            &mut store,
            TableType::new(RefType::FUNCREF, self.table.initial, Some(self.table.maximum)),
            Ref::Func(None),
        )
        .map_err(|source| BootError::Instantiation { source })?;
        store.data_mut().memory = Some(memory);

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        linker.allow_shadowing(true);
        let core = shim.core_namespace();
        for (name, ext) in [
            (CORE_MEMORY, Extern::from(memory)),
            (CORE_TABLE, Extern::from(table)),
            (CORE_TABLE_ALIAS, Extern::from(table)),
        ] {
            linker
                .define(&store, core, name, ext)
                .map_err(|source| BootError::Instantiation { source })?;
        }

        for f in funcs {
            let func = host_func(&mut store, f.ty, f.callable);
            linker
                .define(&store, &f.namespace, &f.name, func)
                .map_err(|source| BootError::Instantiation { source })?;
        }

        let instance = linker.instantiate(&mut store, &module).map_err(|e| {
            if e.downcast_ref::<ShimError>().is_some() {
                module_call_error("<start>", &e)
            } else {
                error!("Module instantiation failed: {:#}", e);
                BootError::Instantiation { source: e }
            }
        })?;

        let exports = instance
            .exports(&mut store)
            .map(|e| {
                let name = e.name().to_string();
                let kind = ExportKind::of(&e.into_extern());
                ExportInfo { name, kind }
            })
            .collect::<Vec<_>>();
        info!(
            "Module instantiated ({} bytes, {} exports)",
            bytes.len(),
            exports.len()
        );

        Ok(ModuleInstance {
            live: Mutex::new(Live { store, instance }),
            exports,
            fallbacks: shim.fallbacks().clone(),
        })
    }

    fn resolve_imports(&self, module: &Module, shim: &ImportShim) -> BootResult<Vec<ResolvedFunc>> {
        let mut out = Vec::new();
        for import in module.imports() {
            let (namespace, name) = (import.module(), import.name());
            let unresolved = || {
                error!("Unresolvable import {}.{}", namespace, name);
                BootError::ImportResolution {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            };
            let is_core = namespace == shim.core_namespace();
            match import.ty() {
                ExternType::Func(ty) => {
                    let callable = shim.resolve(namespace, name).ok_or_else(unresolved)?;
                    if callable.is_fallback() {
                        debug!("{}.{} resolved to the default handler", namespace, name);
                    }
                    out.push(ResolvedFunc {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        ty,
                        callable,
                    });
                }
                ExternType::Memory(_) if is_core && name == CORE_MEMORY => {}
                ExternType::Table(_) if is_core && (name == CORE_TABLE || name == CORE_TABLE_ALIAS) => {}
                _ => return Err(unresolved()),
            }
        }
        Ok(out)
    }
}

fn host_func(store: &mut Store<HostState>, ty: FuncType, callable: HostCallable) -> Func {
    let result_types = ty.results().collect::<Vec<_>>();
    let callable = Arc::new(callable);
    Func::new(store, ty, move |mut caller: Caller<'_, HostState>, params, results| {
        let memory = caller
            .get_export(CORE_MEMORY)
            .and_then(Extern::into_memory)
            .or(caller.data().memory);
        let produced = match memory {
            Some(mem) => {
                let (data, state) = mem.data_and_store_mut(&mut caller);
                let mut ctx = HostCtx {
                    memory: data,
                    heap: &mut state.heap,
                };
                callable.invoke(&mut ctx, params)
            }
            None => {
                let mut ctx = HostCtx {
                    memory: &[],
                    heap: &mut caller.data_mut().heap,
                };
                callable.invoke(&mut ctx, params)
            }
        }
        .map_err(wasmtime::Error::new)?;

        for (i, (slot, ty)) in results.iter_mut().zip(&result_types).enumerate() {
            let value = match (&produced, i) {
                (Some(v), 0) => coerce(v, ty),
                _ => Val::default_for_ty(ty),
            };
            if let Some(v) = value {
                *slot = v;
            }
        }
        Ok(())
    })
}

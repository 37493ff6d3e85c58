//! Compiling binary modules and bridging their imports onto host-interface code units.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use wasmtime::{Caller, Engine, Extern, ExternType, Func, Linker, Memory, Module, Store, Val, ValType};

use crate::host::Payload;
use crate::manifest::BinaryModuleManifest;
use crate::registry::{ModuleRegistry, WeakRegistry};
use crate::value::{GuestMemory, HostCall, HostFn, Value};

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_VERSION: &[u8; 4] = &[1, 0, 0, 0];
const PREAMBLE_LEN: usize = 8;

/// Export name under which a module exposes its linear memory to host functions.
pub const MEMORY_EXPORT: &str = "memory";

/// Checks the 8-byte header of a core WebAssembly binary.
pub fn check_preamble(bytes: &[u8]) -> Result<()> {
    if bytes.len() < PREAMBLE_LEN {
        bail!("binary module truncated: {} bytes", bytes.len());
    }
    if &bytes[..4] != WASM_MAGIC {
        bail!("not a WebAssembly binary (bad magic {:02x?})", &bytes[..4]);
    }
    if &bytes[4..PREAMBLE_LEN] != WASM_VERSION {
        bail!("unsupported WebAssembly version {:02x?}", &bytes[4..PREAMBLE_LEN]);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    /// Code unit implementing the import.
    pub unit: String,
    /// Function export of that unit.
    pub function: String,
}

/// Import namespace -> import name -> host function it forwards to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportTable {
    namespaces: BTreeMap<String, BTreeMap<String, ImportBinding>>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_manifest(module: &BinaryModuleManifest) -> Self {
        let mut table = Self::new();
        for (namespace, ns) in &module.imports {
            for function in &ns.functions {
                table.insert(
                    namespace,
                    function,
                    ImportBinding {
                        unit: ns.unit.clone(),
                        function: function.clone(),
                    },
                );
            }
        }
        table
    }

    pub fn insert(&mut self, namespace: &str, name: &str, binding: ImportBinding) {
        self.namespaces
            .entry(namespace.to_owned())
            .or_default()
            .insert(name.to_owned(), binding);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&ImportBinding> {
        self.namespaces.get(namespace)?.get(name)
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarKind {
    I32,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    fn of(ty: &ValType) -> Result<Self> {
        match ty {
            ValType::I32 => Ok(ScalarKind::I32),
            ValType::I64 => Ok(ScalarKind::I64),
            ValType::F32 => Ok(ScalarKind::F32),
            ValType::F64 => Ok(ScalarKind::F64),
            other => bail!("unsupported value type {other}"),
        }
    }

    fn to_val(self, value: &Value) -> Result<Val> {
        Ok(match self {
            ScalarKind::I32 => Val::I32(value.as_i32()?),
            ScalarKind::I64 => Val::I64(value.as_i64()?),
            ScalarKind::F32 => Val::F32((value.as_f64()? as f32).to_bits()),
            ScalarKind::F64 => Val::F64(value.as_f64()?.to_bits()),
        })
    }
}

fn value_from_val(val: &Val) -> Result<Value> {
    match val {
        Val::I32(v) => Ok(Value::I32(*v)),
        Val::I64(v) => Ok(Value::I64(*v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
        other => bail!("unsupported value {other:?} crossing the module boundary"),
    }
}

pub(crate) struct BridgeState {
    registry: WeakRegistry,
    module_id: String,
}

struct CallerMemory<'a, 'b> {
    caller: &'a mut Caller<'b, BridgeState>,
    memory: Memory,
}

impl GuestMemory for CallerMemory<'_, '_> {
    fn read(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.memory
            .read(&*self.caller, offset, &mut buf)
            .with_context(|| format!("read {len} bytes of guest memory at {offset}"))?;
        Ok(buf)
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.memory
            .write(&mut *self.caller, offset, bytes)
            .with_context(|| format!("write {} bytes of guest memory at {offset}", bytes.len()))
    }
}

fn bridge_call(
    mut caller: Caller<'_, BridgeState>,
    binding: &ImportBinding,
    results: &[ScalarKind],
    params: &[Val],
    out: &mut [Val],
) -> Result<()> {
    let registry = caller
        .data()
        .registry
        .upgrade()
        .context("module registry has been dropped")?;
    let module_id = caller.data().module_id.clone();
    let unit = &binding.unit;
    let function = &binding.function;

    let host = registry
        .get(unit)
        .with_context(|| format!("host interface {unit:?} has not been initialized"))?;
    let f: HostFn = host
        .function(function)
        .with_context(|| format!("host interface {unit:?} exports no function {function:?}"))?;
    let args = params.iter().map(value_from_val).collect::<Result<Vec<_>>>()?;

    let returned = match caller.get_export(MEMORY_EXPORT).and_then(Extern::into_memory) {
        Some(memory) => {
            let mut guest = CallerMemory {
                caller: &mut caller,
                memory,
            };
            f(&mut HostCall::from_module(&mut guest, &module_id), &args)
        }
        None => f(&mut HostCall::detached(), &args),
    }
    .with_context(|| format!("host function {unit}::{function} failed"))?;

    for (slot, (kind, out)) in results.iter().zip(out.iter_mut()).enumerate() {
        let value = returned.get(slot).with_context(|| {
            format!("host function {unit}::{function} returned {} values, expected {}", returned.len(), results.len())
        })?;
        *out = kind.to_val(value)?;
    }
    Ok(())
}

/// Compiles and instantiates binary modules against an [`ImportTable`].
#[derive(Clone, Default)]
pub struct WasmEngine {
    engine: Engine,
}

impl WasmEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, bytes: &[u8]) -> Result<Module> {
        check_preamble(bytes)?;
        Module::from_binary(&self.engine, bytes).context("compile binary module")
    }

    /// Wires every declared import, then instantiates. A missing import fails before anything
    /// runs.
    pub fn instantiate(
        &self,
        module: &Module,
        imports: &ImportTable,
        registry: &ModuleRegistry,
        module_id: &str,
    ) -> Result<ExportTable> {
        let mut linker: Linker<BridgeState> = Linker::new(&self.engine);
        for import in module.imports() {
            let namespace = import.module();
            let name = import.name();
            let ExternType::Func(ty) = import.ty() else {
                bail!("import {namespace:?}.{name:?} is not a function");
            };
            let binding = imports
                .get(namespace, name)
                .with_context(|| format!("no host function wired for import {namespace:?}.{name:?}"))?
                .clone();
            let results = ty
                .results()
                .map(|t| ScalarKind::of(&t))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("import {namespace:?}.{name:?}"))?;
            linker.func_new(namespace, name, ty.clone(), move |caller, params, out| {
                bridge_call(caller, &binding, &results, params, out)
            })?;
        }

        let mut store = Store::new(
            &self.engine,
            BridgeState {
                registry: registry.downgrade(),
                module_id: module_id.to_owned(),
            },
        );
        let instance = linker
            .instantiate(&mut store, module)
            .with_context(|| format!("instantiate binary module {module_id:?}"))?;

        let exported: Vec<(String, Extern)> = instance
            .exports(&mut store)
            .map(|export| (export.name().to_owned(), export.into_extern()))
            .collect();
        let mut functions = BTreeMap::new();
        let mut memory = None;
        for (name, item) in exported {
            match item {
                Extern::Func(func) => {
                    functions.insert(name, func);
                }
                Extern::Memory(mem) if name == MEMORY_EXPORT => memory = Some(mem),
                _ => {}
            }
        }

        Ok(ExportTable {
            module_id: module_id.to_owned(),
            store: RefCell::new(store),
            functions,
            memory,
        })
    }

    /// Compiles while the payload is still arriving; a bad header fails on the first piece that
    /// completes it.
    pub(crate) async fn compile_streaming(&self, payload: Payload) -> Result<Module> {
        let bytes = match payload {
            Payload::Buffered(bytes) => bytes,
            Payload::Stream(mut stream) => {
                let mut bytes = Vec::new();
                let mut checked = false;
                while let Some(piece) = stream.next().await {
                    bytes.extend_from_slice(&piece.context("read binary module stream")?);
                    if !checked && bytes.len() >= PREAMBLE_LEN {
                        check_preamble(&bytes)?;
                        checked = true;
                    }
                }
                bytes
            }
        };
        self.compile(&bytes)
    }
}

impl fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WasmEngine")
    }
}

/// Exports of one instantiated binary module.
pub struct ExportTable {
    module_id: String,
    store: RefCell<Store<BridgeState>>,
    functions: BTreeMap<String, Func>,
    memory: Option<Memory>,
}

impl ExportTable {
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        let func = *self.functions.get(name).with_context(|| {
            format!("binary module {:?} exports no function {name:?}", self.module_id)
        })?;
        let mut store = self.store.try_borrow_mut().map_err(|_| {
            anyhow!(
                "re-entrant call into binary module {:?} (export {name:?})",
                self.module_id
            )
        })?;

        let ty = func.ty(&*store);
        if ty.params().len() != args.len() {
            bail!(
                "export {name:?} takes {} arguments, got {}",
                ty.params().len(),
                args.len()
            );
        }
        let params = ty
            .params()
            .zip(args)
            .map(|(t, v)| ScalarKind::of(&t)?.to_val(v))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("arguments to {name:?}"))?;
        let mut results = vec![Val::I32(0); ty.results().len()];
        func.call(&mut *store, &params, &mut results)
            .with_context(|| format!("call {}::{name}", self.module_id))?;
        results.iter().map(value_from_val).collect()
    }

    pub fn read_memory(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let memory = self.memory.context("binary module exports no memory")?;
        let store = self
            .store
            .try_borrow()
            .map_err(|_| anyhow!("binary module {:?} is running", self.module_id))?;
        let mut buf = vec![0u8; len];
        memory
            .read(&*store, offset, &mut buf)
            .with_context(|| format!("read {len} bytes at {offset}"))?;
        Ok(buf)
    }

    pub fn write_memory(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let memory = self.memory.context("binary module exports no memory")?;
        let mut store = self
            .store
            .try_borrow_mut()
            .map_err(|_| anyhow!("binary module {:?} is running", self.module_id))?;
        memory
            .write(&mut *store, offset, bytes)
            .with_context(|| format!("write {} bytes at {offset}", bytes.len()))
    }

    /// The export `name` as a callable value for code units.
    pub fn host_fn(self: &Rc<Self>, name: &str) -> Option<HostFn> {
        if !self.contains(name) {
            return None;
        }
        let table = Rc::clone(self);
        let name = name.to_owned();
        Some(Rc::new(move |_call: &mut HostCall<'_>, args: &[Value]| {
            table.call(&name, args)
        }))
    }
}

impl fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportTable")
            .field("module_id", &self.module_id)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::registry::loader;

    const GREETER: &str = r#"
      (module
        (import "./host.js" "log" (func $log (param i32 i32)))
        (import "./host.js" "scale" (func $scale (param f64) (result f64)))
        (memory (export "memory") 1)
        (data (i32.const 16) "hello")
        (func (export "greet") (call $log (i32.const 16) (i32.const 5)))
        (func (export "half") (param f64) (result f64)
          (call $scale (local.get 0))))
    "#;

    fn imports() -> ImportTable {
        let mut table = ImportTable::new();
        for name in ["log", "scale"] {
            table.insert(
                "./host.js",
                name,
                ImportBinding {
                    unit: "host".to_string(),
                    function: name.to_string(),
                },
            );
        }
        table
    }

    fn host_registry(logged: Rc<RefCell<Vec<String>>>) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        registry.register(
            "host",
            loader(move |ctx| {
                let logged = logged.clone();
                ctx.exports().set(
                    "log",
                    Value::function(move |call, args| {
                        let text = call.read_str(args[0].as_i32()?, args[1].as_i32()?)?;
                        logged.borrow_mut().push(text);
                        Ok(Vec::new())
                    }),
                );
                ctx.exports().set(
                    "scale",
                    Value::function(|_call, args| Ok(vec![Value::F64(args[0].as_f64()? / 2.0)])),
                );
                Ok(())
            }),
        );
        registry
    }

    #[test]
    fn preamble_is_checked() {
        assert!(check_preamble(b"\0asm\x01\0\0\0").is_ok());
        assert!(check_preamble(b"\0asm").is_err());
        assert!(check_preamble(b"<html>\n\n").is_err());
        assert!(check_preamble(b"\0asm\x0d\0\x01\0").is_err());
    }

    #[test]
    fn imports_bridge_into_host_units() {
        let logged = Rc::new(RefCell::new(Vec::new()));
        let registry = host_registry(logged.clone());
        registry.require("host").unwrap();

        let engine = WasmEngine::new();
        let module = engine.compile(&wat::parse_str(GREETER).unwrap()).unwrap();
        let table = engine
            .instantiate(&module, &imports(), &registry, "greeter.wasm")
            .unwrap();

        assert_eq!(table.names(), vec!["greet".to_string(), "half".to_string()]);
        table.call("greet", &[]).unwrap();
        assert_eq!(*logged.borrow(), vec!["hello".to_string()]);
        assert_eq!(table.call("half", &[Value::F64(5.0)]).unwrap(), vec![Value::F64(2.5)]);
        assert_eq!(table.read_memory(16, 5).unwrap(), b"hello");
    }

    #[test]
    fn missing_import_fails_before_instantiation() {
        let registry = host_registry(Rc::new(RefCell::new(Vec::new())));
        let mut partial = ImportTable::new();
        partial.insert(
            "./host.js",
            "log",
            ImportBinding {
                unit: "host".to_string(),
                function: "log".to_string(),
            },
        );
        let engine = WasmEngine::new();
        let module = engine.compile(&wat::parse_str(GREETER).unwrap()).unwrap();
        let err = engine
            .instantiate(&module, &partial, &registry, "greeter.wasm")
            .unwrap_err();
        assert!(format!("{err:#}").contains("\"scale\""), "err={err:#}");
    }

    #[test]
    fn uninitialized_host_interface_traps() {
        let registry = host_registry(Rc::new(RefCell::new(Vec::new())));
        let engine = WasmEngine::new();
        let module = engine.compile(&wat::parse_str(GREETER).unwrap()).unwrap();
        let table = engine
            .instantiate(&module, &imports(), &registry, "greeter.wasm")
            .unwrap();
        let err = table.call("greet", &[]).unwrap_err();
        assert!(format!("{err:?}").contains("not been initialized"), "err={err:?}");
    }

    #[test]
    fn streaming_compile_rejects_bad_header_early() {
        let engine = WasmEngine::new();
        let payload = Payload::Stream(
            futures::stream::iter(vec![
                Ok(b"<!doctype".to_vec()),
                Err(anyhow!("never read")),
            ])
            .boxed_local(),
        );
        let err = futures::executor::block_on(engine.compile_streaming(payload)).unwrap_err();
        assert!(err.to_string().contains("bad magic"), "err={err:#}");
    }
}

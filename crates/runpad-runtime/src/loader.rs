use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runpad_pipeline::{
    ConsoleWriter, EntryKind, EntryPoint, ExecutionError, Invocation, LoadError, Loader, Program,
};
use wasmtime::{Engine, FuncType, Module, Precompiled, Store, Trap, Val, ValType};
use wasmtime_wasi::I32Exit;

use crate::error::RuntimeError;
use crate::runtime_context::{RuntimeContext, WASI_MODULE};
use crate::wasistate::{ConsoleStdout, WasiState};

const WASM_MAGIC: &[u8] = b"\0asm";

/// Shape of a runnable export: `() -> ()`, `() -> i32`, `(i32, i32) -> ()` or
/// `(i32, i32) -> i32`. Returns whether the export takes `(argc, argv)`.
pub(crate) fn entry_signature(ty: &FuncType) -> Option<bool> {
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    let takes_args = match params.as_slice() {
        [] => false,
        [ValType::I32, ValType::I32] => true,
        _ => return None,
    };
    match results.as_slice() {
        [] | [ValType::I32] => Some(takes_args),
        _ => None,
    }
}

/// Loads modules produced by [`WatCompiler`](crate::compiler::WatCompiler),
/// or raw WebAssembly binaries.
pub struct WasmLoader {
    runtime: Arc<RuntimeContext>,
}

impl WasmLoader {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }

    fn load_module(&self, binary: &[u8]) -> Result<Module, LoadError> {
        match Engine::detect_precompiled(binary) {
            Some(Precompiled::Module) => {
                if !self.runtime.issued(binary) {
                    return Err(LoadError::Incompatible(
                        "precompiled module was not produced by this runtime".into(),
                    ));
                }
                // SAFETY: the bytes hash to an artifact this runtime serialized
                // itself with the same engine, which satisfies the contract of
                // `deserialize`.
                unsafe { Module::deserialize(&self.runtime.engine, binary) }
                    .map_err(|e| LoadError::Incompatible(format!("{e:#}")))
            }
            Some(Precompiled::Component) => Err(LoadError::InvalidBinary(
                "components are not supported".into(),
            )),
            None if binary.starts_with(WASM_MAGIC) => {
                Module::from_binary(&self.runtime.engine, binary)
                    .map_err(|e| LoadError::InvalidBinary(format!("{e:#}")))
            }
            None => Err(LoadError::InvalidBinary(
                "not a WebAssembly module".into(),
            )),
        }
    }
}

impl Loader for WasmLoader {
    fn load<'a>(
        &'a self,
        binary: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Program>, LoadError>> + Send + 'a>> {
        Box::pin(async move {
            let module = self.load_module(binary)?;
            tracing::debug!(
                imports = module.imports().len(),
                exports = module.exports().len(),
                "Module loaded"
            );
            Ok(Box::new(WasmProgram {
                runtime: Arc::clone(&self.runtime),
                module,
            }) as Box<dyn Program>)
        })
    }
}

/// A loaded module. Every run instantiates it in a fresh store.
pub struct WasmProgram {
    runtime: Arc<RuntimeContext>,
    module: Module,
}

impl WasmProgram {
    async fn run(
        &self,
        entry: &str,
        args: Option<Vec<String>>,
        stdout: ConsoleWriter,
    ) -> Result<(), ExecutionError> {
        let args = args.unwrap_or_default();
        let stdout = ConsoleStdout::new(stdout, self.runtime.stdout_capacity());
        let capacity = stdout.capacity();
        let mut store = Store::new(&self.runtime.engine, WasiState::new(entry, &args, stdout));
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        let outcome = self.call(&mut store, entry, args.len()).await;
        if store.data().stdout_exceeded() {
            return Err(ExecutionError::Fault(format!(
                "stdout exceeded {capacity} bytes"
            )));
        }
        outcome
    }

    async fn call(
        &self,
        store: &mut Store<WasiState>,
        entry: &str,
        argc: usize,
    ) -> Result<(), ExecutionError> {
        let mut linker = self.runtime.linker.clone();
        for import in self.module.imports() {
            let name = import.module();
            if name == WASI_MODULE || linker.get(&mut *store, name, import.name()).is_some() {
                continue;
            }
            let library = self
                .runtime
                .library(name)
                .ok_or_else(|| RuntimeError::LibraryNotFound(name.to_string()))?;
            linker
                .module_async(&mut *store, name, &library)
                .await
                .map_err(|e| RuntimeError::LinkFailed(format!("{name}: {e:#}")))?;
        }

        let instance = linker
            .instantiate_async(&mut *store, &self.module)
            .await
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{e:#}")))?;
        let func = instance
            .get_func(&mut *store, entry)
            .ok_or_else(|| RuntimeError::InvocationFailed(format!("no '{entry}' export")))?;

        let ty = func.ty(&*store);
        let params = match entry_signature(&ty) {
            Some(true) => vec![Val::I32(argc as i32), Val::I32(0)],
            Some(false) => Vec::new(),
            None => {
                return Err(RuntimeError::InvocationFailed(format!(
                    "'{entry}' has an unsupported signature"
                ))
                .into());
            }
        };
        let mut results = vec![Val::I32(0); ty.results().len()];

        tracing::debug!(entry, "Calling entry point");
        match func.call_async(&mut *store, &params, &mut results).await {
            Ok(()) => match results.first() {
                Some(Val::I32(0)) | None => Ok(()),
                Some(Val::I32(code)) => Err(ExecutionError::Fault(format!(
                    "'{entry}' returned exit status {code}"
                ))),
                Some(other) => Err(ExecutionError::Fault(format!(
                    "'{entry}' returned unexpected value {other:?}"
                ))),
            },
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => Ok(()),
                Some(I32Exit(code)) => Err(ExecutionError::Fault(format!(
                    "exited with status {code}"
                ))),
                None => Err(ExecutionError::Fault(match e.downcast_ref::<Trap>() {
                    Some(trap) => trap.to_string(),
                    None => format!("{e:#}"),
                })),
            },
        }
    }
}

impl Program for WasmProgram {
    /// Function exports with a runnable signature. All of them are called
    /// asynchronously.
    fn entry_points(&self) -> Vec<EntryPoint> {
        self.module
            .exports()
            .filter_map(|export| {
                let ty = export.ty().func()?.clone();
                let takes_args = entry_signature(&ty)?;
                let entry = EntryPoint::new(export.name(), EntryKind::Async);
                Some(if takes_args { entry.with_args() } else { entry })
            })
            .collect()
    }

    fn invoke<'a>(
        &'a mut self,
        entry: &EntryPoint,
        args: Option<Vec<String>>,
        stdout: ConsoleWriter,
    ) -> Invocation<'a> {
        let name = entry.name.clone();
        Invocation::Pending(Box::pin(async move { self.run(&name, args, stdout).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> WasmLoader {
        WasmLoader::new(Arc::new(RuntimeContext::new().unwrap()))
    }

    #[tokio::test]
    async fn rejects_foreign_bytes() {
        let err = loader().load(b"RUNPAD-SCRIPT\n{}").await.err().unwrap();
        assert!(matches!(err, LoadError::InvalidBinary(_)));
    }

    #[tokio::test]
    async fn loads_raw_empty_module() {
        let program = loader()
            .load(b"\0asm\x01\0\0\0")
            .await
            .unwrap();
        assert!(program.entry_points().is_empty());
    }

    #[tokio::test]
    async fn refuses_artifacts_from_another_runtime() {
        let other = RuntimeContext::new().unwrap();
        let module = Module::new(&other.engine, "(module)").unwrap();
        let bytes = other.serialize(&module).unwrap();

        let err = loader().load(&bytes).await.err().unwrap();
        assert!(matches!(err, LoadError::Incompatible(_)));
    }

    #[tokio::test]
    async fn lists_runnable_exports() {
        let loader = loader();
        let module = Module::new(
            &loader.runtime.engine,
            r#"(module
  (func (export "_start"))
  (func (export "main") (param i32 i32) (result i32) (i32.const 0))
  (func (export "helper") (param i64))
  (memory (export "memory") 1))"#,
        )
        .unwrap();
        let bytes = loader.runtime.serialize(&module).unwrap();

        let program = loader.load(&bytes).await.unwrap();
        let entries = program.entry_points();
        assert_eq!(entries, vec![
            EntryPoint::new("_start", EntryKind::Async),
            EntryPoint::new("main", EntryKind::Async).with_args(),
        ]);
    }
}

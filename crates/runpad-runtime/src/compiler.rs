use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runpad_pipeline::loader::DESIGNATED_ENTRY_POINTS;
use runpad_pipeline::{
    CompileError, CompilerBackend, Diagnostic, Reference, ReferenceSet, TargetKind,
};
use runpad_pipeline::types::CompileOutput;
use wasmtime::{ExternType, FuncType, Module};

use crate::loader::entry_signature;
use crate::runtime_context::{RuntimeContext, WASI_MODULE};

/// Prints "Hello World" through WASI `fd_write`.
pub const HELLO_WORLD_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "Hello World\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 12))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

/// Compiles WebAssembly text (or binary) modules with Wasmtime.
///
/// The artifact is a serialized Wasmtime module, loadable by
/// [`WasmLoader`](crate::loader::WasmLoader) on the same [`RuntimeContext`].
pub struct WatCompiler {
    runtime: Arc<RuntimeContext>,
}

impl WatCompiler {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }
}

impl CompilerBackend for WatCompiler {
    fn compile<'a>(
        &'a self,
        source: &'a str,
        references: &'a ReferenceSet,
        _target: TargetKind,
    ) -> Pin<Box<dyn Future<Output = Result<CompileOutput, CompileError>> + Send + 'a>> {
        Box::pin(async move {
            // Cranelift is CPU-bound; keep it off the async workers.
            let engine = self.runtime.engine.clone();
            let text = source.to_string();
            let compiled = tokio::task::spawn_blocking(move || Module::new(&engine, text))
                .await
                .map_err(|e| CompileError::Internal(format!("compiler task failed: {e}")))?;

            let module = match compiled {
                Ok(module) => module,
                Err(e) => {
                    let diagnostic = diagnostic_from_error(&e);
                    tracing::debug!(%diagnostic, "Module rejected");
                    return Ok(CompileOutput {
                        binary: Vec::new(),
                        diagnostics: vec![diagnostic],
                    });
                }
            };

            let mut diagnostics = check_imports(&self.runtime, &module, references);
            if !has_designated_entry(&module) {
                diagnostics.push(Diagnostic::warning(format!(
                    "module exports none of {} with a runnable signature",
                    DESIGNATED_ENTRY_POINTS.join(", ")
                )));
            }
            if diagnostics.iter().any(Diagnostic::is_error) {
                return Ok(CompileOutput {
                    binary: Vec::new(),
                    diagnostics,
                });
            }

            let binary = self
                .runtime
                .serialize(&module)
                .map_err(|e| CompileError::Internal(e.to_string()))?;
            Ok(CompileOutput {
                binary,
                diagnostics,
            })
        })
    }

    /// Compile a library module and register it for linking under its
    /// module name.
    fn parse_reference(&self, id: &str, bytes: Vec<u8>) -> Result<Reference, CompileError> {
        let module =
            Module::new(&self.runtime.engine, &bytes).map_err(|e| CompileError::InvalidReference {
                id: id.to_string(),
                reason: format!("{e:#}"),
            })?;

        let exports = module
            .exports()
            .filter(|e| matches!(e.ty(), ExternType::Func(_)))
            .map(|e| e.name().to_string())
            .collect();
        let reference = Reference::new(id, exports);
        self.runtime
            .register_library(reference.module_name(), module);
        Ok(reference)
    }

    fn warm_up_source(&self) -> Option<&str> {
        Some(HELLO_WORLD_WAT)
    }
}

/// Every import must come from WASI or from an export of a loaded reference,
/// with the type the provider declares.
fn check_imports(
    runtime: &RuntimeContext,
    module: &Module,
    references: &ReferenceSet,
) -> Vec<Diagnostic> {
    module
        .imports()
        .filter_map(|import| {
            let (module_name, name) = (import.module(), import.name());
            let provided = if module_name == WASI_MODULE {
                runtime
                    .wasi_function(name)
                    .map(|ty| ExternType::Func(ty.clone()))
            } else if references
                .by_module_name(module_name)
                .is_some_and(|r| r.exports_symbol(name))
            {
                runtime
                    .library(module_name)
                    .and_then(|library| library.get_export(name))
            } else {
                None
            };

            let Some(provided) = provided else {
                return Some(Diagnostic::error(format!(
                    "unresolved import `{module_name}::{name}`"
                )));
            };
            match (import.ty(), provided) {
                (ExternType::Func(wanted), ExternType::Func(found)) if found.matches(&wanted) => {
                    None
                }
                (ExternType::Func(wanted), ExternType::Func(found)) => Some(Diagnostic::error(
                    format!(
                        "import `{module_name}::{name}` expects {} but the provider has {}",
                        signature(&wanted),
                        signature(&found)
                    ),
                )),
                _ => Some(Diagnostic::error(format!(
                    "import `{module_name}::{name}` is not a function"
                ))),
            }
        })
        .collect()
}

/// `(i32, i32) -> i32` style rendering.
fn signature(ty: &FuncType) -> String {
    let list = |types: Vec<String>| types.join(", ");
    let params = list(ty.params().map(|t| t.to_string()).collect());
    let results = list(ty.results().map(|t| t.to_string()).collect());
    format!("({params}) -> ({results})")
}

fn has_designated_entry(module: &Module) -> bool {
    module.exports().any(|export| {
        DESIGNATED_ENTRY_POINTS.contains(&export.name())
            && matches!(export.ty(), ExternType::Func(ty) if entry_signature(&ty).is_some())
    })
}

/// Turn a parse or validation error into a diagnostic. Text parse errors
/// carry a `--> file:line:col` marker.
fn diagnostic_from_error(e: &anyhow::Error) -> Diagnostic {
    let rendered = format!("{e:#}");
    let message = rendered.lines().next().unwrap_or("invalid module").trim();
    let diagnostic = Diagnostic::error(message);
    match rendered.lines().find_map(parse_location) {
        Some((line, column)) => diagnostic.at(line, column),
        None => diagnostic,
    }
}

fn parse_location(line: &str) -> Option<(u32, u32)> {
    let (_, rest) = line.split_once("--> ")?;
    let mut parts = rest.trim().rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    Some((line, column))
}

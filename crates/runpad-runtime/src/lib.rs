//! Embedded WebAssembly backend for runpad.
//!
//! Provides [`WatCompiler`] and [`WasmLoader`], the Wasmtime-based
//! implementations of the pipeline's compiler and loader seams. Both share a
//! [`RuntimeContext`], so reference libraries registered during
//! initialization are linked into every run.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runpad_pipeline::BuildManager;
//! use runpad_pipeline::references::StaticReferenceSource;
//! use runpad_runtime::{RuntimeContext, WasmLoader, WatCompiler};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let runtime = Arc::new(RuntimeContext::new()?);
//! let manager = BuildManager::new(
//!     Arc::new(WatCompiler::new(Arc::clone(&runtime))),
//!     Arc::new(WasmLoader::new(runtime)),
//!     Arc::new(StaticReferenceSource::new()),
//! );
//!
//! let cancel = CancellationToken::new();
//! manager.initialize(&cancel).await?;
//! let (_, run) = manager
//!     .build_and_run(runpad_runtime::compiler::HELLO_WORLD_WAT, &cancel)
//!     .await;
//! assert_eq!(run.unwrap().output, "Hello World\n");
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod error;
pub mod loader;
pub mod runtime_context;
pub mod wasistate;

pub use compiler::WatCompiler;
pub use error::RuntimeError;
pub use loader::{WasmLoader, WasmProgram};
pub use runtime_context::RuntimeContext;

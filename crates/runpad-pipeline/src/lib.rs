//! Build orchestration for runpad.
//!
//! [`BuildManager`] fetches a set of reference modules, compiles submitted
//! source against them through a pluggable [`CompilerBackend`], and runs the
//! result in-process with standard output captured. Progress is published to
//! a [`StateObserver`] on every transition.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runpad_pipeline::script::{ScriptCompiler, ScriptLoader};
//! use runpad_pipeline::{BuildManager, RunpadConfig, TracingObserver};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunpadConfig::load_default()?;
//! let manager = BuildManager::new(
//!     Arc::new(ScriptCompiler::new()),
//!     Arc::new(ScriptLoader::new()),
//!     config.build_reference_source()?,
//! )
//! .with_observer(Arc::new(TracingObserver))
//! .with_warm_up(config.build.warm_up);
//!
//! let cancel = CancellationToken::new();
//! let report = manager.initialize(&cancel).await?;
//! if !report.is_complete() {
//!     eprintln!("{} references unavailable", report.failures.len());
//! }
//!
//! let (build, run) = manager.build_and_run("println Hello World", &cancel).await;
//! for diagnostic in &build.diagnostics {
//!     eprintln!("{diagnostic}");
//! }
//! if let Some(run) = run {
//!     print!("{}", run.output);
//! }
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod config;
pub mod console;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod observer;
pub mod orchestrator;
pub mod references;
pub mod script;
pub mod state;
pub mod types;

pub use compiler::CompilerBackend;
pub use config::RunpadConfig;
pub use console::{CaptureBuffer, Console, ConsoleWriter, Redirect};
pub use error::{BuildError, CompileError, ConfigError, ExecutionError, FetchError, LoadError};
pub use loader::{EntryKind, EntryPoint, Invocation, Loader, Program, select_entry_point};
pub use metrics::{BuildMetrics, MetricsSnapshot};
pub use observer::{NoopObserver, RecordingObserver, StateObserver, TracingObserver};
pub use orchestrator::BuildManager;
pub use references::{
    InitializeReport, Reference, ReferenceFailure, ReferenceManifest, ReferenceSet,
    ReferenceSource,
};
pub use state::{BuildManagerState, Phase};
pub use types::{BuildResult, Diagnostic, ExecutionResult, Location, Severity, TargetKind};

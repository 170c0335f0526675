use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::compiler::CompilerBackend;
use crate::console::{Console, ConsoleWriter};
use crate::error::{BuildError, CompileError, ExecutionError};
use crate::loader::{Invocation, Loader, Program, select_entry_point};
use crate::metrics::BuildMetrics;
use crate::observer::{NoopObserver, StateObserver};
use crate::references::{
    InitializeReport, ModuleEntry, Reference, ReferenceFailure, ReferenceSet, ReferenceSource,
    verify_integrity,
};
use crate::state::{BuildManagerState, Phase, percent_of};
use crate::types::{BuildResult, CompileOutput, ExecutionResult, TargetKind};

const DOWNLOADING_MESSAGE: &str = "Downloading framework metadata";
const LOADED_MESSAGE: &str = "Framework metadata loaded";
const WARM_UP_MESSAGE: &str = "Warming up compiler";
const BUILDING_MESSAGE: &str = "Building";
const EXECUTING_MESSAGE: &str = "Executing";

/// Compiles submitted source and runs the result in-process.
///
/// The manager sequences three operations:
/// 1. `initialize` fetches the reference manifest and every listed module,
///    then warms the compiler up (call once)
/// 2. `build` compiles source against the reference set
/// 3. `run` loads a binary and invokes its entry point with stdout captured
///
/// `build_and_run` chains 2 and 3 behind the Building → Executing → Idle
/// state machine and is the entry point for repeated use.
///
/// # Concurrency
///
/// All operations on one manager are serialized by a session lock held for
/// the operation's full duration. Runs additionally hold the console's
/// redirect lock, which is shared by every manager using the same
/// [`Console`].
pub struct BuildManager {
    compiler: Arc<dyn CompilerBackend>,
    loader: Arc<dyn Loader>,
    source: Arc<dyn ReferenceSource>,
    observer: Arc<dyn StateObserver>,
    console: Console,
    metrics: Arc<BuildMetrics>,
    warm_up: bool,
    state: Mutex<BuildManagerState>,
    /// Guards the reference set and serializes operations.
    session: tokio::sync::Mutex<ReferenceSet>,
}

impl BuildManager {
    pub fn new(
        compiler: Arc<dyn CompilerBackend>,
        loader: Arc<dyn Loader>,
        source: Arc<dyn ReferenceSource>,
    ) -> Self {
        Self {
            compiler,
            loader,
            source,
            observer: Arc::new(NoopObserver),
            console: Console::process(),
            metrics: Arc::new(BuildMetrics::new()),
            warm_up: true,
            state: Mutex::new(BuildManagerState::new()),
            session: tokio::sync::Mutex::new(ReferenceSet::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use `console` as the stdout target instead of the process console.
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<BuildMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Skip the warm-up compile during `initialize`.
    pub fn with_warm_up(mut self, enabled: bool) -> Self {
        self.warm_up = enabled;
        self
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> BuildManagerState {
        self.lock_state().clone()
    }

    pub fn metrics(&self) -> &BuildMetrics {
        &self.metrics
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Number of references loaded so far. Waits for any running operation.
    pub async fn reference_count(&self) -> usize {
        self.session.lock().await.len()
    }

    /// Fetch the reference set and warm the compiler up.
    ///
    /// Modules that cannot be fetched or parsed are skipped and listed in the
    /// returned report. Only a missing manifest, a failed warm-up or
    /// cancellation make this return `Err`; the state is reset to Idle on
    /// every path.
    pub async fn initialize(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InitializeReport, BuildError> {
        let mut references = self.session.lock().await;
        let started = Instant::now();

        let outcome = self.initialize_locked(&mut references, cancel).await;
        self.publish(BuildManagerState::reset_to_idle).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(report) => tracing::info!(
                loaded = report.loaded.len(),
                failed = report.failures.len(),
                elapsed_ms,
                "Initialization complete"
            ),
            Err(e) => tracing::error!(
                error = %e,
                loaded = references.len(),
                elapsed_ms,
                "Initialization failed"
            ),
        }
        outcome
    }

    async fn initialize_locked(
        &self,
        references: &mut ReferenceSet,
        cancel: &CancellationToken,
    ) -> Result<InitializeReport, BuildError> {
        self.publish(|s| s.enter(Phase::Initializing, DOWNLOADING_MESSAGE))
            .await;

        let manifest = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            manifest = self.source.fetch_manifest() => manifest.map_err(BuildError::Manifest)?,
        };
        let total = manifest.modules.len();
        tracing::info!(modules = total, "Reference manifest fetched");

        let mut report = InitializeReport::default();
        for (index, entry) in manifest.modules.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let percent = percent_of(index, total);
            self.publish(|s| s.progress(percent, entry.id.clone())).await;

            if references.contains(&entry.id) {
                tracing::debug!(id = %entry.id, "Reference already loaded");
                continue;
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                fetched = self.fetch_reference(entry) => fetched,
            };
            match fetched {
                Ok(reference) => {
                    tracing::debug!(id = %entry.id, exports = reference.exports().len(), "Reference loaded");
                    references.push(reference);
                    report.loaded.push(entry.id.clone());
                    self.metrics.record_reference_loaded();
                }
                Err(reason) => {
                    tracing::warn!(id = %entry.id, %reason, "Reference unavailable, continuing without it");
                    report.failures.push(ReferenceFailure {
                        id: entry.id.clone(),
                        reason,
                    });
                    self.metrics.record_reference_failure();
                }
            }
            tokio::task::yield_now().await;
        }
        self.publish(|s| s.progress(100, LOADED_MESSAGE)).await;

        if self.warm_up {
            self.warm_up_compiler(references, cancel).await?;
        }
        Ok(report)
    }

    async fn fetch_reference(&self, entry: &ModuleEntry) -> Result<Reference, String> {
        let bytes = self
            .source
            .fetch_module(&entry.id)
            .await
            .map_err(|e| e.to_string())?;
        verify_integrity(entry, &bytes).map_err(|e| e.to_string())?;
        self.compiler
            .parse_reference(&entry.id, bytes)
            .map_err(|e| e.to_string())
    }

    /// One throwaway compile of the backend's canned program. Failures whose
    /// kind is expected on first use are tolerated; anything else is fatal.
    async fn warm_up_compiler(
        &self,
        references: &ReferenceSet,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let Some(source) = self.compiler.warm_up_source() else {
            return Ok(());
        };

        for _ in 0..2 {
            self.publish(|s| s.progress(100, WARM_UP_MESSAGE)).await;
            tokio::task::yield_now().await;
        }

        match self.compile_guarded(source, references, cancel).await {
            Ok(output) => {
                tracing::debug!(diagnostics = output.diagnostics.len(), "Warm-up compile finished");
                Ok(())
            }
            Err(CompileError::Cancelled) => Err(BuildError::Cancelled),
            Err(e) if e.is_expected_during_warm_up() => {
                tracing::debug!(error = %e, "Warm-up compile hit expected first-use failure");
                Ok(())
            }
            Err(e) => Err(BuildError::WarmUp(e)),
        }
    }

    /// Compile `source` against the current reference set.
    pub async fn build(&self, source: &str, cancel: &CancellationToken) -> BuildResult {
        let references = self.session.lock().await;
        self.build_locked(&references, source, cancel).await
    }

    async fn build_locked(
        &self,
        references: &ReferenceSet,
        source: &str,
        cancel: &CancellationToken,
    ) -> BuildResult {
        self.metrics.record_build_started();
        let started = Instant::now();
        let outcome = self.compile_guarded(source, references, cancel).await;
        let result = BuildResult::from_outcome(outcome, started.elapsed());

        self.metrics
            .record_build_finished(result.success, result.duration);
        if let Some(e) = &result.exception {
            tracing::warn!(error = %e, "Compiler backend failed");
        }
        tracing::info!(
            success = result.success,
            errors = result.errors().count(),
            warnings = result.warnings().count(),
            duration_ms = result.duration.as_millis() as u64,
            "Build finished"
        );
        result
    }

    async fn compile_guarded(
        &self,
        source: &str,
        references: &ReferenceSet,
        cancel: &CancellationToken,
    ) -> Result<CompileOutput, CompileError> {
        let attempt = AssertUnwindSafe(self.compiler.compile(
            source,
            references,
            TargetKind::Executable,
        ))
        .catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CompileError::Cancelled),
            outcome = attempt => outcome
                .unwrap_or_else(|panic| Err(CompileError::Internal(panic_message(panic)))),
        }
    }

    /// Load `binary` and run its entry point with stdout captured.
    pub async fn run(&self, binary: &[u8], cancel: &CancellationToken) -> ExecutionResult {
        let _session = self.session.lock().await;
        self.run_locked(binary, cancel).await
    }

    async fn run_locked(&self, binary: &[u8], cancel: &CancellationToken) -> ExecutionResult {
        let started = Instant::now();

        let loaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            loaded = self.loader.load(binary) => loaded.map_err(ExecutionError::from),
        };
        let mut program = match loaded {
            Ok(program) => program,
            Err(e) => {
                return self.finish_run(ExecutionResult {
                    duration: started.elapsed(),
                    output: String::new(),
                    exception: Some(e),
                });
            }
        };

        let redirect = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.finish_run(ExecutionResult {
                    duration: started.elapsed(),
                    output: String::new(),
                    exception: Some(ExecutionError::Cancelled),
                });
            }
            redirect = self.console.redirect() => redirect,
        };

        let outcome = invoke_entry_point(program.as_mut(), redirect.writer(), cancel).await;
        let output = redirect.captured();
        drop(redirect);

        self.finish_run(ExecutionResult {
            duration: started.elapsed(),
            output,
            exception: outcome.err(),
        })
    }

    fn finish_run(&self, result: ExecutionResult) -> ExecutionResult {
        self.metrics
            .record_run_finished(result.exception.is_some(), result.duration);
        match &result.exception {
            Some(e) => tracing::warn!(
                error = %e,
                output_bytes = result.output.len(),
                duration_ms = result.duration.as_millis() as u64,
                "Run failed"
            ),
            None => tracing::info!(
                output_bytes = result.output.len(),
                duration_ms = result.duration.as_millis() as u64,
                "Run finished"
            ),
        }
        result
    }

    /// Build `source` and, if it compiled cleanly, run it.
    ///
    /// Observers see Building, then Executing (only when the build
    /// succeeded), then Idle. Failures are reported inside the returned
    /// results; the execution result is `None` when the build failed.
    pub async fn build_and_run(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> (BuildResult, Option<ExecutionResult>) {
        let references = self.session.lock().await;
        if self.lock_state().phase == Phase::NotInitialized {
            tracing::warn!("Build requested before initialize; compiling without references");
        }

        self.transition(Phase::Building, BUILDING_MESSAGE).await;
        let build = self.build_locked(&references, source, cancel).await;

        let execution = match build.binary.as_deref() {
            Some(binary) if build.success => {
                self.transition(Phase::Executing, EXECUTING_MESSAGE).await;
                Some(self.run_locked(binary, cancel).await)
            }
            _ => None,
        };

        self.publish(BuildManagerState::reset_to_idle).await;
        tokio::task::yield_now().await;
        (build, execution)
    }

    /// Enter `phase`, notify, and give the observer a chance to render it
    /// before the next heavy operation starts.
    async fn transition(&self, phase: Phase, message: &str) {
        self.publish(|s| s.enter(phase, message)).await;
        tokio::task::yield_now().await;
    }

    async fn publish(&self, update: impl FnOnce(&mut BuildManagerState)) {
        let snapshot = {
            let mut state = self.lock_state();
            update(&mut state);
            state.clone()
        };
        self.observer.on_state_changed(&snapshot).await;
    }

    fn lock_state(&self) -> MutexGuard<'_, BuildManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Select the entry point and drive it to completion. Panics inside the
/// program are captured as faults.
async fn invoke_entry_point(
    program: &mut dyn Program,
    stdout: ConsoleWriter,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let entry = select_entry_point(&program.entry_points())?;
    let args = entry.accepts_args.then(Vec::new);
    tracing::debug!(entry = %entry.name, kind = ?entry.kind, "Invoking entry point");

    if cancel.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }

    let invocation = std::panic::catch_unwind(AssertUnwindSafe(move || {
        // Move the borrow in so the invocation can hold on to it.
        let program = program;
        program.invoke(&entry, args, stdout)
    }))
    .map_err(|panic| ExecutionError::Fault(panic_message(panic)))?;

    match invocation {
        Invocation::Returned(result) => result,
        Invocation::Pending(pending) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = AssertUnwindSafe(pending).catch_unwind() => result
                .unwrap_or_else(|panic| Err(ExecutionError::Fault(panic_message(panic)))),
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

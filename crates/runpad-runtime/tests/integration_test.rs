//! End-to-end tests: WebAssembly text goes through the build manager, is
//! compiled by Wasmtime and runs with stdout captured.

use std::sync::Arc;
use std::time::Duration;

use runpad_pipeline::references::StaticReferenceSource;
use runpad_pipeline::{
    BuildManager, CaptureBuffer, Console, ExecutionError, Phase, RecordingObserver, RunpadConfig,
};
use runpad_runtime::compiler::HELLO_WORLD_WAT;
use runpad_runtime::{RuntimeContext, WasmLoader, WatCompiler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const MATHLIB_WAT: &str = r#"(module
  (func (export "double") (param i32) (result i32)
    (i32.mul (local.get 0) (i32.const 2))))"#;

/// Writes "partial" and then traps.
const PARTIAL_THEN_TRAP_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "partial")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 7))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
    unreachable))"#;

/// Writes "partial" and then spins forever.
const PARTIAL_THEN_SPIN_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "partial")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 7))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
    (loop (br 0))))"#;

/// Logs go to the test writer; filter with `RUNPAD_LOG=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("RUNPAD_LOG"))
        .with_test_writer()
        .try_init();
}

struct Fixture {
    manager: BuildManager,
    runtime: Arc<RuntimeContext>,
    observer: Arc<RecordingObserver>,
    console: Console,
    host: CaptureBuffer,
}

fn fixture(source: StaticReferenceSource) -> Fixture {
    init_tracing();
    let runtime = Arc::new(RuntimeContext::new().unwrap());
    let observer = Arc::new(RecordingObserver::new());
    let host = CaptureBuffer::default();
    let console = Console::new(host.clone());
    let manager = BuildManager::new(
        Arc::new(WatCompiler::new(Arc::clone(&runtime))),
        Arc::new(WasmLoader::new(Arc::clone(&runtime))),
        Arc::new(source),
    )
    .with_observer(observer.clone())
    .with_console(console.clone());
    Fixture {
        manager,
        runtime,
        observer,
        console,
        host,
    }
}

#[tokio::test]
async fn hello_world_end_to_end() {
    let f = fixture(StaticReferenceSource::new());
    let cancel = CancellationToken::new();
    f.manager.initialize(&cancel).await.unwrap();
    f.observer.take();

    let (build, run) = f.manager.build_and_run(HELLO_WORLD_WAT, &cancel).await;

    assert!(build.success, "{:?}", build.diagnostics);
    let run = run.unwrap();
    assert_eq!(run.output, "Hello World\n");
    assert!(run.exception.is_none());
    let phases: Vec<Phase> = f.observer.take().iter().map(|s| s.phase).collect();
    assert_eq!(phases, vec![Phase::Building, Phase::Executing, Phase::Idle]);
    assert_eq!(f.host.contents(), "");
}

#[tokio::test]
async fn syntax_error_is_reported_and_not_run() {
    let f = fixture(StaticReferenceSource::new());
    let (build, run) = f
        .manager
        .build_and_run("(module (func (export \"_start\") (nope)))", &CancellationToken::new())
        .await;

    assert!(!build.success);
    assert!(build.binary.is_none());
    assert!(build.errors().next().unwrap().location.is_some());
    assert!(run.is_none());
}

#[tokio::test]
async fn trap_keeps_output_written_before_it() {
    let f = fixture(StaticReferenceSource::new());
    let (_, run) = f
        .manager
        .build_and_run(PARTIAL_THEN_TRAP_WAT, &CancellationToken::new())
        .await;

    let run = run.unwrap();
    assert_eq!(run.output, "partial");
    match run.exception {
        Some(ExecutionError::Fault(message)) => assert!(message.contains("unreachable"), "{message}"),
        other => panic!("expected a fault, got {other:?}"),
    }
    assert!(!f.console.is_redirected());
}

#[tokio::test]
async fn exit_status_decides_success() {
    let f = fixture(StaticReferenceSource::new());
    let cancel = CancellationToken::new();
    let exit_with = |code: i32| {
        format!(
            r#"(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const {code}))))"#
        )
    };

    let (_, ok) = f.manager.build_and_run(&exit_with(0), &cancel).await;
    assert!(ok.unwrap().succeeded());

    let (_, failed) = f.manager.build_and_run(&exit_with(3), &cancel).await;
    assert_eq!(
        failed.unwrap().exception,
        Some(ExecutionError::Fault("exited with status 3".into()))
    );
}

#[tokio::test]
async fn main_with_args_returning_status() {
    let f = fixture(StaticReferenceSource::new());
    let source = r#"(module
  (func (export "Main") (param i32 i32) (result i32) (local.get 0)))"#;

    let (build, run) = f.manager.build_and_run(source, &CancellationToken::new()).await;
    assert!(build.success);
    // Invoked with an empty argument vector, so argc is 0.
    assert!(run.unwrap().succeeded());
}

#[tokio::test]
async fn references_are_linked_into_programs() {
    let source = StaticReferenceSource::new()
        .with_module("mathlib.wat", MATHLIB_WAT)
        .with_module("broken.wasm", b"\0asm junk".to_vec());
    let f = fixture(source);
    let report = f.manager.initialize(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.loaded, vec!["mathlib.wat"]);
    assert_eq!(report.failures[0].id, "broken.wasm");
    assert_eq!(f.runtime.library_count(), 1);

    // Returns 0 exactly when double(21) == 42.
    let program = r#"(module
  (import "mathlib" "double" (func $double (param i32) (result i32)))
  (func (export "main") (result i32)
    (i32.sub (call $double (i32.const 21)) (i32.const 42))))"#;
    let (build, run) = f.manager.build_and_run(program, &CancellationToken::new()).await;
    assert!(build.success, "{:?}", build.diagnostics);
    assert!(run.unwrap().succeeded());
}

#[tokio::test]
async fn runaway_program_can_be_cancelled() {
    let f = fixture(StaticReferenceSource::new());
    let build = f
        .manager
        .build(PARTIAL_THEN_SPIN_WAT, &CancellationToken::new())
        .await;
    let binary = build.binary.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let run = tokio::time::timeout(Duration::from_secs(10), f.manager.run(&binary, &cancel))
        .await
        .expect("cancellation should stop the program");
    assert_eq!(run.exception, Some(ExecutionError::Cancelled));
    assert_eq!(run.output, "partial");
    assert!(!f.console.is_redirected());
    assert_eq!(f.manager.state().phase, Phase::NotInitialized);
}

#[tokio::test]
async fn stdout_capacity_comes_from_config() {
    let config = RunpadConfig::from_toml("[runtime]\nstdout_capacity = 4\n").unwrap();
    let runtime = Arc::new(
        RuntimeContext::new()
            .unwrap()
            .with_stdout_capacity(config.runtime.stdout_capacity),
    );
    assert_eq!(runtime.stdout_capacity(), 4);

    let manager = BuildManager::new(
        Arc::new(WatCompiler::new(Arc::clone(&runtime))),
        Arc::new(WasmLoader::new(runtime)),
        Arc::new(StaticReferenceSource::new()),
    )
    .with_console(Console::new(CaptureBuffer::default()));

    let (_, run) = manager
        .build_and_run(HELLO_WORLD_WAT, &CancellationToken::new())
        .await;
    let run = run.unwrap();
    assert_eq!(run.output, "Hell");
    assert_eq!(
        run.exception,
        Some(ExecutionError::Fault("stdout exceeded 4 bytes".into()))
    );
}

#[tokio::test]
async fn output_that_fits_exactly_succeeds() {
    let runtime = Arc::new(RuntimeContext::new().unwrap().with_stdout_capacity(12));
    let manager = BuildManager::new(
        Arc::new(WatCompiler::new(Arc::clone(&runtime))),
        Arc::new(WasmLoader::new(runtime)),
        Arc::new(StaticReferenceSource::new()),
    )
    .with_console(Console::new(CaptureBuffer::default()));

    let (_, run) = manager
        .build_and_run(HELLO_WORLD_WAT, &CancellationToken::new())
        .await;
    let run = run.unwrap();
    assert_eq!(run.output, "Hello World\n");
    assert!(run.exception.is_none());
}

#[tokio::test]
async fn mismatched_reference_signature_fails_the_build() {
    let f = fixture(StaticReferenceSource::new().with_module("mathlib.wat", MATHLIB_WAT));
    f.manager.initialize(&CancellationToken::new()).await.unwrap();

    let program = r#"(module
  (import "mathlib" "double" (func $double (param f64) (result f64)))
  (func (export "_start")))"#;
    let (build, run) = f.manager.build_and_run(program, &CancellationToken::new()).await;

    assert!(!build.success);
    assert!(build.errors().next().unwrap().message.contains("mathlib::double"));
    assert!(run.is_none());
}

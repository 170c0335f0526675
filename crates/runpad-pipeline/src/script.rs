//! Deterministic line-oriented backend.
//!
//! A script is a list of instructions, one per line:
//!
//! ```text
//! # comment
//! use mathlib        # require a reference module
//! entry Main args    # rename the entry point, optionally taking arguments
//! print partial      # write text
//! println Hello      # write text and a newline
//! argc               # write the number of arguments received
//! yield              # suspend; makes the entry point asynchronous
//! fail boom          # raise a fault with the given message
//! panic oops         # crash the program
//! ```
//!
//! [`ScriptCompiler`] and [`ScriptLoader`] count their calls so tests can use
//! them as spies.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::compiler::CompilerBackend;
use crate::console::ConsoleWriter;
use crate::error::{CompileError, ExecutionError, LoadError};
use crate::loader::{EntryKind, EntryPoint, Invocation, Loader, Program};
use crate::references::{Reference, ReferenceSet};
use crate::types::{CompileOutput, Diagnostic, TargetKind};

const MAGIC: &[u8] = b"RUNPAD-SCRIPT\n";
const DEFAULT_ENTRY: &str = "Main";

/// Canned program used to warm the compiler up.
pub const HELLO_WORLD: &str = "println Hello World\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
enum Instruction {
    Print(String),
    Println(String),
    Argc,
    Yield,
    Fail(String),
    Panic(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Script {
    entry: String,
    takes_args: bool,
    imports: Vec<String>,
    instructions: Vec<Instruction>,
}

impl Script {
    fn is_async(&self) -> bool {
        self.instructions.contains(&Instruction::Yield)
    }

    fn encode(&self) -> Result<Vec<u8>, CompileError> {
        let body =
            serde_json::to_vec(self).map_err(|e| CompileError::Internal(e.to_string()))?;
        let mut binary = MAGIC.to_vec();
        binary.extend_from_slice(&body);
        Ok(binary)
    }

    fn decode(binary: &[u8]) -> Result<Self, LoadError> {
        let body = binary
            .strip_prefix(MAGIC)
            .ok_or_else(|| LoadError::InvalidBinary("missing script header".into()))?;
        serde_json::from_slice(body).map_err(|e| LoadError::InvalidBinary(e.to_string()))
    }
}

fn parse(source: &str, references: &ReferenceSet) -> (Script, Vec<Diagnostic>) {
    let mut script = Script {
        entry: DEFAULT_ENTRY.into(),
        takes_args: false,
        imports: Vec::new(),
        instructions: Vec::new(),
    };
    let mut diagnostics = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line_no = index as u32 + 1;
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let column = (raw.len() - trimmed.len()) as u32 + 1;
        let (op, arg) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let arg = arg.trim_end();

        match op {
            "print" => script.instructions.push(Instruction::Print(arg.into())),
            "println" => script.instructions.push(Instruction::Println(arg.into())),
            "argc" => script.instructions.push(Instruction::Argc),
            "yield" => script.instructions.push(Instruction::Yield),
            "fail" | "panic" if arg.is_empty() => diagnostics
                .push(Diagnostic::error(format!("`{op}` requires a message")).at(line_no, column)),
            "fail" => script.instructions.push(Instruction::Fail(arg.into())),
            "panic" => script.instructions.push(Instruction::Panic(arg.into())),
            "use" => match references.by_module_name(arg.trim()) {
                Some(reference) => script.imports.push(reference.id().to_string()),
                None => diagnostics.push(
                    Diagnostic::error(format!("unresolved reference `{}`", arg.trim()))
                        .at(line_no, column),
                ),
            },
            "entry" => {
                let mut parts = arg.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(name), None, None) => script.entry = name.into(),
                    (Some(name), Some("args"), None) => {
                        script.entry = name.into();
                        script.takes_args = true;
                    }
                    _ => diagnostics.push(
                        Diagnostic::error("expected `entry <name> [args]`").at(line_no, column),
                    ),
                }
            }
            other => diagnostics.push(
                Diagnostic::error(format!("unknown instruction `{other}`")).at(line_no, column),
            ),
        }
    }

    if script.instructions.is_empty() && diagnostics.is_empty() {
        diagnostics.push(Diagnostic::warning("program has no instructions"));
    }

    (script, diagnostics)
}

/// Compiler for the script language.
#[derive(Default)]
pub struct ScriptCompiler {
    compiles: AtomicUsize,
    first_error: Mutex<Option<CompileError>>,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first compile with `error`, then behave normally.
    pub fn failing_first_compile(error: CompileError) -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            first_error: Mutex::new(Some(error)),
        }
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl CompilerBackend for ScriptCompiler {
    fn compile<'a>(
        &'a self,
        source: &'a str,
        references: &'a ReferenceSet,
        _target: TargetKind,
    ) -> Pin<Box<dyn Future<Output = Result<CompileOutput, CompileError>> + Send + 'a>> {
        Box::pin(async move {
            self.compiles.fetch_add(1, Ordering::Relaxed);
            let primed = self
                .first_error
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(error) = primed {
                return Err(error);
            }

            let (script, diagnostics) = parse(source, references);
            let binary = if diagnostics.iter().any(Diagnostic::is_error) {
                Vec::new()
            } else {
                script.encode()?
            };
            Ok(CompileOutput {
                binary,
                diagnostics,
            })
        })
    }

    /// References are UTF-8 text listing one exported symbol per line.
    fn parse_reference(&self, id: &str, bytes: Vec<u8>) -> Result<Reference, CompileError> {
        let text = String::from_utf8(bytes).map_err(|e| CompileError::InvalidReference {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        let exports = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        Ok(Reference::new(id, exports))
    }

    fn warm_up_source(&self) -> Option<&str> {
        Some(HELLO_WORLD)
    }
}

/// Loader for binaries produced by [`ScriptCompiler`].
#[derive(Default)]
pub struct ScriptLoader {
    loads: AtomicUsize,
}

impl ScriptLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl Loader for ScriptLoader {
    fn load<'a>(
        &'a self,
        binary: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Program>, LoadError>> + Send + 'a>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::Relaxed);
            let script = Script::decode(binary)?;
            Ok(Box::new(ScriptProgram { script }) as Box<dyn Program>)
        })
    }
}

pub struct ScriptProgram {
    script: Script,
}

impl ScriptProgram {
    fn step(
        instruction: &Instruction,
        argc: usize,
        out: &mut ConsoleWriter,
    ) -> Result<(), ExecutionError> {
        let written = match instruction {
            Instruction::Print(text) => out.write_all(text.as_bytes()),
            Instruction::Println(text) => writeln!(out, "{text}"),
            Instruction::Argc => writeln!(out, "{argc}"),
            Instruction::Yield => Ok(()),
            Instruction::Fail(message) => return Err(ExecutionError::Fault(message.clone())),
            Instruction::Panic(message) => panic!("{message}"),
        };
        written.map_err(|e| ExecutionError::Fault(format!("write to stdout failed: {e}")))
    }
}

impl Program for ScriptProgram {
    /// A script that yields has an async entry point plus the synchronous
    /// `<name>` wrapper around it; otherwise only the synchronous entry exists.
    fn entry_points(&self) -> Vec<EntryPoint> {
        let entry = &self.script.entry;
        let with_args = |e: EntryPoint| {
            if self.script.takes_args {
                e.with_args()
            } else {
                e
            }
        };
        if self.script.is_async() {
            vec![
                EntryPoint::new(format!("<{entry}>"), EntryKind::Sync),
                with_args(EntryPoint::new(entry.clone(), EntryKind::Async)),
            ]
        } else {
            vec![with_args(EntryPoint::new(entry.clone(), EntryKind::Sync))]
        }
    }

    fn invoke<'a>(
        &'a mut self,
        entry: &EntryPoint,
        args: Option<Vec<String>>,
        mut stdout: ConsoleWriter,
    ) -> Invocation<'a> {
        let argc = args.map_or(0, |a| a.len());
        match entry.kind {
            EntryKind::Sync => Invocation::Returned(
                self.script
                    .instructions
                    .iter()
                    .try_for_each(|i| Self::step(i, argc, &mut stdout)),
            ),
            EntryKind::Async => Invocation::Pending(Box::pin(async move {
                for instruction in &self.script.instructions {
                    if *instruction == Instruction::Yield {
                        tokio::task::yield_now().await;
                    }
                    Self::step(instruction, argc, &mut stdout)?;
                }
                Ok(())
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn compile(source: &str, references: &ReferenceSet) -> CompileOutput {
        ScriptCompiler::new()
            .compile(source, references, TargetKind::Executable)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn compiles_hello_world() {
        let output = compile(HELLO_WORLD, &ReferenceSet::new()).await;
        assert!(output.diagnostics.is_empty());
        assert!(output.binary.starts_with(MAGIC));
    }

    #[tokio::test]
    async fn reports_unknown_instruction_with_location() {
        let output = compile("println ok\n  prnt oops\n", &ReferenceSet::new()).await;
        assert_eq!(output.diagnostics.len(), 1);
        let d = &output.diagnostics[0];
        assert!(d.is_error());
        assert_eq!(d.message, "unknown instruction `prnt`");
        assert_eq!(d.location.map(|l| (l.line, l.column)), Some((2, 3)));
        assert!(output.binary.is_empty());
    }

    #[tokio::test]
    async fn resolves_use_against_references() {
        let compiler = ScriptCompiler::new();
        let mut references = ReferenceSet::new();
        references.push(
            compiler
                .parse_reference("mathlib.txt", b"double\ntriple\n".to_vec())
                .unwrap(),
        );

        let ok = compile("use mathlib\nprintln hi\n", &references).await;
        assert!(ok.diagnostics.is_empty());

        let missing = compile("use strings\nprintln hi\n", &references).await;
        assert_eq!(missing.diagnostics[0].message, "unresolved reference `strings`");
    }

    #[tokio::test]
    async fn empty_program_only_warns() {
        let output = compile("# nothing here\n", &ReferenceSet::new()).await;
        assert_eq!(output.diagnostics.len(), 1);
        assert!(!output.diagnostics[0].is_error());
        assert!(!output.binary.is_empty());
    }

    #[tokio::test]
    async fn primed_error_fires_once() {
        let compiler =
            ScriptCompiler::failing_first_compile(CompileError::PlatformUnsupported("mutex".into()));
        let refs = ReferenceSet::new();
        let first = compiler.compile(HELLO_WORLD, &refs, TargetKind::Executable).await;
        assert!(matches!(first, Err(CompileError::PlatformUnsupported(_))));
        let second = compiler.compile(HELLO_WORLD, &refs, TargetKind::Executable).await;
        assert!(second.is_ok());
        assert_eq!(compiler.compile_count(), 2);
    }

    #[test]
    fn rejects_non_utf8_reference() {
        let err = ScriptCompiler::new()
            .parse_reference("bad.bin", vec![0xff, 0xfe])
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn loader_rejects_foreign_bytes() {
        let loader = ScriptLoader::new();
        let err = loader.load(b"\0asm garbage").await.err().unwrap();
        assert!(matches!(err, LoadError::InvalidBinary(_)));
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn yielding_script_exposes_async_entry_and_wrapper() {
        let output = compile("entry Main args\nyield\nargc\n", &ReferenceSet::new()).await;
        let program = ScriptLoader::new().load(&output.binary).await.unwrap();
        let entries = program.entry_points();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], EntryPoint::new("<Main>", EntryKind::Sync));
        assert_eq!(entries[1], EntryPoint::new("Main", EntryKind::Async).with_args());
    }
}

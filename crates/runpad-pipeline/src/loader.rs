use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::console::ConsoleWriter;
use crate::error::{ExecutionError, LoadError};

/// Entry point names a program may designate, in tie-break order: direct
/// `Main`/`main` before the `<Main>`/`_start` shims that wrap them.
pub const DESIGNATED_ENTRY_POINTS: &[&str] = &["Main", "main", "<Main>", "_start"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Completes inside the `invoke` call.
    Sync,
    /// Hands back a future the caller has to drive to completion.
    Async,
}

/// A function a loaded program exposes as a possible starting point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub name: String,
    pub kind: EntryKind,
    /// Whether the signature expects an argument vector.
    pub accepts_args: bool,
}

impl EntryPoint {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            accepts_args: false,
        }
    }

    pub fn with_args(mut self) -> Self {
        self.accepts_args = true;
        self
    }
}

/// Pick the entry point to run.
///
/// Only [`DESIGNATED_ENTRY_POINTS`] qualify. Asynchronous forms win over
/// synchronous ones, so an async `Main` is invoked directly instead of its
/// blocking wrapper; remaining ties follow the designated-name order.
pub fn select_entry_point(candidates: &[EntryPoint]) -> Result<EntryPoint, ExecutionError> {
    candidates
        .iter()
        .filter_map(|entry| {
            DESIGNATED_ENTRY_POINTS
                .iter()
                .position(|name| *name == entry.name)
                .map(|rank| (entry, rank))
        })
        .min_by_key(|(entry, rank)| (entry.kind != EntryKind::Async, *rank))
        .map(|(entry, _)| entry.clone())
        .ok_or_else(|| {
            let found = candidates
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            ExecutionError::NoEntryPoint(if found.is_empty() {
                "program exports no functions".into()
            } else {
                format!("found only [{found}]")
            })
        })
}

/// Result of invoking an entry point.
pub enum Invocation<'a> {
    /// The entry point ran to completion during the call.
    Returned(Result<(), ExecutionError>),
    /// The entry point produced a deferred result.
    Pending(Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'a>>),
}

/// A program loaded into the in-process runtime.
pub trait Program: Send {
    fn entry_points(&self) -> Vec<EntryPoint>;

    /// Run `entry`. `args` is `Some` exactly when the entry accepts an
    /// argument vector. Everything the program prints goes to `stdout`.
    fn invoke<'a>(
        &'a mut self,
        entry: &EntryPoint,
        args: Option<Vec<String>>,
        stdout: ConsoleWriter,
    ) -> Invocation<'a>;
}

/// Loads binary artifacts produced by a compiler backend.
pub trait Loader: Send + Sync {
    fn load<'a>(
        &'a self,
        binary: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Program>, LoadError>> + Send + 'a>>;
}

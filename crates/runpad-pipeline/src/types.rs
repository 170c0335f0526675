use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, ExecutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// 1-based position in the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// A compiler-produced message about the submitted source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(Location { line, column });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        match self.location {
            Some(loc) => write!(f, "{}:{}: {severity}: {}", loc.line, loc.column, self.message),
            None => write!(f, "{severity}: {}", self.message),
        }
    }
}

/// What the backend is asked to produce. Builds always request an executable
/// with a single designated entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Executable,
}

/// Raw output of a compiler backend.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub binary: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Outcome of one build. `binary` is present iff `success`.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub duration: Duration,
    pub binary: Option<Vec<u8>>,
    pub diagnostics: Vec<Diagnostic>,
    pub success: bool,
    pub exception: Option<CompileError>,
}

impl BuildResult {
    pub(crate) fn from_outcome(
        outcome: Result<CompileOutput, CompileError>,
        duration: Duration,
    ) -> Self {
        match outcome {
            Ok(output) => {
                let success = !output.diagnostics.iter().any(Diagnostic::is_error);
                Self {
                    duration,
                    binary: success.then_some(output.binary),
                    diagnostics: output.diagnostics,
                    success,
                    exception: None,
                }
            }
            Err(e) => Self {
                duration,
                binary: None,
                diagnostics: Vec::new(),
                success: false,
                exception: Some(e),
            },
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}

/// Outcome of one run. `output` holds whatever the program wrote before it
/// returned or failed.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub duration: Duration,
    pub output: String,
    pub exception: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exception.is_none()
    }
}

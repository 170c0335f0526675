use std::future::Future;
use std::pin::Pin;

use crate::error::CompileError;
use crate::references::{Reference, ReferenceSet};
use crate::types::{CompileOutput, TargetKind};

/// Facade trait for in-process compilers.
///
/// Source problems are reported as [`Diagnostic`](crate::types::Diagnostic)s
/// inside the returned [`CompileOutput`]; `Err` is reserved for failures of the
/// backend itself.
pub trait CompilerBackend: Send + Sync {
    fn compile<'a>(
        &'a self,
        source: &'a str,
        references: &'a ReferenceSet,
        target: TargetKind,
    ) -> Pin<Box<dyn Future<Output = Result<CompileOutput, CompileError>> + Send + 'a>>;

    /// Turn the bytes of one fetched library module into a reference handle.
    fn parse_reference(&self, id: &str, bytes: Vec<u8>) -> Result<Reference, CompileError>;

    /// Canned program compiled once during initialization to absorb the
    /// backend's first-use cost. `None` skips the warm-up compile.
    fn warm_up_source(&self) -> Option<&str> {
        None
    }
}

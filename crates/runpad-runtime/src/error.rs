use runpad_pipeline::ExecutionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Library not registered: {0}")]
    LibraryNotFound(String),

    #[error("Linking failed: {0}")]
    LinkFailed(String),

    #[error("Instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for ExecutionError {
    fn from(e: RuntimeError) -> Self {
        ExecutionError::Fault(e.to_string())
    }
}

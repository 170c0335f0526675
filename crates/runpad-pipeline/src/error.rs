use thiserror::Error;

/// Failure retrieving the reference manifest or one of its modules.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("manifest unavailable: {0}")]
    Manifest(String),

    #[error("module '{id}' unavailable: {reason}")]
    Module { id: String, reason: String },

    #[error("GET {url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("checksum mismatch for '{id}': expected {expected}, got {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure raised by a compiler backend, as opposed to diagnostics it reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// Expected on a backend's first use on some platforms.
    #[error("operation not supported on this platform: {0}")]
    PlatformUnsupported(String),

    #[error("internal compiler error: {0}")]
    Internal(String),

    #[error("reference '{id}' could not be parsed: {reason}")]
    InvalidReference { id: String, reason: String },

    #[error("compilation cancelled")]
    Cancelled,
}

impl CompileError {
    /// Kinds tolerated during the one-time warm-up compile.
    pub fn is_expected_during_warm_up(&self) -> bool {
        matches!(self, CompileError::PlatformUnsupported(_))
    }
}

/// The binary handed to a loader is not a loadable program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("not a loadable program: {0}")]
    InvalidBinary(String),

    #[error("program was built for an incompatible runtime: {0}")]
    Incompatible(String),
}

/// Failure captured while loading or running a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("no invokable Main: {0}")]
    NoEntryPoint(String),

    /// Raised by the program itself. Displays as the bare message.
    #[error("{0}")]
    Fault(String),

    #[error("execution cancelled")]
    Cancelled,
}

/// Fatal failure of `BuildManager::initialize`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to fetch reference manifest: {0}")]
    Manifest(#[source] FetchError),

    #[error("compiler warm-up failed: {0}")]
    WarmUp(#[source] CompileError),

    #[error("initialization cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing config value: {0}")]
    Missing(String),
}

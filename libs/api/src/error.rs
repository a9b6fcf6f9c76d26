/// Where a store or formatter failure came from.
///
/// Row failures are logged with their kind, and `Io` failures seen after the
/// session was closed make the sink reject the chunk instead of skipping rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad `[cluster]` settings or table definitions, found at startup.
    Config,
    /// The store could not be reached or the session is closed.
    Io,
    /// The row itself was refused: unformattable record, type mismatch, bad JSON.
    Format,
    /// Anything else, e.g. an unconfigured table or a lost write task.
    Logic,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Format => "format",
            ErrorKind::Logic => "logic",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by `StoreSession` and `RecordFormatter` implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Logic, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Config, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Io, msg)
    }

    pub fn format_err(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Format, msg)
    }

    fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

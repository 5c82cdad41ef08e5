use thiserror::Error;

/// Failure to tokenize, parse or rewrite a cell for input suspension.
/// Never fatal: the controller falls back to the unmodified source.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RewriteError {
    #[error("line {line}: {message}")]
    Lex { line: usize, message: String },

    #[error("line {line}: unindent does not match any outer indentation level")]
    Dedent { line: usize },

    #[error("line {line}: unexpected indent")]
    UnexpectedIndent { line: usize },

    #[error("line {line}: unmatched '{bracket}'")]
    Unbalanced { line: usize, bracket: char },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("overlapping edits at offset {offset}")]
    OverlappingEdit { offset: usize },
}

/// Why a cell run did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error("cell {running} is already running")]
    Busy { running: String },

    #[error("no cell with id {0}")]
    UnknownCell(String),

    /// The host runtime raised; the text is the exception description.
    #[error("{0}")]
    Runtime(String),

    #[error("Stopped by user")]
    Cancelled,

    #[error("rewritten code is empty although the cell is not")]
    EmptyRewrite,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("an input request for cell {cell} is already pending")]
    AlreadyPending { cell: String },

    #[error("no input request is pending")]
    NoPendingRequest,

    /// Distinguished cancellation signal delivered to a waiting cell on stop.
    #[error("KeyboardInterrupt")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("notebook is too large to save ({size} characters, limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("storage backend: {0}")]
    Backend(String),

    #[error("stored notebook is unreadable: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("not a notebook file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid notebook format: missing 'cells' array")]
    MissingCells,
}

/// A turtle call from Python that cannot be dispatched.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed turtle call: {0}")]
    Json(#[from] serde_json::Error),

    #[error("turtle has no method '{0}'")]
    UnknownMethod(String),

    #[error("{method}(): {message}")]
    BadArgument { method: String, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid notebook config: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_messages() {
        assert_eq!(ExecError::Cancelled.to_string(), "Stopped by user");
        assert_eq!(InputError::Cancelled.to_string(), "KeyboardInterrupt");
    }

    #[test]
    fn test_import_error_from_json() {
        let err: ImportError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.to_string().starts_with("not a notebook file"));
    }
}

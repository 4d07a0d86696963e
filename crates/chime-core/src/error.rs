use thiserror::Error;

/// Errors raised by the core value types, mostly at schedule time.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The timestamp part of a schedule expression could not be parsed.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A schedule expression used an operator other than `add`.
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// A schedule expression used a time unit we do not understand.
    #[error("Unknown time unit: {0}")]
    UnknownUnit(String),

    /// More than one `|`-separated operation — combining operations is not
    /// supported and must fail loudly rather than be silently ignored.
    #[error("Expression has {count} operations; at most one is supported")]
    TooManyOperations { count: usize },

    /// An `add` operation without a parseable signed amount.
    #[error("Invalid offset amount: {0}")]
    InvalidAmount(String),

    /// The computed instant fell outside chrono's representable range.
    #[error("Offset overflows the representable date range: {0}")]
    OffsetOutOfRange(String),

    /// Configuration file / env extraction failure.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

use thiserror::Error;

/// Errors surfaced by parsing, building, and operator dispatch.
///
/// Input errors (`NoData`, `Invalid`, `BadEscape`) are recoverable: the
/// parser rolls the stack back to the index at which the failing value
/// began, leaving anything parsed earlier intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The input contained nothing but whitespace.
    #[error("no JSON value in input")]
    NoData,

    /// A malformed token. The offset is the number of bytes consumed
    /// from the source when the error was detected.
    #[error("malformed JSON at byte offset {0}")]
    Invalid(usize),

    /// A bad escape sequence inside a string literal.
    #[error("bad string escape at byte offset {0}")]
    BadEscape(usize),

    /// A copied string longer than a cell's length word can count.
    #[error("copied string exceeds {} bytes", u32::MAX)]
    StringTooLong,

    /// Operator dispatch found neither a per-type override nor a default.
    #[error("operator '{0}' is not supported for this type")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

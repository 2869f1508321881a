use nom::error::{ErrorKind, ParseError};
use std::io;
use thiserror::Error;

/// Errors reported by the decoders, encoders and the boundary entry points.
///
/// Decode errors are deterministic: decoding the same bytes again yields the
/// same error, so there is no retry machinery anywhere in the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A read ran past the end of the byte buffer in the middle of a record.
    #[error("unexpected end of data")]
    TruncatedData,
    /// The magic number or the declared format version is not one we read.
    #[error("unsupported format: {reason}")]
    UnsupportedFormat { reason: String },
    /// A declared element count or a cross-reference violates an invariant
    /// of the format, e.g. a bone parent index past the end of the bone list.
    #[error("malformed {section} section: {reason}")]
    MalformedSection {
        section: &'static str,
        reason: String,
    },
    /// A name or index lookup failed after decoding, while assigning data to
    /// a target. Never produced by the decoders themselves.
    #[error("unresolved reference: {name}")]
    UnresolvedReference { name: String },
    /// Dispatch was asked for a command the table does not contain.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A command handler received the input variant of a different command.
    #[error("invalid input for command {command}")]
    InvalidCommandInput { command: &'static str },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Fallback for nom errors that do not map to one of the above.
    #[error("parse error: {0:?}")]
    Nom(ErrorKind),
}

impl Error {
    pub(crate) fn malformed(section: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedSection {
            section,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Error::UnsupportedFormat {
            reason: reason.into(),
        }
    }
}

impl ParseError<&[u8]> for Error {
    fn from_error_kind(_input: &[u8], kind: ErrorKind) -> Self {
        // The complete-input number and `take` parsers signal a short buffer
        // with `Eof`, which is exactly our truncation case.
        match kind {
            ErrorKind::Eof | ErrorKind::Complete => Error::TruncatedData,
            _ => Error::Nom(kind),
        }
    }

    fn append(_input: &[u8], _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

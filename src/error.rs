use thiserror::Error;

/// Errors surfaced at parser and configuration boundaries.
///
/// A `Malformed` error is parse-fatal for the direction that produced it:
/// the framework drops that direction's buffer and the next bytes start a
/// fresh message. It never escapes to a publisher sink.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed {proto} stream: {detail}")]
    Malformed {
        proto: &'static str,
        detail: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn malformed(proto: &'static str, detail: &'static str) -> Self {
        Error::Malformed { proto, detail }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of one call into a message parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A message is fully framed; the cursor sits one past its last byte.
    Complete,
    /// More bytes are required. The cursor was not advanced past the point
    /// of insufficiency, so the next call resumes without re-scanning.
    More,
}

pub type ParseResult = Result<Progress>;

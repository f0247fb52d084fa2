//! The Livestatus wire protocol.
//!
//! Everything that can be parsed from or rendered to the wire lives here:
//! cell values, the request grammar, filter and stats expressions, and the
//! response encodings. The daemon side (tables, peers, query planning) lives
//! in liblsmux; this crate has no I/O.

mod filter;
mod output;
mod request;
mod stats;
mod value;

pub use filter::*;
pub use output::*;
pub use request::*;
pub use stats::*;
pub use value::*;

/// A request that could not be parsed. Carries the 1-based line number the
/// parser choked on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bad request line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

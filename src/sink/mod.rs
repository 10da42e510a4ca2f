//! Durable record sink.
//!
//! Every domain record is written as one JSON object per line to a
//! size-rotated file.

mod records;
mod writer;

pub use records::*;
pub use writer::*;

use thiserror::Error;

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed {record_type} record: missing {field}")]
    Malformed {
        record_type: &'static str,
        field: &'static str,
    },
}

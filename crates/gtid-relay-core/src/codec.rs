//! Transaction frame codec
//!
//! Frames on the wire are `snappy(bincode(Transaction))`. Decoding verifies
//! that the structural decoder consumed the decompressed buffer exactly, so
//! truncated or padded frames are rejected instead of silently accepted.

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the decompressed size of a single frame.
///
/// Matches the payload ceiling of the bus transport; the bincode reader is
/// capped at this value so a corrupt length prefix cannot trigger a huge
/// allocation.
pub const MAX_FRAME_SIZE: u64 = 100 * 1024 * 1024;

/// One upstream transaction, the unit of apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Upstream GTID in canonical `uuid:gno` text form. Kept textual on the
    /// wire; parsing happens at apply time so a malformed GTID fails only
    /// this transaction.
    pub gtid: String,
    /// Format description event. Applied standalone, at most once per
    /// distinct value per connection, ahead of the transactions carrying it.
    pub fde: String,
    /// Ordered SQL statements forming the transaction. Empty means no-op.
    pub queries: Vec<String>,
    /// Declared in-memory footprint of the decoded transaction, used for
    /// credit accounting.
    pub event_size: u64,
    /// Upstream logical clock partitioning transactions into commit groups.
    /// Transactions sharing a value may replay in parallel; a greater value
    /// must happen-after all earlier groups.
    pub last_committed: Option<i64>,
}

impl Transaction {
    /// A no-op transaction carries no statements and is skipped at intake.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Frame decoding/encoding failures. All are per-message, never fatal to the
/// pipeline.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Snappy compression failed
    #[error("snappy compression failed: {0}")]
    Compress(snap::Error),

    /// Snappy decompression failed
    #[error("snappy decompression failed: {0}")]
    Decompress(snap::Error),

    /// Structural decoding failed
    #[error("frame schema error: {0}")]
    Schema(#[from] bincode::Error),

    /// The structural decoder did not consume the whole frame
    #[error("frame has trailing bytes: {consumed} of {total} consumed")]
    TrailingBytes { total: u64, consumed: u64 },
}

fn frame_options() -> impl Options {
    bincode::options().with_limit(MAX_FRAME_SIZE)
}

/// Encode a transaction into a wire frame.
pub fn encode(txn: &Transaction) -> Result<Vec<u8>, CodecError> {
    let raw = frame_options().serialize(txn)?;
    snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map_err(CodecError::Compress)
}

/// Decode a wire frame into a transaction.
///
/// Rejects frames whose structural encoding does not span the decompressed
/// buffer exactly.
pub fn decode(data: &[u8]) -> Result<Transaction, CodecError> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(CodecError::Decompress)?;

    let mut cursor = std::io::Cursor::new(raw.as_slice());
    let txn: Transaction = frame_options()
        .allow_trailing_bytes()
        .deserialize_from(&mut cursor)?;

    let consumed = cursor.position();
    if consumed != raw.len() as u64 {
        return Err(CodecError::TrailingBytes {
            total: raw.len() as u64,
            consumed,
        });
    }

    Ok(txn)
}

// Positional delta protocol.
//
// A signature describes what the recipient already has; the encoder
// diffs a source stream against it and the decoder replays the result
// against the recipient's original bytes.
//
// # Modules
//
// - `ops`     — `Operation` (Block | Data) and delta counters
// - `encoder` — signature building, positional diff, producer-thread streams
// - `decoder` — ordered replay against a seekable original
// - `varint`  — base-128 integers for on-disk records
// - `codec`   — binary operation records stored in data logs

pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod ops;
pub mod varint;

use std::io;

use crate::chunker::ChunkError;

pub use codec::{CodecError, decode_operation, encode_operation};
pub use decoder::{apply, apply_ops, apply_to_vec};
pub use encoder::{
    DEFAULT_CHANNEL_CAPACITY, DeltaIter, OperationStream, build_signature, diff, diff_all,
    diff_stream,
};
pub use ops::{Chunk, ChunkHash, DeltaStats, Operation};

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("operation stream closed before completion")]
    Closed,
}

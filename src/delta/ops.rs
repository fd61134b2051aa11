// Delta operations.
//
// A delta is an ordered sequence of operations.  `Block` reuses a byte
// range of the original version; `Data` carries literal bytes.

use bytes::Bytes;

pub use crate::chunker::{Chunk, ChunkHash};

/// One unit of a delta stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Reuse `chunk_hash.length` bytes at `chunk_hash.offset` of the original.
    Block(ChunkHash),
    /// Write the chunk's payload verbatim.
    Data(Chunk),
}

impl Operation {
    /// Descriptor of the chunk this operation produces in the new version.
    pub fn chunk_hash(&self) -> ChunkHash {
        match self {
            Operation::Block(ch) => *ch,
            Operation::Data(chunk) => chunk.chunk_hash(),
        }
    }

    /// Bytes this operation contributes to the reconstructed output.
    pub fn output_len(&self) -> u64 {
        match self {
            Operation::Block(ch) => ch.length,
            Operation::Data(chunk) => chunk.data.len() as u64,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Operation::Block(_))
    }

    /// Literal operation from raw bytes already placed at `offset`.
    pub fn data(offset: u64, hash: u64, data: Bytes) -> Self {
        Operation::Data(Chunk {
            offset,
            length: data.len() as u64,
            hash,
            data,
        })
    }
}

/// Counts of a finished delta, used for logging and CLI stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeltaStats {
    pub blocks: u64,
    pub data_ops: u64,
    /// Bytes reused from the original.
    pub block_bytes: u64,
    /// Literal bytes carried in Data operations.
    pub data_bytes: u64,
}

impl DeltaStats {
    pub fn record(&mut self, op: &Operation) {
        match op {
            Operation::Block(ch) => {
                self.blocks += 1;
                self.block_bytes += ch.length;
            }
            Operation::Data(chunk) => {
                self.data_ops += 1;
                self.data_bytes += chunk.data.len() as u64;
            }
        }
    }
}

impl std::ops::AddAssign for DeltaStats {
    fn add_assign(&mut self, other: DeltaStats) {
        self.blocks += other.blocks;
        self.data_ops += other.data_ops;
        self.block_bytes += other.block_bytes;
        self.data_bytes += other.data_bytes;
    }
}

// Signature building and positional delta encoding.
//
// The encoder chunks the source stream and compares chunk `i` against
// entry `i` of the target signature only.  A match on (hash, length,
// offset) emits Block; anything else emits Data.  Edits that shift
// alignment cost reuse until content-defined boundaries line up again,
// which for append and edit-in-place workloads happens within a chunk.
//
// `diff_stream` runs the encoder on a producer thread feeding a bounded
// channel, so a slow consumer throttles chunking upstream.

use std::io::Read;
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

use super::DeltaError;
use super::ops::{ChunkHash, DeltaStats, Operation};
use crate::chunker::{ChunkError, ChunkIter, Chunker};

/// Default capacity of the operation channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Chunk a reference stream and keep only the descriptors.
pub fn build_signature<R: Read>(chunker: &Chunker, reader: R) -> Result<Vec<ChunkHash>, ChunkError> {
    chunker
        .chunk(reader)
        .map(|chunk| chunk.map(|c| c.chunk_hash()))
        .collect()
}

// ---------------------------------------------------------------------------
// DeltaIter
// ---------------------------------------------------------------------------

/// Lazy positional diff of a source stream against a signature.
pub struct DeltaIter<'s, R> {
    chunks: ChunkIter<R>,
    signature: &'s [ChunkHash],
    index: usize,
    stats: DeltaStats,
}

impl<R: Read> DeltaIter<'_, R> {
    pub fn stats(&self) -> DeltaStats {
        self.stats
    }
}

impl<R: Read> Iterator for DeltaIter<'_, R> {
    type Item = Result<Operation, DeltaError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = match self.chunks.next()? {
            Ok(c) => c,
            Err(e) => return Some(Err(e.into())),
        };
        let i = self.index;
        self.index += 1;

        let op = match self.signature.get(i) {
            Some(target) if *target == chunk.chunk_hash() => Operation::Block(*target),
            _ => Operation::Data(chunk),
        };
        self.stats.record(&op);
        Some(Ok(op))
    }
}

/// Diff `source` against a target signature.
pub fn diff<'s, R: Read>(
    chunker: &Chunker,
    source: R,
    signature: &'s [ChunkHash],
) -> DeltaIter<'s, R> {
    DeltaIter {
        chunks: chunker.chunk(source),
        signature,
        index: 0,
        stats: DeltaStats::default(),
    }
}

/// Diff fully in memory.
pub fn diff_all(
    chunker: &Chunker,
    source: &[u8],
    signature: &[ChunkHash],
) -> Result<Vec<Operation>, DeltaError> {
    diff(chunker, source, signature).collect()
}

// ---------------------------------------------------------------------------
// OperationStream
// ---------------------------------------------------------------------------

/// Ordered operations handed over from a producer thread.
///
/// Items arrive in production order.  If the producer dies without
/// finishing, the stream yields `DeltaError::Closed` instead of ending
/// quietly, so a truncated delta is never mistaken for a complete one.
pub struct OperationStream {
    rx: Receiver<Result<Operation, DeltaError>>,
    producer: Option<thread::JoinHandle<()>>,
}

impl OperationStream {
    /// Run `produce` on its own thread with a channel of `capacity` slots.
    ///
    /// An `Err` returned by `produce` is forwarded as the final item.
    pub fn spawn<F>(capacity: usize, produce: F) -> Self
    where
        F: FnOnce(&Sender<Result<Operation, DeltaError>>) -> Result<(), DeltaError>
            + Send
            + 'static,
    {
        let (tx, rx) = bounded(capacity.max(1));
        let producer = thread::spawn(move || {
            if let Err(e) = produce(&tx) {
                // Receiver may already be gone; nothing left to report to.
                let _ = tx.send(Err(e));
            }
        });
        Self {
            rx,
            producer: Some(producer),
        }
    }

    /// Stream a ready-made list of operations.
    pub fn from_operations(ops: Vec<Operation>) -> Self {
        let (tx, rx) = bounded(ops.len().max(1));
        for op in ops {
            // Capacity covers every item, so this cannot block.
            let _ = tx.send(Ok(op));
        }
        Self { rx, producer: None }
    }
}

impl Iterator for OperationStream {
    type Item = Result<Operation, DeltaError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                let producer = self.producer.take()?;
                match producer.join() {
                    Ok(()) => None,
                    Err(_) => Some(Err(DeltaError::Closed)),
                }
            }
        }
    }
}

/// Diff `source` against `signature` on a producer thread.
pub fn diff_stream<R>(
    chunker: &Chunker,
    source: R,
    signature: Vec<ChunkHash>,
    capacity: usize,
) -> OperationStream
where
    R: Read + Send + 'static,
{
    let chunker = chunker.clone();
    OperationStream::spawn(capacity, move |tx| {
        let mut ops = diff(&chunker, source, &signature);
        for op in ops.by_ref() {
            let op = op?;
            if tx.send(Ok(op)).is_err() {
                // Consumer hung up; stop chunking.
                return Ok(());
            }
        }
        let stats = ops.stats();
        log::trace!(
            "diff finished: {} blocks ({} B), {} data ({} B)",
            stats.blocks,
            stats.block_bytes,
            stats.data_ops,
            stats.data_bytes
        );
        Ok(())
    })
}

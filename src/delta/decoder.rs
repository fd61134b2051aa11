// Delta application.
//
// Replays an ordered operation stream against seekable access to the
// original version.  Block copies a byte range out of the original;
// Data writes its payload verbatim.  A Block that runs past the end of
// the original copies what is there and moves on.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::DeltaError;
use super::ops::{DeltaStats, Operation};

/// Apply `ops` in order, reading Block ranges from `original`.
///
/// The first error from `ops` stops application and is returned as is.
/// Returns counts of what was written; `block_bytes` is the number of
/// bytes actually copied, which is less than requested on a short read.
pub fn apply<I, E, R, W>(ops: I, mut original: R, mut out: W) -> Result<DeltaStats, E>
where
    I: IntoIterator<Item = Result<Operation, E>>,
    E: From<io::Error>,
    R: Read + Seek,
    W: Write,
{
    let mut stats = DeltaStats::default();
    for op in ops {
        match op? {
            Operation::Block(ch) => {
                original.seek(SeekFrom::Start(ch.offset))?;
                let copied = io::copy(&mut (&mut original).take(ch.length), &mut out)?;
                if copied < ch.length {
                    log::trace!(
                        "short block read at {}: {copied} of {} bytes",
                        ch.offset,
                        ch.length
                    );
                }
                stats.blocks += 1;
                stats.block_bytes += copied;
            }
            Operation::Data(chunk) => {
                out.write_all(&chunk.data)?;
                stats.data_ops += 1;
                stats.data_bytes += chunk.data.len() as u64;
            }
        }
    }
    out.flush()?;
    Ok(stats)
}

/// Apply an already-materialised operation list.
pub fn apply_ops<'a, R, W>(
    ops: impl IntoIterator<Item = &'a Operation>,
    original: R,
    out: W,
) -> Result<DeltaStats, DeltaError>
where
    R: Read + Seek,
    W: Write,
{
    apply(
        ops.into_iter().cloned().map(Ok::<_, DeltaError>),
        original,
        out,
    )
}

/// Apply in memory and return the reconstructed bytes.
pub fn apply_to_vec(ops: &[Operation], original: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut out = Vec::new();
    apply_ops(ops, io::Cursor::new(original), &mut out)?;
    Ok(out)
}

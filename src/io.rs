// File-level helpers for signatures and deltas.
//
// Provides `signature_file()`, `diff_files()` and `apply_file()`, which
// wrap the streaming chunker/encoder/applier with buffered file I/O.
// Optionally computes streaming SHA-256 checksums (feature-gated behind
// `file-io`).

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[cfg(feature = "file-io")]
use sha2::Digest;

use crate::chunker::{ChunkError, Chunker};
use crate::delta::codec::{self, CodecError, DeltaReader, DeltaWriter};
use crate::delta::{self, DeltaError, DeltaStats};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Statistics returned by `signature_file()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignatureStats {
    /// Size of the chunked input in bytes.
    pub input_size: u64,
    /// Number of chunks in the signature.
    pub chunks: u64,
    /// Size of the signature file in bytes.
    pub signature_size: u64,
}

/// Statistics returned by `diff_files()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiffStats {
    /// Source file size in bytes.
    pub source_size: u64,
    /// Delta output size in bytes.
    pub delta_size: u64,
    pub ops: DeltaStats,
    /// SHA-256 of the source file (if `file-io` feature is enabled).
    #[serde(serialize_with = "hex_opt")]
    pub source_sha256: Option<[u8; 32]>,
}

/// Statistics returned by `apply_file()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApplyStats {
    /// Delta file size in bytes.
    pub delta_size: u64,
    /// Reconstructed output size in bytes.
    pub output_size: u64,
    pub ops: DeltaStats,
    /// SHA-256 of the reconstructed output (if `file-io` feature is enabled).
    #[serde(serialize_with = "hex_opt")]
    pub output_sha256: Option<[u8; 32]>,
}

fn hex_opt<S: serde::Serializer>(v: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(bytes) => s.serialize_some(&hex::encode(bytes)),
        None => s.serialize_none(),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for file I/O operations.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("chunking error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),
    #[error("malformed signature: {0}")]
    Signature(#[from] CodecError),
}

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// signature_file
// ---------------------------------------------------------------------------

/// Chunk `input_path` and write its signature to `signature_path`.
pub fn signature_file(
    input_path: &Path,
    signature_path: &Path,
    chunker: &Chunker,
) -> Result<SignatureStats, IoError> {
    let input = File::open(input_path)?;
    let input_size = input.metadata()?.len();
    let signature = delta::build_signature(chunker, BufReader::with_capacity(BUF_SIZE, input))?;

    let bytes = codec::encode_signature(&signature);
    std::fs::write(signature_path, &bytes)?;

    Ok(SignatureStats {
        input_size,
        chunks: signature.len() as u64,
        signature_size: bytes.len() as u64,
    })
}

/// Load a signature written by `signature_file()`.
pub fn read_signature_file(path: &Path) -> Result<Vec<delta::ChunkHash>, IoError> {
    Ok(codec::decode_signature(&std::fs::read(path)?)?)
}

// ---------------------------------------------------------------------------
// diff_files
// ---------------------------------------------------------------------------

/// Diff `source_path` against the signature at `signature_path`, writing
/// a delta file to `delta_path`.
///
/// The source is streamed; when the `file-io` feature is enabled its
/// SHA-256 is computed as it is chunked.
pub fn diff_files(
    source_path: &Path,
    signature_path: &Path,
    delta_path: &Path,
    chunker: &Chunker,
) -> Result<DiffStats, IoError> {
    let signature = read_signature_file(signature_path)?;

    let source = File::open(source_path)?;
    let source_size = source.metadata()?.len();
    #[cfg(feature = "file-io")]
    let mut source_hasher = sha2::Sha256::new();
    #[cfg(feature = "file-io")]
    let reader = HashingReader {
        inner: BufReader::with_capacity(BUF_SIZE, source),
        hasher: &mut source_hasher,
    };
    #[cfg(not(feature = "file-io"))]
    let reader = BufReader::with_capacity(BUF_SIZE, source);

    let out = BufWriter::with_capacity(BUF_SIZE, File::create(delta_path)?);
    let mut writer = DeltaWriter::new(out)?;
    let mut ops = delta::diff(chunker, reader, &signature);
    for op in ops.by_ref() {
        writer.write_operation(&op?)?;
    }
    let stats = ops.stats();
    drop(ops);
    let delta_size = writer.bytes_written();
    writer.finish()?;

    #[cfg(feature = "file-io")]
    let source_sha256 = Some(source_hasher.finalize().into());
    #[cfg(not(feature = "file-io"))]
    let source_sha256: Option<[u8; 32]> = None;

    Ok(DiffStats {
        source_size,
        delta_size,
        ops: stats,
        source_sha256,
    })
}

// ---------------------------------------------------------------------------
// apply_file
// ---------------------------------------------------------------------------

/// Apply the delta at `delta_path` to `original_path`, writing the result
/// to `output_path`.
///
/// The original is read through a seekable buffer, never loaded whole.
/// When the `file-io` feature is enabled, a SHA-256 of the output is
/// computed incrementally.
pub fn apply_file(
    original_path: &Path,
    delta_path: &Path,
    output_path: &Path,
) -> Result<ApplyStats, IoError> {
    let original = BufReader::with_capacity(BUF_SIZE, File::open(original_path)?);

    let delta_file = File::open(delta_path)?;
    let delta_size = delta_file.metadata()?.len();
    let ops = DeltaReader::new(BufReader::with_capacity(BUF_SIZE, delta_file))?;

    let mut output_writer = BufWriter::with_capacity(BUF_SIZE, File::create(output_path)?);

    #[cfg(feature = "file-io")]
    let mut output_hasher = sha2::Sha256::new();

    #[cfg(feature = "file-io")]
    let stats = {
        let hashing_writer = HashingWriter {
            inner: &mut output_writer,
            hasher: &mut output_hasher,
        };
        delta::apply(ops, original, hashing_writer)?
    };

    #[cfg(not(feature = "file-io"))]
    let stats = delta::apply(ops, original, &mut output_writer)?;

    output_writer.flush()?;

    #[cfg(feature = "file-io")]
    let output_sha256 = Some(output_hasher.finalize().into());
    #[cfg(not(feature = "file-io"))]
    let output_sha256: Option<[u8; 32]> = None;

    Ok(ApplyStats {
        delta_size,
        output_size: stats.block_bytes + stats.data_bytes,
        ops: stats,
        output_sha256,
    })
}

// ---------------------------------------------------------------------------
// Hashing adapters (used with file-io feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "file-io")]
struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: &'a mut sha2::Sha256,
}

#[cfg(feature = "file-io")]
impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(feature = "file-io")]
struct HashingReader<'a, R: Read> {
    inner: R,
    hasher: &'a mut sha2::Sha256,
}

#[cfg(feature = "file-io")]
impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

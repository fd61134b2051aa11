// Content-defined chunking over a byte stream.
//
// `Chunker` holds a profile; `ChunkIter` lazily reads from any `Read`
// source and yields `Chunk`s.  The iterator keeps at least `max_size`
// bytes buffered before searching for a cut (or has hit EOF), so the
// boundaries it emits depend only on content and profile, never on how
// the underlying reader splits its reads.

use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::hash::{ChunkerConfig, GearHasher, chunk_digest};

/// Read granularity when refilling the buffer.
const READ_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Chunk / ChunkHash
// ---------------------------------------------------------------------------

/// One content-defined segment of a stream, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of the chunk within its stream.
    pub offset: u64,
    pub length: u64,
    /// Seeded xxh3-64 of the payload.
    pub hash: u64,
    pub data: Bytes,
}

impl Chunk {
    /// Descriptor of this chunk without its payload.
    pub fn chunk_hash(&self) -> ChunkHash {
        ChunkHash {
            offset: self.offset,
            length: self.length,
            hash: self.hash,
        }
    }
}

/// Signature entry: describes a chunk of a reference version, no payload.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct ChunkHash {
    pub offset: u64,
    pub length: u64,
    pub hash: u64,
}

impl ChunkHash {
    /// Same content, ignoring where it sits in the stream.
    #[inline]
    pub fn same_content(&self, other: &ChunkHash) -> bool {
        self.hash == other.hash && self.length == other.length
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("I/O error while chunking: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Configured entry point for chunking.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    hasher: GearHasher,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            hasher: GearHasher::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Lazily chunk a reader.
    pub fn chunk<R: Read>(&self, reader: R) -> ChunkIter<R> {
        ChunkIter {
            reader,
            hasher: self.hasher.clone(),
            seed: self.config.seed(),
            buffer: BytesMut::with_capacity(self.config.max_size() + READ_SIZE),
            offset: 0,
            eof: false,
            finished: false,
        }
    }

    /// Chunk an in-memory buffer.
    pub fn chunk_bytes(&self, data: impl Into<Bytes>) -> Vec<Chunk> {
        let data: Bytes = data.into();
        let mut chunks = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let len = self.hasher.cut_point(&data[pos..]);
            let payload = data.slice(pos..pos + len);
            chunks.push(Chunk {
                offset: pos as u64,
                length: len as u64,
                hash: chunk_digest(&payload, self.config.seed()),
                data: payload,
            });
            pos += len;
        }
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// ChunkIter
// ---------------------------------------------------------------------------

/// Lazy, finite, non-restartable sequence of chunks read from `R`.
///
/// After the first error the iterator is exhausted.
pub struct ChunkIter<R> {
    reader: R,
    hasher: GearHasher,
    seed: u64,
    buffer: BytesMut,
    offset: u64,
    eof: bool,
    finished: bool,
}

impl<R: Read> ChunkIter<R> {
    /// Top up the buffer to `max_size` bytes or EOF.
    fn fill(&mut self) -> io::Result<()> {
        let want = self.hasher.max_size();
        let mut scratch = [0u8; 8192];
        while !self.eof && self.buffer.len() < want {
            match self.reader.read(&mut scratch) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stream position of the next chunk.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<R: Read> Iterator for ChunkIter<R> {
    type Item = Result<Chunk, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Err(e) = self.fill() {
            self.finished = true;
            return Some(Err(e.into()));
        }
        if self.buffer.is_empty() {
            self.finished = true;
            return None;
        }

        let len = self.hasher.cut_point(&self.buffer);
        let data = self.buffer.split_to(len).freeze();
        let chunk = Chunk {
            offset: self.offset,
            length: len as u64,
            hash: chunk_digest(&data, self.seed),
            data,
        };
        self.offset += len as u64;
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut s = 0x2545F4914F6CDD1Du64;
        (0..len)
            .map(|_| {
                s ^= s << 13;
                s ^= s >> 7;
                s ^= s << 17;
                s as u8
            })
            .collect()
    }

    fn small() -> Chunker {
        Chunker::new(ChunkerConfig::with_average(256).unwrap())
    }

    #[test]
    fn empty_stream_has_no_chunks() {
        let chunks: Vec<_> = small().chunk(Cursor::new(Vec::new())).collect();
        assert!(chunks.is_empty());
        assert!(small().chunk_bytes(Vec::new()).is_empty());
    }

    #[test]
    fn chunks_cover_stream_contiguously() {
        let data = sample(20_000);
        let chunks: Vec<Chunk> = small()
            .chunk(Cursor::new(&data))
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(chunks.len() > 10);
        let mut expected = 0u64;
        for c in &chunks {
            assert_eq!(c.offset, expected);
            assert_eq!(c.length as usize, c.data.len());
            expected += c.length;
        }
        assert_eq!(expected, data.len() as u64);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn reader_granularity_does_not_move_boundaries() {
        let data = sample(50_000);
        let chunker = small();
        let whole: Vec<ChunkHash> = chunker
            .chunk(Cursor::new(&data))
            .map(|c| c.unwrap().chunk_hash())
            .collect();
        let trickled: Vec<ChunkHash> = chunker
            .chunk(Trickle {
                data: &data,
                step: 7,
            })
            .map(|c| c.unwrap().chunk_hash())
            .collect();
        let in_memory: Vec<ChunkHash> = chunker
            .chunk_bytes(data.clone())
            .iter()
            .map(Chunk::chunk_hash)
            .collect();
        assert_eq!(whole, trickled);
        assert_eq!(whole, in_memory);
    }

    #[test]
    fn io_error_ends_iteration() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("boom"))
            }
        }
        let mut it = small().chunk(Broken);
        assert!(matches!(it.next(), Some(Err(ChunkError::Io(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn same_content_ignores_offset() {
        let a = ChunkHash {
            offset: 0,
            length: 4,
            hash: 9,
        };
        let b = ChunkHash { offset: 40, ..a };
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }
}

// Binary encoding of operations as stored in data logs.
//
// Record layout:
//
//   tag       u8       0 = Block, 1 = Data
//   offset    varint
//   length    varint
//   hash      u64 BE
//   payload   [length] bytes (Data only)
//
// The Data payload length is the chunk length, so a record is fully
// self-delimiting; the store still addresses records by (offset, length).
//
// Standalone signature and delta files wrap the same encodings:
//
//   signature: "CSS1", varint count, count x (offset, length, hash)
//   delta:     "CSD1", then per operation a varint record length + record

use std::io::{self, Read, Write};

use bytes::Bytes;

use super::ops::{Chunk, ChunkHash, Operation};
use super::varint::{self, Cursor, MAX_VARINT_LEN, VarIntError};

const TAG_BLOCK: u8 = 0;
const TAG_DATA: u8 = 1;

pub const SIGNATURE_MAGIC: [u8; 4] = *b"CSS1";
pub const DELTA_MAGIC: [u8; 4] = *b"CSD1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed integer: {0}")]
    VarInt(#[from] VarIntError),
    #[error("unknown operation tag {0}")]
    UnknownTag(u8),
    #[error("{0} trailing bytes after record")]
    Trailing(usize),
    #[error("length {0} does not fit in memory")]
    TooLarge(u64),
    #[error("bad magic bytes")]
    BadMagic,
}

/// Encoded size of `op`, for pre-sizing buffers.
pub fn encoded_len(op: &Operation) -> usize {
    let ch = op.chunk_hash();
    let head = 1 + varint::sizeof_u64(ch.offset) + varint::sizeof_u64(ch.length) + 8;
    match op {
        Operation::Block(_) => head,
        Operation::Data(chunk) => head + chunk.data.len(),
    }
}

/// Append the record for `op` to `out`.
pub fn encode_operation(op: &Operation, out: &mut Vec<u8>) {
    out.reserve(encoded_len(op));
    match op {
        Operation::Block(ch) => {
            out.push(TAG_BLOCK);
            put_chunk_hash(out, ch);
        }
        Operation::Data(chunk) => {
            out.push(TAG_DATA);
            put_chunk_hash(
                out,
                &ChunkHash {
                    length: chunk.data.len() as u64,
                    ..chunk.chunk_hash()
                },
            );
            out.extend_from_slice(&chunk.data);
        }
    }
}

/// Decode exactly one record occupying all of `data`.
pub fn decode_operation(data: &[u8]) -> Result<Operation, CodecError> {
    let mut cur = Cursor::new(data);
    let op = match cur.u8()? {
        TAG_BLOCK => Operation::Block(read_chunk_hash(&mut cur)?),
        TAG_DATA => {
            let ch = read_chunk_hash(&mut cur)?;
            let len = usize::try_from(ch.length).map_err(|_| CodecError::TooLarge(ch.length))?;
            let payload = cur.bytes(len)?;
            Operation::Data(Chunk {
                offset: ch.offset,
                length: ch.length,
                hash: ch.hash,
                data: Bytes::copy_from_slice(payload),
            })
        }
        tag => return Err(CodecError::UnknownTag(tag)),
    };
    if !cur.is_empty() {
        return Err(CodecError::Trailing(cur.remaining()));
    }
    Ok(op)
}

pub(crate) fn put_chunk_hash(out: &mut Vec<u8>, ch: &ChunkHash) {
    varint::put_u64(out, ch.offset);
    varint::put_u64(out, ch.length);
    out.extend_from_slice(&ch.hash.to_be_bytes());
}

pub(crate) fn read_chunk_hash(cur: &mut Cursor<'_>) -> Result<ChunkHash, VarIntError> {
    Ok(ChunkHash {
        offset: cur.u64()?,
        length: cur.u64()?,
        hash: cur.fixed_u64()?,
    })
}

// ---------------------------------------------------------------------------
// Signature files
// ---------------------------------------------------------------------------

pub fn encode_signature(signature: &[ChunkHash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + MAX_VARINT_LEN + signature.len() * 16);
    out.extend_from_slice(&SIGNATURE_MAGIC);
    varint::put_u64(&mut out, signature.len() as u64);
    for ch in signature {
        put_chunk_hash(&mut out, ch);
    }
    out
}

pub fn decode_signature(data: &[u8]) -> Result<Vec<ChunkHash>, CodecError> {
    let body = data.strip_prefix(&SIGNATURE_MAGIC[..]).ok_or(CodecError::BadMagic)?;
    let mut cur = Cursor::new(body);
    let count = cur.u64()?;
    let mut out = Vec::with_capacity((count as usize).min(body.len() / 10));
    for _ in 0..count {
        out.push(read_chunk_hash(&mut cur)?);
    }
    if !cur.is_empty() {
        return Err(CodecError::Trailing(cur.remaining()));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Delta files
// ---------------------------------------------------------------------------

/// Writes a framed delta file.
pub struct DeltaWriter<W: Write> {
    out: W,
    buf: Vec<u8>,
    written: u64,
}

impl<W: Write> DeltaWriter<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&DELTA_MAGIC)?;
        Ok(Self {
            out,
            buf: Vec::new(),
            written: DELTA_MAGIC.len() as u64,
        })
    }

    pub fn write_operation(&mut self, op: &Operation) -> io::Result<()> {
        self.buf.clear();
        encode_operation(op, &mut self.buf);
        let mut len = [0u8; MAX_VARINT_LEN];
        let n = varint::encode_u64(self.buf.len() as u64, &mut len);
        self.out.write_all(&len[MAX_VARINT_LEN - n..])?;
        self.out.write_all(&self.buf)?;
        self.written += (n + self.buf.len()) as u64;
        Ok(())
    }

    /// Bytes written so far, magic included.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads operations back from a framed delta file.
pub struct DeltaReader<R: Read> {
    input: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> DeltaReader<R> {
    pub fn new(mut input: R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != DELTA_MAGIC {
            return Err(invalid(CodecError::BadMagic));
        }
        Ok(Self {
            input,
            buf: Vec::new(),
            done: false,
        })
    }

    /// Record length prefix, or `None` at a clean end of file.
    fn read_len(&mut self) -> io::Result<Option<u64>> {
        let mut raw = [0u8; MAX_VARINT_LEN];
        for i in 0..MAX_VARINT_LEN {
            let mut byte = [0u8; 1];
            if self.input.read(&mut byte)? == 0 {
                if i == 0 {
                    return Ok(None);
                }
                return Err(invalid(CodecError::VarInt(VarIntError::Underflow)));
            }
            raw[i] = byte[0];
            if byte[0] & 0x80 == 0 {
                let (len, _) = varint::read_u64(&raw[..=i]).map_err(|e| invalid(e.into()))?;
                return Ok(Some(len));
            }
        }
        Err(invalid(CodecError::VarInt(VarIntError::Overflow)))
    }

    fn next_operation(&mut self) -> io::Result<Option<Operation>> {
        let Some(len) = self.read_len()? else {
            return Ok(None);
        };
        let len = usize::try_from(len).map_err(|_| invalid(CodecError::TooLarge(len)))?;
        self.buf.clear();
        (&mut self.input).take(len as u64).read_to_end(&mut self.buf)?;
        if self.buf.len() < len {
            return Err(invalid(CodecError::VarInt(VarIntError::Underflow)));
        }
        decode_operation(&self.buf).map(Some).map_err(invalid)
    }
}

impl<R: Read> Iterator for DeltaReader<R> {
    type Item = io::Result<Operation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.next_operation().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

fn invalid(e: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

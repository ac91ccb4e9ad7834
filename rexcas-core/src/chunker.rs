//! Restartable chunking and ordered reassembly of blobs
//!
//! A [`Chunker`] turns one blob into a finite, strictly ordered sequence of
//! bounded [`Chunk`]s for streaming transfer. It can be repositioned with
//! [`Chunker::seek`] so a failed stream can resume without rereading the
//! whole blob. [`Reassembler`] is the inverse: it accepts chunks in order and
//! writes them to a sink, checking the declared size and optionally the
//! digest.

use crate::digest::Digest;
use crate::error::{CasError, Result};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_INLINE_THRESHOLD, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use bytes::Bytes;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::trace;

/// Where the bytes of a blob come from
pub enum BlobSource {
    /// A file on disk, opened lazily and reopened on seek
    File(PathBuf),
    /// An in-memory buffer
    Memory(Bytes),
    /// A forward-only reader of known length. Can only be "repositioned"
    /// to the offset it is already at.
    Reader {
        reader: Box<dyn Read + Send>,
        size: u64,
    },
}

impl fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobSource::File(path) => f.debug_tuple("File").field(path).finish(),
            BlobSource::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
            BlobSource::Reader { size, .. } => write!(f, "Reader({} bytes)", size),
        }
    }
}

impl From<Bytes> for BlobSource {
    fn from(data: Bytes) -> Self {
        BlobSource::Memory(data)
    }
}

impl From<Vec<u8>> for BlobSource {
    fn from(data: Vec<u8>) -> Self {
        BlobSource::Memory(Bytes::from(data))
    }
}

impl From<PathBuf> for BlobSource {
    fn from(path: PathBuf) -> Self {
        BlobSource::File(path)
    }
}

/// Chunking parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Maximum payload of one chunk
    pub chunk_size: usize,
    /// Files at or below this size are read into memory up front and
    /// emitted as a single chunk
    pub inline_threshold: u64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

impl ChunkerConfig {
    /// Config with the given chunk size and an inline threshold that never
    /// exceeds it
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            inline_threshold: DEFAULT_INLINE_THRESHOLD.min(chunk_size as u64),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(CasError::InvalidConfig(format!(
                "chunk_size must be at least {}, got {}",
                MIN_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(CasError::InvalidConfig(format!(
                "chunk_size must be at most {}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.inline_threshold > self.chunk_size as u64 {
            return Err(CasError::InvalidConfig(format!(
                "inline_threshold ({}) exceeds chunk_size ({})",
                self.inline_threshold, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// One bounded piece of a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data` within the blob
    pub offset: u64,
    /// Payload
    pub data: Bytes,
}

impl Chunk {
    pub fn new(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

enum Source {
    Memory(Bytes),
    File {
        path: PathBuf,
        reader: Option<BufReader<File>>,
    },
    Stream(Box<dyn Read + Send>),
}

/// Restartable chunk producer for a single blob.
///
/// The underlying file handle lives only while chunks are being read: it is
/// dropped after the last chunk, on error, on seek, and with the chunker.
pub struct Chunker {
    source: Source,
    chunk_size: usize,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl Chunker {
    /// Chunk `source` into pieces of at most `chunk_size` bytes
    pub fn for_source(source: impl Into<BlobSource>, chunk_size: usize) -> Result<Self> {
        Self::with_config(source, ChunkerConfig::with_chunk_size(chunk_size))
    }

    pub fn with_config(source: impl Into<BlobSource>, config: ChunkerConfig) -> Result<Self> {
        config.validate()?;

        let (source, total_size) = match source.into() {
            BlobSource::Memory(data) => {
                let size = data.len() as u64;
                (Source::Memory(data), size)
            }
            BlobSource::File(path) => {
                let size = std::fs::metadata(&path)
                    .map_err(|e| CasError::unreadable(&path, e))?
                    .len();
                if size <= config.inline_threshold {
                    let data = std::fs::read(&path).map_err(|e| CasError::unreadable(&path, e))?;
                    if data.len() as u64 != size {
                        return Err(CasError::IncompleteBlob {
                            expected: size,
                            actual: data.len() as u64,
                        });
                    }
                    (Source::Memory(Bytes::from(data)), size)
                } else {
                    (Source::File { path, reader: None }, size)
                }
            }
            BlobSource::Reader { reader, size } => (Source::Stream(reader), size),
        };

        Ok(Self {
            source,
            chunk_size: config.chunk_size,
            total_size,
            offset: 0,
            finished: false,
        })
    }

    /// Declared size of the blob
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Offset of the next chunk
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn has_next(&self) -> bool {
        !self.finished
    }

    /// Produce the next chunk.
    ///
    /// A zero-length blob yields exactly one empty chunk.
    pub fn next_chunk(&mut self) -> Result<Chunk> {
        if self.finished {
            return Err(CasError::ChunkerExhausted {
                total_size: self.total_size,
            });
        }

        let len = (self.total_size - self.offset).min(self.chunk_size as u64) as usize;
        let data = match self.read_region(len) {
            Ok(data) => data,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        let chunk = Chunk::new(self.offset, data);
        self.offset = chunk.end();
        trace!(offset = chunk.offset, len = chunk.len(), "Produced chunk");

        if self.offset == self.total_size {
            self.finished = true;
            self.release();
        }
        Ok(chunk)
    }

    /// Reposition to the start of the blob
    pub fn reset(&mut self) -> Result<()> {
        self.seek(0)
    }

    /// Reposition so the next chunk starts at `offset`
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.total_size {
            return Err(CasError::Seek {
                offset,
                reason: format!("beyond blob size {}", self.total_size),
            });
        }

        match &mut self.source {
            Source::Memory(_) => {}
            Source::File { reader, .. } => {
                // Reopened at the new offset on the next read
                *reader = None;
            }
            Source::Stream(_) => {
                if offset != self.offset {
                    return Err(CasError::Seek {
                        offset,
                        reason: format!(
                            "stream source is not seekable (currently at {})",
                            self.offset
                        ),
                    });
                }
            }
        }

        self.offset = offset;
        self.finished = offset == self.total_size && self.total_size > 0;
        Ok(())
    }

    fn read_region(&mut self, len: usize) -> Result<Bytes> {
        let offset = self.offset;
        let total = self.total_size;
        match &mut self.source {
            Source::Memory(data) => {
                let start = offset as usize;
                Ok(data.slice(start..start + len))
            }
            Source::File { path, reader } => {
                if reader.is_none() {
                    let mut file = File::open(&*path).map_err(|e| CasError::unreadable(&*path, e))?;
                    file.seek(SeekFrom::Start(offset))
                        .map_err(|e| CasError::unreadable(&*path, e))?;
                    *reader = Some(BufReader::new(file));
                }
                let Some(r) = reader.as_mut() else {
                    return Err(CasError::Seek {
                        offset,
                        reason: "file reader unavailable".to_string(),
                    });
                };
                let buf = read_up_to(r, len).map_err(|e| CasError::unreadable(&*path, e))?;
                check_len(&buf, len, offset, total)?;
                Ok(Bytes::from(buf))
            }
            Source::Stream(r) => {
                let buf = read_up_to(r, len)?;
                check_len(&buf, len, offset, total)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    fn release(&mut self) {
        if let Source::File { reader, .. } = &mut self.source {
            *reader = None;
        }
    }
}

impl Iterator for Chunker {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            None
        } else {
            Some(self.next_chunk())
        }
    }
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunker")
            .field("chunk_size", &self.chunk_size)
            .field("total_size", &self.total_size)
            .field("offset", &self.offset)
            .field("finished", &self.finished)
            .finish()
    }
}

fn read_up_to(reader: &mut impl Read, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn check_len(buf: &[u8], len: usize, offset: u64, total: u64) -> Result<()> {
    if buf.len() < len {
        return Err(CasError::IncompleteBlob {
            expected: total,
            actual: offset + buf.len() as u64,
        });
    }
    Ok(())
}

/// Writes an ordered chunk sequence to a sink.
///
/// Chunks must arrive contiguously starting at offset zero. The running hash
/// lets callers verify the result against the expected digest.
pub struct Reassembler<W: Write> {
    sink: W,
    expected_size: u64,
    written: u64,
    hasher: blake3::Hasher,
}

impl<W: Write> Reassembler<W> {
    pub fn new(sink: W, expected_size: u64) -> Self {
        Self {
            sink,
            expected_size,
            written: 0,
            hasher: blake3::Hasher::new(),
        }
    }

    /// Bytes accepted so far; also the offset the next chunk must start at
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.expected_size
    }

    /// Append the next chunk
    pub fn push(&mut self, chunk: &Chunk) -> Result<()> {
        if chunk.offset != self.written {
            return Err(CasError::OutOfOrderChunk {
                expected: self.written,
                actual: chunk.offset,
            });
        }

        let end = chunk.end();
        if end > self.expected_size {
            return Err(CasError::BlobOverflow {
                end,
                expected: self.expected_size,
            });
        }

        self.sink.write_all(&chunk.data)?;
        self.hasher.update(&chunk.data);
        self.written = end;
        Ok(())
    }

    /// Flush the sink and hand it back, failing if bytes are missing
    pub fn finish(mut self) -> Result<W> {
        if self.written != self.expected_size {
            return Err(CasError::IncompleteBlob {
                expected: self.expected_size,
                actual: self.written,
            });
        }
        self.sink.flush()?;
        Ok(self.sink)
    }

    /// Like [`finish`](Self::finish), additionally checking the content
    /// against `expected`
    pub fn finish_verified(self, expected: &Digest) -> Result<W> {
        let actual = Digest::new(*self.hasher.finalize().as_bytes(), self.written);
        if self.written == self.expected_size && actual != *expected {
            return Err(CasError::DigestMismatch {
                expected: *expected,
                actual,
            });
        }
        self.finish()
    }
}

/// Chunk a whole in-memory blob and reassemble it, returning the copy.
pub fn roundtrip(data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let chunker = Chunker::for_source(Bytes::copy_from_slice(data), chunk_size)?;
    let mut reassembler = Reassembler::new(Vec::with_capacity(data.len()), data.len() as u64);
    for chunk in chunker {
        reassembler.push(&chunk?)?;
    }
    reassembler.finish_verified(&Digest::from_content(data))
}

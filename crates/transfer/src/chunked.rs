use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::types::Chunk;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Lowercase hex SHA-256 of a file, streamed in 64 KiB reads.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut source = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut digest = Sha256::new();
    let mut block = [0u8; 64 * 1024];
    loop {
        match source.read(&mut block)? {
            0 => return Ok(hex::encode(digest.finalize())),
            read => digest.update(&block[..read]),
        }
    }
}

fn effective_chunk_size(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Number of chunks needed for `size` bytes (one for an empty file).
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    let chunk_size = effective_chunk_size(chunk_size) as u64;
    size.div_ceil(chunk_size).max(1) as u32
}

/// Splits in-memory content into sequential chunks.
///
/// An empty input yields a single empty chunk so the receiver still sees
/// the transfer declaration.
pub fn split_bytes(data: &[u8], chunk_size: usize) -> impl Iterator<Item = Chunk> + '_ {
    let chunk_size = effective_chunk_size(chunk_size);
    let empty = data.is_empty();
    data.chunks(chunk_size)
        .enumerate()
        .map(move |(i, piece)| Chunk {
            sequence: i as u32,
            offset: (i * chunk_size) as u64,
            data: piece.to_vec(),
        })
        .chain(empty.then(|| Chunk {
            sequence: 0,
            offset: 0,
            data: Vec::new(),
        }))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Sequential reader producing the FILE_CHUNK slices of one file.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: usize,
    offset: u64,
    sequence: u32,
    file_size: u64,
    emitted_empty: bool,
}

impl ChunkReader {
    /// A zero `chunk_size` falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn new(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size: effective_chunk_size(chunk_size),
            offset: 0,
            sequence: 0,
            file_size,
            emitted_empty: false,
        })
    }

    /// `None` once the whole file was handed out. An empty file still
    /// yields one empty chunk.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.file_size == 0 {
            if self.emitted_empty {
                return Ok(None);
            }
            self.emitted_empty = true;
            return Ok(Some(Chunk {
                sequence: 0,
                offset: 0,
                data: Vec::new(),
            }));
        }

        let len = self.remaining().min(self.chunk_size as u64) as usize;
        if len == 0 {
            return Ok(None);
        }

        let mut data = vec![0u8; len];
        self.file.read_exact(&mut data)?;

        let chunk = Chunk {
            sequence: self.sequence,
            offset: self.offset,
            data,
        };
        self.offset += len as u64;
        self.sequence += 1;
        Ok(Some(chunk))
    }

    /// Value for the `chunk_count` field of every chunk.
    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.file_size, self.chunk_size)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn remaining(&self) -> u64 {
        self.file_size - self.offset
    }
}

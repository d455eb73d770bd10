use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::TransferError;
use crate::chunked::{calculate_file_checksum, checksum_bytes};

// ---------------------------------------------------------------------------
// RangeSet
// ---------------------------------------------------------------------------

/// Sorted, non-overlapping half-open byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `[start, end)` and returns how many bytes were not covered before.
    pub fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let before = self.covered();

        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(s, e) in &self.ranges {
            if e < merged.0 {
                out.push((s, e));
            } else if s > merged.1 {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push((s, e));
            } else {
                merged = (merged.0.min(s), merged.1.max(e));
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;

        self.covered() - before
    }

    /// Whether every byte of `[start, end)` is already present.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// Covered parts of `[start, end)`, clipped to it.
    pub fn overlaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.ranges
            .iter()
            .filter(|&&(s, e)| s < end && start < e)
            .map(|&(s, e)| (s.max(start), e.min(end)))
            .collect()
    }

    /// Total bytes covered.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Whether `[0, total)` is fully covered.
    pub fn is_complete(&self, total: u64) -> bool {
        total == 0 || self.contains(0, total)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Sink {
    Memory(Vec<u8>),
    File { path: PathBuf, file: std::fs::File },
}

/// Reassembled content handed over on completion.
#[derive(Debug)]
pub enum Assembled {
    Memory(Vec<u8>),
    File(PathBuf),
}

impl Assembled {
    /// Moves the content to `dest`, creating parent directories.
    pub fn persist_to(self, dest: &Path) -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match self {
            Assembled::Memory(data) => std::fs::write(dest, data),
            Assembled::File(path) => {
                if std::fs::rename(&path, dest).is_err() {
                    std::fs::copy(&path, dest)?;
                    std::fs::remove_file(&path)?;
                }
                Ok(())
            }
        }
    }

    /// Reads the content into memory.
    pub fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        match self {
            Assembled::Memory(data) => Ok(data),
            Assembled::File(path) => {
                let data = std::fs::read(&path)?;
                let _ = std::fs::remove_file(&path);
                Ok(data)
            }
        }
    }

    /// Deletes any backing file.
    pub fn discard(self) {
        if let Assembled::File(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Result of placing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The chunk added this many previously missing bytes.
    New(u64),
    /// Every byte of the chunk was already present.
    Duplicate,
}

/// Order-independent reassembly buffer for one inbound file.
///
/// Chunks are written at their offset into memory or into a spool file;
/// the received ranges decide completion, not the chunk count.
#[derive(Debug)]
pub struct Assembly {
    total: u64,
    received: RangeSet,
    sink: Sink,
}

impl Assembly {
    pub fn in_memory(total: u64) -> Self {
        Self {
            total,
            received: RangeSet::new(),
            sink: Sink::Memory(Vec::new()),
        }
    }

    /// Spools into `path`, which is created (or truncated).
    pub fn spooled(total: u64, path: PathBuf) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            total,
            received: RangeSet::new(),
            sink: Sink::File { path, file },
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn received(&self) -> u64 {
        self.received.covered()
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_complete(self.total)
    }

    /// Writes `data` at `offset`.
    ///
    /// Fails with [`TransferError::Inconsistent`] when the chunk starts or
    /// ends outside `[0, total)`, or when it disagrees with bytes already
    /// received for the same offsets.
    pub fn place(&mut self, offset: u64, data: &[u8]) -> Result<Placement, TransferError> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| TransferError::Inconsistent("chunk offset overflow".into()))?;
        if data.is_empty() {
            if offset > self.total {
                return Err(TransferError::Inconsistent(format!(
                    "offset {offset} beyond size {}",
                    self.total
                )));
            }
            return Ok(Placement::Duplicate);
        }
        if offset >= self.total || end > self.total {
            return Err(TransferError::Inconsistent(format!(
                "chunk [{offset}, {end}) outside declared size {}",
                self.total
            )));
        }
        for (s, e) in self.received.overlaps(offset, end) {
            let incoming = &data[(s - offset) as usize..(e - offset) as usize];
            if !self.stored_matches(s, incoming)? {
                return Err(TransferError::Inconsistent(format!(
                    "chunk [{offset}, {end}) rewrites received bytes [{s}, {e})"
                )));
            }
        }
        if self.received.contains(offset, end) {
            return Ok(Placement::Duplicate);
        }

        match &mut self.sink {
            Sink::Memory(buf) => {
                let end = end as usize;
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(data);
            }
            Sink::File { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
            }
        }
        Ok(Placement::New(self.received.insert(offset, end)))
    }

    fn stored_matches(&mut self, offset: u64, expected: &[u8]) -> Result<bool, TransferError> {
        match &mut self.sink {
            Sink::Memory(buf) => {
                let start = offset as usize;
                Ok(buf.get(start..start + expected.len()) == Some(expected))
            }
            Sink::File { file, .. } => {
                let mut stored = vec![0u8; expected.len()];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut stored)?;
                Ok(stored == expected)
            }
        }
    }

    /// Finalizes the buffer and returns it with its SHA-256 digest.
    pub fn finish(self) -> Result<(Assembled, String), TransferError> {
        match self.sink {
            Sink::Memory(mut buf) => {
                buf.resize(self.total as usize, 0);
                let digest = checksum_bytes(&buf);
                Ok((Assembled::Memory(buf), digest))
            }
            Sink::File { path, mut file } => {
                file.flush()?;
                file.sync_all()?;
                drop(file);
                let digest = calculate_file_checksum(&path)?;
                Ok((Assembled::File(path), digest))
            }
        }
    }

    /// Drops the buffer, deleting any spool file.
    pub fn discard(self) {
        if let Sink::File { path, file } = self.sink {
            drop(file);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to remove spool file: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn range_set_merges_adjacent_and_overlapping() {
        let mut r = RangeSet::new();
        assert_eq!(r.insert(0, 10), 10);
        assert_eq!(r.insert(20, 30), 10);
        assert_eq!(r.len(), 2);
        assert_eq!(r.insert(5, 25), 10);
        assert_eq!(r.len(), 1);
        assert_eq!(r.covered(), 30);
        assert_eq!(r.insert(30, 40), 10);
        assert_eq!(r.len(), 1);
        assert!(r.contains(0, 40));
        assert!(!r.contains(0, 41));
    }

    #[test]
    fn range_set_insert_before_existing() {
        let mut r = RangeSet::new();
        r.insert(50, 60);
        r.insert(0, 10);
        assert_eq!(r.len(), 2);
        assert!(r.contains(0, 10));
        assert!(r.contains(50, 60));
        assert!(!r.contains(10, 50));
    }

    #[test]
    fn range_set_duplicate_adds_nothing() {
        let mut r = RangeSet::new();
        r.insert(0, 10);
        assert_eq!(r.insert(2, 8), 0);
    }

    #[test]
    fn empty_total_is_complete() {
        assert!(RangeSet::new().is_complete(0));
        assert!(Assembly::in_memory(0).is_complete());
    }

    #[test]
    fn memory_assembly_out_of_order() {
        let data = b"0123456789";
        let mut a = Assembly::in_memory(10);
        assert_eq!(a.place(6, &data[6..]).unwrap(), Placement::New(4));
        assert_eq!(a.place(0, &data[..3]).unwrap(), Placement::New(3));
        assert!(!a.is_complete());
        assert_eq!(a.place(3, &data[3..6]).unwrap(), Placement::New(3));
        assert!(a.is_complete());
        let (content, digest) = a.finish().unwrap();
        assert_eq!(digest, checksum_bytes(data));
        assert_eq!(content.into_bytes().unwrap(), data);
    }

    #[test]
    fn duplicate_chunk_is_detected() {
        let mut a = Assembly::in_memory(4);
        a.place(0, b"ab").unwrap();
        assert_eq!(a.place(0, b"ab").unwrap(), Placement::Duplicate);
        assert_eq!(a.received(), 2);
    }

    #[test]
    fn out_of_range_chunk_is_inconsistent() {
        let mut a = Assembly::in_memory(4);
        assert!(matches!(
            a.place(4, b"x"),
            Err(TransferError::Inconsistent(_))
        ));
        assert!(matches!(
            a.place(2, b"xyz"),
            Err(TransferError::Inconsistent(_))
        ));
        assert!(matches!(
            a.place(u64::MAX, b"x"),
            Err(TransferError::Inconsistent(_))
        ));
    }

    #[test]
    fn spooled_assembly_writes_file() {
        let dir = TempDir::new().unwrap();
        let spool = dir.path().join("partial/t1.part");
        let mut a = Assembly::spooled(6, spool.clone()).unwrap();
        a.place(3, b"def").unwrap();
        a.place(0, b"abc").unwrap();
        let (content, digest) = a.finish().unwrap();
        assert_eq!(digest, checksum_bytes(b"abcdef"));

        let dest = dir.path().join("out/map.vpk");
        content.persist_to(&dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        assert!(!spool.exists());
    }

    #[test]
    fn discard_removes_spool() {
        let dir = TempDir::new().unwrap();
        let spool = dir.path().join("t.part");
        let mut a = Assembly::spooled(4, spool.clone()).unwrap();
        a.place(0, b"ab").unwrap();
        assert!(spool.exists());
        a.discard();
        assert!(!spool.exists());
    }

    #[test]
    fn overlap_with_different_bytes_is_inconsistent() {
        let mut a = Assembly::in_memory(8);
        a.place(0, b"abcd").unwrap();
        assert!(matches!(
            a.place(2, b"XXef"),
            Err(TransferError::Inconsistent(_))
        ));
        assert!(matches!(
            a.place(0, b"abcX"),
            Err(TransferError::Inconsistent(_))
        ));
        assert_eq!(a.received(), 4);

        assert_eq!(a.place(2, b"cdef").unwrap(), Placement::New(2));
        assert_eq!(a.place(4, b"efgh").unwrap(), Placement::New(2));
        let (content, _) = a.finish().unwrap();
        assert_eq!(content.into_bytes().unwrap(), b"abcdefgh");
    }

    #[test]
    fn spooled_overlap_is_checked_against_the_file() {
        let dir = TempDir::new().unwrap();
        let mut a = Assembly::spooled(6, dir.path().join("o.part")).unwrap();
        a.place(0, b"abc").unwrap();
        assert!(matches!(
            a.place(1, b"Bcd"),
            Err(TransferError::Inconsistent(_))
        ));
        assert_eq!(a.place(1, b"bcd").unwrap(), Placement::New(1));
        assert_eq!(a.place(0, b"abcd").unwrap(), Placement::Duplicate);
        a.place(4, b"ef").unwrap();
        let (content, digest) = a.finish().unwrap();
        assert_eq!(digest, checksum_bytes(b"abcdef"));
        content.discard();
    }

    #[test]
    fn range_set_reports_clipped_overlaps() {
        let mut r = RangeSet::new();
        r.insert(0, 10);
        r.insert(20, 30);
        assert_eq!(r.overlaps(5, 25), vec![(5, 10), (20, 25)]);
        assert!(r.overlaps(10, 20).is_empty());
    }
}

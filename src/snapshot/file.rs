//! Immutable sorted snapshot artifacts.
//!
//! Layout of a `.snap` file:
//!
//! ```text
//! magic "CNT\0" | version u8 | watermark u64 LE | entry count u64 LE
//! records: kind u8, zigzag varint fields (1 or 3), zigzag varint count
//! crc32 u32 LE over everything above
//! ```

use super::codec;
use crate::error::{CountsError, Result};
use crate::types::{CountEntry, CountsKey, KeyPrefix, TxId};
use memmap2::Mmap;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Magic bytes for snapshot artifacts.
const SNAPSHOT_MAGIC: &[u8; 4] = b"CNT\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// magic + version + watermark + entry count
const HEADER_SIZE: usize = 4 + 1 + 8 + 8;

const CHECKSUM_SIZE: usize = 4;

/// Sorted, immutable mapping from key to count as of a watermark.
#[derive(Debug)]
pub struct Snapshot {
    watermark: TxId,
    keys: Vec<CountsKey>,
    counts: Vec<i64>,
}

impl Snapshot {
    /// Snapshot with no entries.
    pub fn empty(watermark: TxId) -> Self {
        Self {
            watermark,
            keys: Vec::new(),
            counts: Vec::new(),
        }
    }

    /// Build from entries already sorted by key with no duplicates.
    pub(crate) fn from_sorted(watermark: TxId, entries: Vec<(CountsKey, i64)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        let (keys, counts) = entries.into_iter().unzip();
        Self {
            watermark,
            keys,
            counts,
        }
    }

    pub fn watermark(&self) -> TxId {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Raw stored count for a key, `None` if absent.
    ///
    /// Invalid markers are returned as stored.
    pub fn get(&self, key: &CountsKey) -> Option<i64> {
        self.keys
            .binary_search(key)
            .ok()
            .map(|idx| self.counts[idx])
    }

    /// Count for a key, 0 if absent.
    pub fn lookup(&self, key: &CountsKey) -> Result<i64> {
        match self.get(key) {
            Some(count) if count < 0 => Err(CountsError::InvalidCount { key: *key }),
            Some(count) => Ok(count),
            None => Ok(0),
        }
    }

    /// Index range of the entries matching a prefix.
    pub(crate) fn range(&self, prefix: KeyPrefix) -> (usize, usize) {
        let start = self
            .keys
            .partition_point(|k| prefix.locate(k) == Ordering::Less);
        let end = self
            .keys
            .partition_point(|k| prefix.locate(k) != Ordering::Greater);
        (start, end)
    }

    pub(crate) fn entry_at(&self, idx: usize) -> (CountsKey, i64) {
        (self.keys[idx], self.counts[idx])
    }

    /// Stored entries under a prefix, in key order.
    pub fn scan(&self, prefix: KeyPrefix) -> impl Iterator<Item = CountEntry> + '_ {
        let (start, end) = self.range(prefix);
        (start..end).map(move |idx| CountEntry {
            key: self.keys[idx],
            count: self.counts[idx],
        })
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (CountsKey, i64)> + '_ {
        self.keys.iter().copied().zip(self.counts.iter().copied())
    }

    /// Write this snapshot to `path` and fsync it.
    ///
    /// The file must not exist yet; artifacts are never overwritten.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.keys.len() * 6 + CHECKSUM_SIZE);
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.push(SNAPSHOT_VERSION);
        buf.extend_from_slice(&self.watermark.0.to_le_bytes());
        buf.extend_from_slice(&(self.keys.len() as u64).to_le_bytes());
        for (key, count) in self.iter() {
            codec::encode_entry(&key, count, &mut buf);
        }
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let mut writer = BufWriter::new(file);
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Load and validate a snapshot artifact.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(CountsError::CorruptSnapshot(format!(
                "{} is too short ({} bytes)",
                path.display(),
                len
            )));
        }
        // SAFETY: artifacts are immutable once written and only ever replaced
        // by rename of a different file, so the mapping is not mutated under us.
        let map = unsafe { Mmap::map(&file)? };
        Self::decode(&map)
    }

    /// Parse an artifact held in memory.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(CountsError::CorruptSnapshot("artifact too short".into()));
        }
        let (body, tail) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);

        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(CountsError::CorruptSnapshot(format!(
                "checksum mismatch: expected {}, got {}",
                stored, computed
            )));
        }

        if &body[0..4] != SNAPSHOT_MAGIC {
            return Err(CountsError::CorruptSnapshot("invalid snapshot magic".into()));
        }
        if body[4] != SNAPSHOT_VERSION {
            return Err(CountsError::CorruptSnapshot(format!(
                "unsupported snapshot version: {}",
                body[4]
            )));
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&body[5..13]);
        let watermark = TxId(u64::from_le_bytes(word));
        word.copy_from_slice(&body[13..21]);
        let count = u64::from_le_bytes(word) as usize;

        // Every record takes at least three bytes.
        if count > (body.len() - HEADER_SIZE) / 3 {
            return Err(CountsError::CorruptSnapshot(format!(
                "entry count {} exceeds artifact size",
                count
            )));
        }

        let mut keys = Vec::with_capacity(count);
        let mut counts = Vec::with_capacity(count);
        let mut off = HEADER_SIZE;
        for _ in 0..count {
            let (key, value) = codec::decode_entry(body, &mut off)?;
            if let Some(prev) = keys.last() {
                if *prev >= key {
                    return Err(CountsError::CorruptSnapshot(format!(
                        "keys out of order: {} after {}",
                        key, prev
                    )));
                }
            }
            keys.push(key);
            counts.push(value);
        }
        if off != body.len() {
            return Err(CountsError::CorruptSnapshot(format!(
                "{} trailing bytes after last record",
                body.len() - off
            )));
        }

        Ok(Self {
            watermark,
            keys,
            counts,
        })
    }
}

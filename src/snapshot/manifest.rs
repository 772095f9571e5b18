//! The `CURRENT` pointer naming the authoritative snapshot artifact.

use crate::error::{CountsError, Result};
use crate::types::TxId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the manifest file.
const MANIFEST_MAGIC: &[u8; 4] = b"CUR\0";

/// Current manifest format version.
const MANIFEST_VERSION: u8 = 1;

pub(crate) const MANIFEST_FILE: &str = "CURRENT";

const MANIFEST_TEMP_FILE: &str = "CURRENT.tmp";

/// Pointer to the current snapshot artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Generation number; the artifact is `counts-<generation>.snap`.
    pub generation: u64,
    /// Watermark recorded in the artifact header.
    pub watermark: TxId,
}

impl Manifest {
    pub fn artifact_name(generation: u64) -> String {
        format!("counts-{}.snap", generation)
    }

    pub fn artifact_path(&self, dir: &Path) -> PathBuf {
        dir.join(Self::artifact_name(self.generation))
    }

    /// Read the manifest of a store directory, `None` if there is none.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::decode(&bytes).map(Some)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 + 1 + 4 + 4 {
            return Err(CountsError::CorruptSnapshot("manifest truncated".into()));
        }
        if &bytes[0..4] != MANIFEST_MAGIC {
            return Err(CountsError::CorruptSnapshot("invalid manifest magic".into()));
        }
        if bytes[4] != MANIFEST_VERSION {
            return Err(CountsError::InvalidFormat(format!(
                "Unsupported manifest version: {}",
                bytes[4]
            )));
        }

        let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let body = bytes
            .get(9..9 + len)
            .ok_or_else(|| CountsError::CorruptSnapshot("manifest body truncated".into()))?;
        let tail = bytes
            .get(9 + len..9 + len + 4)
            .ok_or_else(|| CountsError::CorruptSnapshot("manifest checksum missing".into()))?;

        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(CountsError::CorruptSnapshot(format!(
                "manifest checksum mismatch: expected {}, got {}",
                stored, computed
            )));
        }

        Ok(rmp_serde::from_slice(body)?)
    }

    /// Atomically replace the manifest: temp file, fsync, rename, fsync dir.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let encoded = rmp_serde::to_vec(self)?;

        let tmp = dir.join(MANIFEST_TEMP_FILE);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(MANIFEST_MAGIC)?;
            file.write_all(&[MANIFEST_VERSION])?;
            file.write_all(&(encoded.len() as u32).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        sync_dir(dir)?;
        Ok(())
    }

    /// Remove the manifest, used when a corrupt store is discarded.
    pub fn remove(dir: &Path) -> Result<()> {
        match fs::remove_file(dir.join(MANIFEST_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse the generation out of an artifact file name.
pub(crate) fn parse_artifact_name(name: &str) -> Option<u64> {
    name.strip_prefix("counts-")?
        .strip_suffix(".snap")?
        .parse()
        .ok()
}

/// Make directory entries (new files, renames) durable.
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

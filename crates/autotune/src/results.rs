//! Shared results vector written by execution units.
//!
//! Every unit writes only its own slot, so slots need visibility, not locking.
//! Thread units share an atomic array; process units share a file of
//! fixed-width little-endian `f64` slots.

use crate::score::Score;
use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SLOT_BYTES: usize = std::mem::size_of::<u64>();

pub trait ScoreSlots: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, index: usize, score: Score) -> Result<()>;

    fn snapshot(&self) -> Result<Vec<Score>>;
}

/// In-memory slots for units running in the orchestrating process.
#[derive(Debug, Clone)]
pub struct ResultsVector {
    slots: Arc<[AtomicU64]>,
}

impl ResultsVector {
    pub fn filled(len: usize, score: Score) -> Self {
        let slots: Vec<AtomicU64> = (0..len).map(|_| AtomicU64::new(score.to_bits())).collect();
        Self {
            slots: slots.into(),
        }
    }

    pub fn get(&self, index: usize) -> Option<Score> {
        self.slots
            .get(index)
            .map(|slot| Score::from_bits(slot.load(Ordering::Acquire)))
    }
}

impl ScoreSlots for ResultsVector {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn store(&self, index: usize, score: Score) -> Result<()> {
        let Some(slot) = self.slots.get(index) else {
            bail!("result slot {index} out of range ({} slots)", self.slots.len());
        };
        slot.store(score.to_bits(), Ordering::Release);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<Score>> {
        Ok(self
            .slots
            .iter()
            .map(|slot| Score::from_bits(slot.load(Ordering::Acquire)))
            .collect())
    }
}

/// File-backed slots shared with worker processes.
#[derive(Debug, Clone)]
pub struct ResultsFile {
    path: PathBuf,
    len: usize,
}

impl ResultsFile {
    pub fn create(path: impl Into<PathBuf>, len: usize, fill: Score) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob: Vec<u8> = (0..len)
            .flat_map(|_| fill.to_bits().to_le_bytes())
            .collect();
        fs::write(&path, blob)
            .with_context(|| format!("failed to create results file {}", path.display()))?;
        Ok(Self { path, len })
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = fs::metadata(&path)
            .with_context(|| format!("failed to open results file {}", path.display()))?
            .len() as usize;
        if bytes % SLOT_BYTES != 0 {
            bail!(
                "results file {} has {} bytes, not a whole number of slots",
                path.display(),
                bytes
            );
        }
        Ok(Self {
            path,
            len: bytes / SLOT_BYTES,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScoreSlots for ResultsFile {
    fn len(&self) -> usize {
        self.len
    }

    fn store(&self, index: usize, score: Score) -> Result<()> {
        if index >= self.len {
            bail!("result slot {index} out of range ({} slots)", self.len);
        }
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start((index * SLOT_BYTES) as u64))?;
        file.write_all(&score.to_bits().to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<Score>> {
        let bytes = fs::read(&self.path)?;
        Ok(bytes
            .chunks_exact(SLOT_BYTES)
            .take(self.len)
            .map(|chunk| {
                let mut raw = [0u8; SLOT_BYTES];
                raw.copy_from_slice(chunk);
                Score::from_bits(u64::from_le_bytes(raw))
            })
            .collect())
    }
}

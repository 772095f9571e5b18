//! Building counts outside the transactional path.
//!
//! Used for the initial build of a fresh or discarded store and for batch
//! imports that write counts directly.

use crate::error::Result;
use crate::types::{CountsKey, TxId};
use crate::updater::CountsSink;
use std::collections::BTreeMap;

/// Source of a full recount, typically a scan over the primary stores.
pub trait Rebuilder: Send + Sync {
    /// Last transaction committed to the primary stores, if known.
    ///
    /// When known, a store whose watermark differs after recovery is rebuilt
    /// and stamped with this id.
    fn last_committed_tx_id(&self) -> Option<TxId>;

    /// Write the absolute count of every key into `builder`.
    fn rebuild(&self, builder: &mut CountsBuilder) -> Result<()>;
}

/// Rebuilder for an empty database.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyRebuild;

impl Rebuilder for EmptyRebuild {
    fn last_committed_tx_id(&self) -> Option<TxId> {
        None
    }

    fn rebuild(&self, _builder: &mut CountsBuilder) -> Result<()> {
        Ok(())
    }
}

/// How a [`CountsBuilder`] treats incoming values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Values are written as-is, replacing the current count.
    Absolute,
    /// Values are added to the current count.
    Delta,
}

/// Direct writer producing a complete set of counts.
#[derive(Debug)]
pub struct CountsBuilder {
    mode: BuildMode,
    counts: BTreeMap<CountsKey, i64>,
}

impl CountsBuilder {
    /// Builder starting from no counts.
    pub fn new(mode: BuildMode) -> Self {
        Self {
            mode,
            counts: BTreeMap::new(),
        }
    }

    /// Builder starting from already resolved counts.
    pub(crate) fn with_base(mode: BuildMode, base: BTreeMap<CountsKey, i64>) -> Self {
        Self { mode, counts: base }
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// Current value of a key inside the builder.
    pub fn get(&self, key: &CountsKey) -> i64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sorted entries with zero counts removed.
    pub(crate) fn into_sorted(self) -> Vec<(CountsKey, i64)> {
        self.counts.into_iter().filter(|(_, v)| *v != 0).collect()
    }
}

impl CountsSink for CountsBuilder {
    fn increment(&mut self, key: CountsKey, value: i64) {
        match self.mode {
            BuildMode::Absolute => {
                self.counts.insert(key, value);
            }
            BuildMode::Delta => {
                let slot = self.counts.entry(key).or_insert(0);
                *slot = slot.wrapping_add(value);
            }
        }
    }
}

//! Per-transaction updater scope and the idempotent apply gate.

use crate::diff::DiffLayer;
use crate::error::Result;
use crate::store::StoreInner;
use crate::types::{CountsKey, TokenId, TxId};
use tracing::debug;

/// Something that accepts count increments.
///
/// Implemented by the transactional [`Updater`] and by the direct
/// [`CountsBuilder`](crate::CountsBuilder), so command translation can feed
/// either one.
pub trait CountsSink {
    fn increment(&mut self, key: CountsKey, delta: i64);

    fn increment_node_count(&mut self, label: TokenId, delta: i64) {
        self.increment(CountsKey::node(label), delta);
    }

    fn increment_relationship_count(
        &mut self,
        start_label: TokenId,
        rel_type: TokenId,
        end_label: TokenId,
        delta: i64,
    ) {
        self.increment(CountsKey::relationship(start_label, rel_type, end_label), delta);
    }
}

/// Result of asking the store to apply a transaction.
#[must_use]
pub enum ApplyOutcome<'a> {
    /// The transaction is new; accumulate its deltas and commit.
    Applied(Updater<'a>),
    /// The transaction is at or below the watermark and has no effect.
    AlreadyApplied,
}

impl<'a> ApplyOutcome<'a> {
    pub fn is_already_applied(&self) -> bool {
        matches!(self, ApplyOutcome::AlreadyApplied)
    }

    /// The updater, if the transaction is new.
    pub fn into_updater(self) -> Option<Updater<'a>> {
        match self {
            ApplyOutcome::Applied(updater) => Some(updater),
            ApplyOutcome::AlreadyApplied => None,
        }
    }
}

/// Private delta accumulator for one transaction.
///
/// Nothing is visible to readers until [`commit`](Updater::commit). Dropping
/// an updater without committing discards its deltas.
pub struct Updater<'a> {
    store: &'a StoreInner,
    tx_id: TxId,
    deltas: DiffLayer,
    closed: bool,
}

impl<'a> Updater<'a> {
    pub(crate) fn new(store: &'a StoreInner, tx_id: TxId) -> Self {
        Self {
            store,
            tx_id,
            deltas: DiffLayer::new(),
            closed: false,
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Accumulated delta for a key within this transaction.
    pub fn pending(&self, key: &CountsKey) -> i64 {
        self.deltas.get(key)
    }

    /// Number of keys this transaction changes.
    pub fn pending_len(&self) -> usize {
        self.deltas.len()
    }

    /// Merge all deltas into the store and advance the watermark to this
    /// transaction.
    ///
    /// Waits for the predecessor transaction if it has not merged yet. Fails
    /// with [`OutOfOrderApply`](crate::CountsError::OutOfOrderApply) if it
    /// does not arrive in time, in which case nothing is applied.
    pub fn commit(mut self) -> Result<()> {
        self.closed = true;
        let deltas = std::mem::take(&mut self.deltas);
        self.store.merge(self.tx_id, deltas)
    }

    /// Discard all deltas explicitly.
    pub fn abandon(mut self) {
        self.closed = true;
        debug!(tx_id = self.tx_id.0, keys = self.deltas.len(), "Abandoned counts updater");
    }
}

impl CountsSink for Updater<'_> {
    fn increment(&mut self, key: CountsKey, delta: i64) {
        self.deltas.apply_delta(key, delta);
    }
}

impl Drop for Updater<'_> {
    fn drop(&mut self) {
        if !self.closed {
            debug!(
                tx_id = self.tx_id.0,
                keys = self.deltas.len(),
                "Counts updater dropped without commit, discarding deltas"
            );
        }
    }
}

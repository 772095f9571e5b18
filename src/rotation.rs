//! Folding diff layers into new snapshots.
//!
//! The merge itself is a plain sorted merge of two key-ordered sequences.
//! Scheduling is done by a background worker fed over a bounded channel, so
//! the commit path can request a rotation without ever blocking on it.

use crate::diff::DiffLayer;
use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::store::StoreInner;
use crate::types::{CountsKey, INVALID_COUNT};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::cmp::Ordering;
use std::iter::Peekable;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Message to the rotation worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationRequest {
    /// The live diff layer grew past the configured threshold.
    DiffFull,
    /// Stop the worker.
    Shutdown,
}

/// Outcome of one rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RotationSummary {
    /// Generation of the snapshot that is current afterwards.
    pub generation: u64,
    /// Entries written to the new snapshot.
    pub entries: usize,
    /// Diff keys folded in.
    pub folded: usize,
    /// Whether a new artifact was written.
    pub written: bool,
}

/// Clamp a merged count: negative results become the sticky invalid marker.
pub(crate) fn finalize_count(key: &CountsKey, count: i64) -> i64 {
    if count < 0 {
        warn!(key = %key, count, "Negative count written as invalid");
        INVALID_COUNT
    } else {
        count
    }
}

/// Sorted merge of a snapshot with a diff layer.
///
/// Counts are summed per key, zero results dropped, negative results turned
/// into [`INVALID_COUNT`]. Keys already invalid in the snapshot stay invalid.
pub fn merge_sorted(snapshot: &Snapshot, diff: &DiffLayer) -> Vec<(CountsKey, i64)> {
    let mut out = Vec::with_capacity(snapshot.len() + diff.len());
    let mut base = snapshot.iter().peekable();
    let mut changes = diff.iter().peekable();

    loop {
        let order = match (base.peek(), changes.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((a, _)), Some((b, _))) => a.cmp(b),
        };
        match order {
            Ordering::Less => push_base(&mut out, &mut base),
            Ordering::Greater => {
                if let Some((key, delta)) = changes.next() {
                    push_merged(&mut out, key, delta);
                }
            }
            Ordering::Equal => {
                if let (Some((key, count)), Some((_, delta))) = (base.next(), changes.next()) {
                    if count < 0 {
                        out.push((key, INVALID_COUNT));
                    } else {
                        push_merged(&mut out, key, count.wrapping_add(delta));
                    }
                }
            }
        }
    }
    out
}

fn push_base<I: Iterator<Item = (CountsKey, i64)>>(
    out: &mut Vec<(CountsKey, i64)>,
    base: &mut Peekable<I>,
) {
    if let Some((key, count)) = base.next() {
        if count != 0 {
            out.push((key, count));
        }
    }
}

fn push_merged(out: &mut Vec<(CountsKey, i64)>, key: CountsKey, count: i64) {
    if count != 0 {
        out.push((key, finalize_count(&key, count)));
    }
}

/// Background thread running rotations on request.
pub(crate) struct RotationWorker {
    sender: Sender<RotationRequest>,
    handle: Option<JoinHandle<()>>,
}

impl RotationWorker {
    /// Create the request channel. The sender is handed to the store before
    /// the worker thread is spawned.
    pub(crate) fn channel() -> (Sender<RotationRequest>, Receiver<RotationRequest>) {
        bounded(1)
    }

    pub(crate) fn spawn(
        store: Arc<StoreInner>,
        sender: Sender<RotationRequest>,
        receiver: Receiver<RotationRequest>,
    ) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name("counts-rotation".into())
            .spawn(move || run(store, receiver))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for an in-flight rotation to finish.
    pub(crate) fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            // A full channel only holds a DiffFull request; the blocking send
            // returns as soon as the worker takes it.
            if let Err(e) = self.sender.send(RotationRequest::Shutdown) {
                debug!(error = %e, "Counts rotation worker already gone");
            }
            if handle.join().is_err() {
                warn!("Counts rotation worker panicked");
            }
        }
    }
}

impl Drop for RotationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(store: Arc<StoreInner>, receiver: Receiver<RotationRequest>) {
    debug!("Counts rotation worker started");
    for request in receiver.iter() {
        match request {
            RotationRequest::Shutdown => break,
            RotationRequest::DiffFull => {
                if !store.diff_over_threshold() {
                    continue;
                }
                // Failures are logged and counted by the store; the frozen
                // layer stays readable and is retried on the next request.
                if let Ok(summary) = store.rotate() {
                    debug!(
                        generation = summary.generation,
                        entries = summary.entries,
                        "Background rotation finished"
                    );
                }
            }
        }
    }
    debug!("Counts rotation worker stopped");
}

/// Ask for a rotation without blocking. Returns whether the request was queued.
pub(crate) fn request(sender: &Sender<RotationRequest>) -> bool {
    match sender.try_send(RotationRequest::DiffFull) {
        Ok(()) => true,
        // A request is already pending; one is enough.
        Err(TrySendError::Full(_)) => false,
        Err(TrySendError::Disconnected(_)) => false,
    }
}

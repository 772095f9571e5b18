//! Main CountsStore tying the snapshot, diff layers and apply gate together.

use crate::commands::{self, CommittedTransaction};
use crate::diff::DiffLayer;
use crate::error::{CountsError, Result};
use crate::rebuild::{BuildMode, CountsBuilder, EmptyRebuild, Rebuilder};
use crate::rotation::{self, finalize_count, RotationRequest, RotationSummary, RotationWorker};
use crate::snapshot::{parse_artifact_name, sync_dir, Manifest, Snapshot, MANIFEST_FILE};
use crate::types::{CountEntry, CountsKey, KeyPrefix, StoreStats, TokenId, TxId};
use crate::updater::{ApplyOutcome, Updater};
use crossbeam_channel::Sender;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the snapshot artifacts.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Never write to disk: no rotation, no rebuild, no file creation.
    pub read_only: bool,

    /// Live diff size that triggers a background rotation.
    pub max_diff_entries: usize,

    /// How long a commit waits for its predecessor transaction.
    pub merge_wait_timeout: Duration,

    /// Run rotations on a background thread when the diff grows large.
    pub background_rotation: bool,

    /// Discard a corrupt snapshot and rebuild instead of failing to open.
    pub rebuild_on_corruption: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./counts"),
            create_if_missing: true,
            read_only: false,
            max_diff_entries: 100_000,
            merge_wait_timeout: Duration::from_secs(5),
            background_rotation: true,
            rebuild_on_corruption: false,
        }
    }
}

/// Output format of [`dump`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpFormat {
    Text,
    Json,
}

type SharedDiff = Arc<RwLock<DiffLayer>>;

/// Consistent pairing of a snapshot with the diff layers on top of it.
struct ReadView {
    snapshot: Arc<Snapshot>,
    /// Layer being folded by a rotation, or left over from a failed one.
    frozen: Option<SharedDiff>,
    live: SharedDiff,
}

impl ReadView {
    fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot,
            frozen: None,
            live: Arc::new(RwLock::new(DiffLayer::new())),
        }
    }

    fn lookup(&self, key: &CountsKey) -> Result<i64> {
        let mut total = self.snapshot.lookup(key)?;
        if let Some(frozen) = &self.frozen {
            total += frozen.read().get(key);
        }
        total += self.live.read().get(key);
        Ok(total)
    }

    fn diff_len(&self) -> usize {
        self.live.read().len()
    }
}

struct GateState {
    /// Highest transaction whose deltas are merged.
    watermark: TxId,
    started: bool,
    needs_rebuild: bool,
}

struct RotationState {
    generation: u64,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    gate: Mutex<GateState>,
    admitted: Condvar,
    view: RwLock<Arc<ReadView>>,
    rotation: Mutex<RotationState>,
    rotation_requests: Option<Sender<RotationRequest>>,
    rebuilder: Box<dyn Rebuilder>,
    rotations: AtomicU64,
    failed_rotations: AtomicU64,
    ignored_transactions: AtomicU64,
}

impl StoreInner {
    fn current_view(&self) -> Arc<ReadView> {
        Arc::clone(&*self.view.read())
    }

    fn dir(&self) -> &Path {
        &self.config.path
    }

    pub(crate) fn begin_apply(&self, tx_id: TxId) -> ApplyOutcome<'_> {
        let gate = self.gate.lock();
        if tx_id <= gate.watermark {
            self.ignored_transactions.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(tx_id = tx_id.0, watermark = gate.watermark.0, "Transaction already applied");
            return ApplyOutcome::AlreadyApplied;
        }
        if gate.needs_rebuild && !gate.started {
            // The rebuild at start covers this transaction.
            self.ignored_transactions.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(tx_id = tx_id.0, "Ignoring transaction on a store awaiting rebuild");
            return ApplyOutcome::AlreadyApplied;
        }
        drop(gate);
        ApplyOutcome::Applied(Updater::new(self, tx_id))
    }

    /// Fold one transaction's deltas into the live layer, in tx id order.
    pub(crate) fn merge(&self, tx_id: TxId, deltas: DiffLayer) -> Result<()> {
        let deadline = Instant::now() + self.config.merge_wait_timeout;
        let mut gate = self.gate.lock();
        loop {
            if tx_id <= gate.watermark || (gate.needs_rebuild && !gate.started) {
                self.ignored_transactions.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(tx_id = tx_id.0, watermark = gate.watermark.0, "Discarding stale merge");
                return Ok(());
            }
            if tx_id == gate.watermark.next() {
                break;
            }
            trace!(tx_id = tx_id.0, watermark = gate.watermark.0, "Waiting for predecessor");
            if self.admitted.wait_until(&mut gate, deadline).timed_out()
                && tx_id > gate.watermark.next()
            {
                warn!(
                    tx_id = tx_id.0,
                    watermark = gate.watermark.0,
                    "Predecessor transaction never merged"
                );
                return Err(CountsError::OutOfOrderApply {
                    tx_id,
                    watermark: gate.watermark,
                });
            }
        }

        let view = self.current_view();
        let live_len = {
            let mut live = view.live.write();
            live.absorb(&deltas);
            live.len()
        };
        gate.watermark = tx_id;
        drop(gate);
        self.admitted.notify_all();

        if live_len > self.config.max_diff_entries {
            if let Some(sender) = &self.rotation_requests {
                if rotation::request(sender) {
                    trace!(live_len, "Requested background rotation");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn diff_over_threshold(&self) -> bool {
        self.current_view().diff_len() > self.config.max_diff_entries
    }

    /// Fold the diff into a new snapshot.
    pub(crate) fn rotate(&self) -> Result<RotationSummary> {
        let mut rotation = self.rotation.lock();
        if self.config.read_only {
            return Ok(RotationSummary {
                generation: rotation.generation,
                ..Default::default()
            });
        }

        // Freeze under the gate so no merge lands in the layer being folded.
        let (snapshot, frozen, watermark) = {
            let gate = self.gate.lock();
            let mut slot = self.view.write();
            let current = Arc::clone(&*slot);

            if current.frozen.is_none()
                && current.live.read().is_empty()
                && gate.watermark == current.snapshot.watermark()
            {
                return Ok(RotationSummary {
                    generation: rotation.generation,
                    entries: current.snapshot.len(),
                    ..Default::default()
                });
            }

            let frozen = match &current.frozen {
                None => Arc::clone(&current.live),
                Some(previous) => {
                    let mut combined = previous.read().clone();
                    combined.absorb(&current.live.read());
                    Arc::new(RwLock::new(combined))
                }
            };
            *slot = Arc::new(ReadView {
                snapshot: Arc::clone(&current.snapshot),
                frozen: Some(Arc::clone(&frozen)),
                live: Arc::new(RwLock::new(DiffLayer::new())),
            });
            (Arc::clone(&current.snapshot), frozen, gate.watermark)
        };

        let started = Instant::now();
        let (entries, folded) = {
            let layer = frozen.read();
            (rotation::merge_sorted(&snapshot, &layer), layer.len())
        };
        let next = Snapshot::from_sorted(watermark, entries);
        let entries = next.len();

        if let Err(e) = self.persist(&next, rotation.generation + 1) {
            self.failed_rotations.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(error = %e, watermark = watermark.0, "Rotation failed, previous snapshot stays current");
            return Err(e);
        }
        let previous = rotation.generation;
        rotation.generation += 1;

        {
            let mut slot = self.view.write();
            let live = Arc::clone(&slot.live);
            *slot = Arc::new(ReadView {
                snapshot: Arc::new(next),
                frozen: None,
                live,
            });
        }
        self.remove_artifact(previous);
        self.rotations.fetch_add(1, AtomicOrdering::Relaxed);

        info!(
            generation = rotation.generation,
            watermark = watermark.0,
            entries,
            folded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rotated counts snapshot"
        );
        Ok(RotationSummary {
            generation: rotation.generation,
            entries,
            folded,
            written: true,
        })
    }

    /// Replace everything with `entries` at `watermark`, dropping all diffs.
    ///
    /// Callers hold the rotation lock and the gate.
    fn install(
        &self,
        rotation: &mut RotationState,
        entries: Vec<(CountsKey, i64)>,
        watermark: TxId,
    ) -> Result<RotationSummary> {
        let snapshot = Snapshot::from_sorted(watermark, entries);
        self.persist(&snapshot, rotation.generation + 1)?;
        let previous = rotation.generation;
        rotation.generation += 1;

        let entries = snapshot.len();
        *self.view.write() = Arc::new(ReadView::new(Arc::new(snapshot)));
        self.remove_artifact(previous);

        Ok(RotationSummary {
            generation: rotation.generation,
            entries,
            folded: 0,
            written: true,
        })
    }

    /// Write an artifact and point the manifest at it.
    ///
    /// On failure the half-written artifact is removed and the previous
    /// manifest stays authoritative.
    fn persist(&self, snapshot: &Snapshot, generation: u64) -> Result<()> {
        let dir = self.dir();
        let path = dir.join(Manifest::artifact_name(generation));
        let manifest = Manifest {
            generation,
            watermark: snapshot.watermark(),
        };

        let written = snapshot
            .write(&path)
            .and_then(|()| sync_dir(dir))
            .map_err(CountsError::RotationIo);
        if let Err(e) = written {
            // An existing file at this name is not ours to remove.
            let foreign = matches!(
                &e,
                CountsError::RotationIo(io) if io.kind() == ErrorKind::AlreadyExists
            );
            if !foreign {
                discard_file(&path);
            }
            return Err(e);
        }

        match manifest.write(dir) {
            Ok(()) => Ok(()),
            Err(e) => settle_manifest_write(dir, &path, generation, e),
        }
    }

    fn remove_artifact(&self, generation: u64) {
        if generation == 0 {
            return;
        }
        let path = self.dir().join(Manifest::artifact_name(generation));
        if let Err(e) = fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "Could not remove retired snapshot");
        }
    }
}

/// Transactional counts store.
///
/// Provides:
/// - Idempotent, ordered application of per-transaction count deltas
/// - Point lookups and prefix scans over snapshot plus diff
/// - Rotation of the diff into durable snapshot artifacts
pub struct CountsStore {
    inner: Arc<StoreInner>,

    /// Background rotation thread, stopped before the lock is released.
    worker: Option<RotationWorker>,

    /// Lock file for exclusive access.
    _lock_file: File,
}

impl CountsStore {
    /// Open or create a store for an empty database and start it.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        let store = Self::open(config, EmptyRebuild)?;
        store.start()?;
        Ok(store)
    }

    /// Open a store without starting it.
    ///
    /// Transactions may be replayed before [`start`](Self::start), which
    /// rebuilds the counts if the store was missing, discarded, or does not
    /// match the rebuilder's last committed transaction.
    pub fn open(config: StoreConfig, rebuilder: impl Rebuilder + 'static) -> Result<Self> {
        if !config.path.exists() {
            if config.read_only || !config.create_if_missing {
                return Err(CountsError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
            info!(path = %config.path.display(), "Created counts store directory");
        }

        let lock_file = Self::acquire_lock(&config.path, config.read_only)?;
        let (snapshot, generation, needs_rebuild) = Self::load_current(&config)?;
        if !config.read_only {
            Self::remove_orphans(&config.path, generation);
        }

        info!(
            path = %config.path.display(),
            watermark = snapshot.watermark().0,
            entries = snapshot.len(),
            generation,
            needs_rebuild,
            "Opened counts store"
        );

        let spawn_worker = config.background_rotation && !config.read_only;
        let (sender, receiver) = RotationWorker::channel();

        let inner = Arc::new(StoreInner {
            gate: Mutex::new(GateState {
                watermark: snapshot.watermark(),
                started: false,
                needs_rebuild,
            }),
            admitted: Condvar::new(),
            view: RwLock::new(Arc::new(ReadView::new(Arc::new(snapshot)))),
            rotation: Mutex::new(RotationState { generation }),
            rotation_requests: spawn_worker.then(|| sender.clone()),
            rebuilder: Box::new(rebuilder),
            rotations: AtomicU64::new(0),
            failed_rotations: AtomicU64::new(0),
            ignored_transactions: AtomicU64::new(0),
            config,
        });

        let worker = if spawn_worker {
            Some(RotationWorker::spawn(Arc::clone(&inner), sender, receiver)?)
        } else {
            None
        };

        Ok(Self {
            inner,
            worker,
            _lock_file: lock_file,
        })
    }

    /// Finish opening: rebuild if needed and accept transactions normally.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut rotation = inner.rotation.lock();
        let mut gate = inner.gate.lock();
        if gate.started {
            return Ok(());
        }

        let expected = inner.rebuilder.last_committed_tx_id();
        let mismatch = expected.is_some_and(|tx| tx != gate.watermark);
        if gate.needs_rebuild || mismatch {
            if inner.config.read_only {
                return Err(CountsError::ReadOnly(format!(
                    "counts store needs rebuilding (needs_rebuild: {}, watermark: {}, last committed: {:?})",
                    gate.needs_rebuild, gate.watermark, expected
                )));
            }

            let watermark = expected.unwrap_or(gate.watermark);
            info!(
                watermark = gate.watermark.0,
                target = watermark.0,
                needs_rebuild = gate.needs_rebuild,
                "Rebuilding counts"
            );

            let mut builder = CountsBuilder::new(BuildMode::Absolute);
            inner
                .rebuilder
                .rebuild(&mut builder)
                .map_err(|e| CountsError::RebuildFailed(e.to_string()))?;
            let entries = finalized(builder);
            inner.install(&mut rotation, entries, watermark)?;

            gate.watermark = watermark;
            gate.needs_rebuild = false;
        }

        gate.started = true;
        drop(gate);
        inner.admitted.notify_all();
        Ok(())
    }

    /// Open an updater for `tx_id`, or learn that it was already applied.
    pub fn begin_apply(&self, tx_id: TxId) -> ApplyOutcome<'_> {
        self.inner.begin_apply(tx_id)
    }

    /// Run `body` inside an updater scope.
    ///
    /// Commits when `body` returns `Ok`, discards when it returns `Err`.
    /// Returns `Ok(None)` if the transaction was already applied.
    pub fn with_updater<T, F>(&self, tx_id: TxId, body: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Updater<'_>) -> Result<T>,
    {
        match self.begin_apply(tx_id) {
            ApplyOutcome::AlreadyApplied => Ok(None),
            ApplyOutcome::Applied(mut updater) => match body(&mut updater) {
                Ok(value) => {
                    updater.commit()?;
                    Ok(Some(value))
                }
                Err(e) => {
                    updater.abandon();
                    Err(e)
                }
            },
        }
    }

    /// Translate and apply one committed transaction.
    ///
    /// Returns whether it had any effect (false when already applied).
    pub fn apply_transaction(&self, tx: &CommittedTransaction) -> Result<bool> {
        let applied = self.with_updater(tx.tx_id, |updater| {
            commands::translate(updater, &tx.commands);
            Ok(())
        })?;
        debug!(
            tx_id = tx.tx_id.0,
            mode = ?tx.mode,
            commands = tx.commands.len(),
            applied = applied.is_some(),
            "Applied transaction to counts"
        );
        Ok(applied.is_some())
    }

    /// Write counts directly, outside any transaction.
    ///
    /// Blocks merges for the duration and persists the result as a new
    /// snapshot at the current watermark.
    pub fn build_direct<F>(&self, mode: BuildMode, body: F) -> Result<RotationSummary>
    where
        F: FnOnce(&mut CountsBuilder) -> Result<()>,
    {
        if self.inner.config.read_only {
            return Err(CountsError::ReadOnly("direct build on a read-only store".into()));
        }
        let inner = &self.inner;
        let mut rotation = inner.rotation.lock();
        let gate = inner.gate.lock();
        if !gate.started {
            return Err(CountsError::NotStarted);
        }

        let view = inner.current_view();
        let mut resolved: BTreeMap<CountsKey, i64> = view.snapshot.iter().collect();
        let mut apply = |layer: &DiffLayer| {
            for (key, delta) in layer.iter() {
                let slot = resolved.entry(key).or_insert(0);
                *slot = slot.wrapping_add(delta);
            }
        };
        if let Some(frozen) = &view.frozen {
            apply(&frozen.read());
        }
        apply(&view.live.read());

        let mut builder = CountsBuilder::with_base(mode, resolved);
        body(&mut builder)?;
        let summary = inner.install(&mut rotation, finalized(builder), gate.watermark)?;
        debug!(mode = ?mode, entries = summary.entries, "Wrote counts directly");
        Ok(summary)
    }

    /// Count for a key, 0 if never counted.
    pub fn lookup(&self, key: &CountsKey) -> Result<i64> {
        self.inner.current_view().lookup(key)
    }

    pub fn node_count(&self, label: TokenId) -> Result<i64> {
        self.lookup(&CountsKey::node(label))
    }

    pub fn relationship_count(
        &self,
        start_label: TokenId,
        rel_type: TokenId,
        end_label: TokenId,
    ) -> Result<i64> {
        self.lookup(&CountsKey::relationship(start_label, rel_type, end_label))
    }

    /// Non-zero counts under a prefix, in key order.
    pub fn scan(&self, prefix: KeyPrefix) -> Scan {
        let view = self.inner.current_view();

        let mut changes = DiffLayer::new();
        if let Some(frozen) = &view.frozen {
            for (key, delta) in frozen.read().range(prefix) {
                changes.apply_delta(key, delta);
            }
        }
        for (key, delta) in view.live.read().range(prefix) {
            changes.apply_delta(key, delta);
        }

        let (pos, end) = view.snapshot.range(prefix);
        Scan {
            snapshot: Arc::clone(&view.snapshot),
            pos,
            end,
            changes: changes.iter().collect::<Vec<_>>().into_iter().peekable(),
        }
    }

    /// Highest transaction whose effects are visible.
    pub fn watermark(&self) -> TxId {
        self.inner.gate.lock().watermark
    }

    /// Watermark of the current durable snapshot.
    pub fn durable_watermark(&self) -> TxId {
        self.inner.current_view().snapshot.watermark()
    }

    /// Fold the diff into a new durable snapshot now.
    ///
    /// A no-op on read-only stores.
    pub fn checkpoint(&self) -> Result<RotationSummary> {
        if !self.is_started() {
            return Err(CountsError::NotStarted);
        }
        self.inner.rotate()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let watermark = self.watermark();
        let generation = self.inner.rotation.lock().generation;
        let view = self.inner.current_view();
        StoreStats {
            watermark,
            durable_watermark: view.snapshot.watermark(),
            generation,
            snapshot_entries: view.snapshot.len() as u64,
            diff_entries: view.diff_len() as u64,
            frozen_entries: view.frozen.as_ref().map_or(0, |f| f.read().len() as u64),
            rotations: self.inner.rotations.load(AtomicOrdering::Relaxed),
            failed_rotations: self.inner.failed_rotations.load(AtomicOrdering::Relaxed),
            ignored_transactions: self.inner.ignored_transactions.load(AtomicOrdering::Relaxed),
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.gate.lock().started
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        self.inner.dir()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Stop background work and release the store.
    ///
    /// Does not rotate; un-rotated deltas are recovered by replay.
    pub fn close(mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }

    fn load_current(config: &StoreConfig) -> Result<(Snapshot, u64, bool)> {
        let dir = &config.path;
        let loaded = Manifest::read(dir).and_then(|manifest| match manifest {
            None => Ok(None),
            Some(manifest) => {
                let snapshot = Snapshot::load(&manifest.artifact_path(dir)).map_err(|e| match e {
                    CountsError::Io(io) => CountsError::CorruptSnapshot(format!(
                        "cannot read {}: {}",
                        Manifest::artifact_name(manifest.generation),
                        io
                    )),
                    other => other,
                })?;
                if snapshot.watermark() != manifest.watermark {
                    return Err(CountsError::CorruptSnapshot(format!(
                        "artifact watermark {} does not match manifest watermark {}",
                        snapshot.watermark(),
                        manifest.watermark
                    )));
                }
                Ok(Some((snapshot, manifest.generation)))
            }
        });

        match loaded {
            Ok(Some((snapshot, generation))) => Ok((snapshot, generation, false)),
            Ok(None) if config.read_only => Err(CountsError::NotInitialized),
            Ok(None) => Ok((Snapshot::empty(TxId::BASE), 0, true)),
            Err(e @ (CountsError::CorruptSnapshot(_) | CountsError::Deserialization(_)))
                if config.rebuild_on_corruption && !config.read_only =>
            {
                warn!(reason = %e, "Counts store is corrupt, discarding it for rebuild");
                Manifest::remove(dir)?;
                Self::remove_orphans(dir, 0);
                Ok((Snapshot::empty(TxId::BASE), 0, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete artifacts other than the current one, left by interrupted
    /// rotations.
    fn remove_orphans(dir: &Path, current: u64) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let orphan = match parse_artifact_name(&name) {
                Some(generation) => generation != current,
                None => name.ends_with(".tmp") && name.starts_with(MANIFEST_FILE),
            };
            if orphan {
                debug!(file = %name, "Removing orphaned counts file");
                discard_file(&entry.path());
            }
        }
    }

    fn acquire_lock(path: &Path, read_only: bool) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(!read_only)
            .open(&lock_path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => CountsError::NotInitialized,
                _ => CountsError::Io(e),
            })?;

        let locked = if read_only {
            FileExt::try_lock_shared(&lock_file)
        } else {
            FileExt::try_lock_exclusive(&lock_file)
        };
        locked.map_err(|_| CountsError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for CountsStore {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

/// Resolve a failed manifest write by what is on disk.
///
/// If the rename went through, `CURRENT` already names the new artifact and
/// the rotation is done. Otherwise the artifact is unreferenced and removed.
fn settle_manifest_write(
    dir: &Path,
    path: &Path,
    generation: u64,
    error: CountsError,
) -> Result<()> {
    let current = Manifest::read(dir).ok().flatten();
    if current.map(|m| m.generation) == Some(generation) {
        warn!(generation, error = %error, "Manifest installed but directory sync failed");
        return Ok(());
    }
    discard_file(path);
    Err(match error {
        CountsError::Io(io) => CountsError::RotationIo(io),
        other => other,
    })
}

fn discard_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Could not remove counts file");
    }
}

fn finalized(builder: CountsBuilder) -> Vec<(CountsKey, i64)> {
    builder
        .into_sorted()
        .into_iter()
        .map(|(key, count)| (key, finalize_count(&key, count)))
        .collect()
}

/// Lazy merge of a snapshot range with the diff entries under a prefix.
///
/// Yields an error for keys holding the invalid marker; other keys keep
/// flowing after it.
pub struct Scan {
    snapshot: Arc<Snapshot>,
    pos: usize,
    end: usize,
    changes: Peekable<std::vec::IntoIter<(CountsKey, i64)>>,
}

impl Scan {
    fn take_base(&mut self) -> Result<(CountsKey, i64)> {
        let (key, count) = self.snapshot.entry_at(self.pos);
        self.pos += 1;
        if count < 0 {
            Err(CountsError::InvalidCount { key })
        } else {
            Ok((key, count))
        }
    }
}

impl Iterator for Scan {
    type Item = Result<CountEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let base = (self.pos < self.end).then(|| self.snapshot.entry_at(self.pos));
            let change = self.changes.peek().copied();

            let merged = match (base, change) {
                (None, None) => return None,
                (Some(_), None) => self.take_base(),
                (None, Some(change)) => {
                    self.changes.next();
                    Ok(change)
                }
                (Some((a, _)), Some((b, delta))) => match a.cmp(&b) {
                    Ordering::Less => self.take_base(),
                    Ordering::Greater => {
                        self.changes.next();
                        Ok((b, delta))
                    }
                    Ordering::Equal => {
                        self.changes.next();
                        self.take_base().map(|(key, count)| (key, count + delta))
                    }
                },
            };

            match merged {
                Err(e) => return Some(Err(e)),
                Ok((_, 0)) => continue,
                Ok((key, count)) => return Some(Ok(CountEntry { key, count })),
            }
        }
    }
}

#[derive(Serialize)]
struct DumpDocument {
    generation: u64,
    watermark: TxId,
    entries: Vec<CountEntry>,
}

/// Print the current snapshot of a store directory.
///
/// Reads without locking and never creates anything; un-rotated deltas of a
/// running store are not included.
pub fn dump<W: Write>(path: &Path, out: &mut W, format: DumpFormat) -> Result<()> {
    let manifest = Manifest::read(path)?.ok_or(CountsError::NotInitialized)?;
    let snapshot = Snapshot::load(&manifest.artifact_path(path))?;

    match format {
        DumpFormat::Text => {
            writeln!(out, "Watermark: {}", snapshot.watermark())?;
            writeln!(out, "Generation: {}", manifest.generation)?;
            for (key, count) in snapshot.iter() {
                writeln!(out, "{} = {}", key, count)?;
            }
        }
        DumpFormat::Json => {
            let document = DumpDocument {
                generation: manifest.generation,
                watermark: snapshot.watermark(),
                entries: snapshot.scan(KeyPrefix::All).collect(),
            };
            serde_json::to_writer_pretty(&mut *out, &document)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ANY_LABEL;
    use crate::updater::CountsSink;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("counts"),
            background_rotation: false,
            merge_wait_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn increment_node(store: &CountsStore, tx: u64, label: i32, delta: i64) {
        if let ApplyOutcome::Applied(mut updater) = store.begin_apply(TxId(tx)) {
            updater.increment_node_count(label, delta);
            updater.commit().unwrap();
        }
    }

    #[test]
    fn test_update_and_read_some_counts() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();

        let mut updater = store.begin_apply(TxId(2)).into_updater().unwrap();
        updater.increment_node_count(1, 10);
        updater.increment_relationship_count(1, 1, 2, 3);
        updater.increment_relationship_count(1, 2, 2, 7);
        updater.commit().unwrap();

        let mut updater = store.begin_apply(TxId(3)).into_updater().unwrap();
        updater.increment_node_count(1, 5);
        updater.increment_relationship_count(1, 1, 2, 2);
        updater.commit().unwrap();

        store.checkpoint().unwrap();

        assert_eq!(store.node_count(1).unwrap(), 15);
        assert_eq!(store.relationship_count(1, 1, 2).unwrap(), 5);
        assert_eq!(store.relationship_count(1, 2, 2).unwrap(), 7);

        let mut updater = store.begin_apply(TxId(4)).into_updater().unwrap();
        updater.increment_node_count(1, -7);
        updater.increment_relationship_count(1, 1, 2, -5);
        updater.increment_relationship_count(1, 2, 2, -2);
        updater.commit().unwrap();

        assert_eq!(store.node_count(1).unwrap(), 8);
        assert_eq!(store.relationship_count(1, 1, 2).unwrap(), 0);
        assert_eq!(store.relationship_count(1, 2, 2).unwrap(), 5);
    }

    #[test]
    fn test_updates_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();

        let mut updater = store.begin_apply(TxId(2)).into_updater().unwrap();
        updater.increment_node_count(ANY_LABEL, 1);
        assert_eq!(updater.pending(&CountsKey::all_nodes()), 1);
        assert_eq!(store.node_count(ANY_LABEL).unwrap(), 0);

        updater.commit().unwrap();
        assert_eq!(store.node_count(ANY_LABEL).unwrap(), 1);
    }

    #[test]
    fn test_dropped_updater_discards() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();

        {
            let mut updater = store.begin_apply(TxId(2)).into_updater().unwrap();
            updater.increment_node_count(3, 4);
        }

        assert_eq!(store.node_count(3).unwrap(), 0);
        assert_eq!(store.watermark(), TxId::BASE);

        // The same transaction can be applied for real afterwards.
        increment_node(&store, 2, 3, 4);
        assert_eq!(store.node_count(3).unwrap(), 4);
    }

    #[test]
    fn test_rotation_keeps_merges_made_after_freeze() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();
        increment_node(&store, 2, 1, 1);

        // Freeze by hand, merge, then finish through a normal rotation.
        {
            let inner = &store.inner;
            let _gate = inner.gate.lock();
            let mut slot = inner.view.write();
            let current = Arc::clone(&*slot);
            *slot = Arc::new(ReadView {
                snapshot: Arc::clone(&current.snapshot),
                frozen: Some(Arc::clone(&current.live)),
                live: Arc::new(RwLock::new(DiffLayer::new())),
            });
        }
        increment_node(&store, 3, 1, 1);
        assert_eq!(store.node_count(1).unwrap(), 2);
        assert_eq!(store.stats().frozen_entries, 1);

        let summary = store.checkpoint().unwrap();
        assert!(summary.written);
        assert_eq!(store.node_count(1).unwrap(), 2);
        assert_eq!(store.stats().diff_entries, 0);
        assert_eq!(store.durable_watermark(), TxId(3));
    }

    #[test]
    fn test_checkpoint_without_changes_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();
        let before = store.stats().generation;

        let summary = store.checkpoint().unwrap();
        assert!(!summary.written);
        assert_eq!(summary.generation, before);
    }

    #[test]
    fn test_scan_merges_layers() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();

        store
            .with_updater(TxId(2), |u| {
                u.increment_relationship_count(ANY_LABEL, 4, ANY_LABEL, 2);
                u.increment_relationship_count(1, 4, ANY_LABEL, 2);
                u.increment_relationship_count(1, 5, ANY_LABEL, 9);
                Ok(())
            })
            .unwrap();
        store.checkpoint().unwrap();
        store
            .with_updater(TxId(3), |u| {
                u.increment_relationship_count(1, 4, ANY_LABEL, -2);
                u.increment_relationship_count(ANY_LABEL, 4, 2, 1);
                Ok(())
            })
            .unwrap();

        let entries: Vec<_> = store
            .scan(KeyPrefix::RelationshipType(4))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            entries,
            vec![
                CountEntry {
                    key: CountsKey::relationship(ANY_LABEL, 4, ANY_LABEL),
                    count: 2
                },
                CountEntry {
                    key: CountsKey::relationship(ANY_LABEL, 4, 2),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_direct_build_modes() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();
        increment_node(&store, 2, 1, 5);

        store
            .build_direct(BuildMode::Delta, |b| {
                b.increment_node_count(1, 2);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.node_count(1).unwrap(), 7);

        store
            .build_direct(BuildMode::Absolute, |b| {
                b.increment_node_count(1, 100);
                b.increment_node_count(2, 3);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.node_count(1).unwrap(), 100);
        assert_eq!(store.node_count(2).unwrap(), 3);
        assert_eq!(store.watermark(), TxId(2));
        assert_eq!(store.durable_watermark(), TxId(2));
    }

    fn sync_failure() -> CountsError {
        CountsError::Io(std::io::Error::new(std::io::ErrorKind::Other, "sync failed"))
    }

    #[test]
    fn test_installed_manifest_completes_rotation() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join(Manifest::artifact_name(2));
        Snapshot::empty(TxId(4)).write(&artifact).unwrap();
        Manifest {
            generation: 2,
            watermark: TxId(4),
        }
        .write(dir.path())
        .unwrap();

        // The rename landed before the error surfaced.
        settle_manifest_write(dir.path(), &artifact, 2, sync_failure()).unwrap();
        assert!(artifact.exists());
        assert!(Snapshot::load(&artifact).is_ok());
    }

    #[test]
    fn test_uninstalled_manifest_discards_artifact() {
        let dir = TempDir::new().unwrap();
        Manifest {
            generation: 1,
            watermark: TxId::BASE,
        }
        .write(dir.path())
        .unwrap();
        let artifact = dir.path().join(Manifest::artifact_name(2));
        Snapshot::empty(TxId(4)).write(&artifact).unwrap();

        let result = settle_manifest_write(dir.path(), &artifact, 2, sync_failure());
        assert!(matches!(result, Err(CountsError::RotationIo(_))));
        assert!(!artifact.exists());
        assert_eq!(Manifest::read(dir.path()).unwrap().unwrap().generation, 1);
    }

    #[test]
    fn test_consecutive_rotations_retire_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let store = CountsStore::open_or_create(test_config(&dir)).unwrap();
        increment_node(&store, 2, 1, 1);
        let first = store.checkpoint().unwrap();

        increment_node(&store, 3, 1, 1);
        let second = store.checkpoint().unwrap();
        assert_eq!(second.generation, first.generation + 1);

        let path = store.path().join(Manifest::artifact_name(second.generation));
        assert!(path.exists());
        assert!(!store
            .path()
            .join(Manifest::artifact_name(first.generation))
            .exists());
        assert_eq!(store.node_count(1).unwrap(), 2);
    }
}

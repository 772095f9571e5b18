//! Translation of decoded write commands into count deltas.
//!
//! Relationship fan-out is fixed: a relationship of type `T` from a node
//! with labels `L1` to a node with labels `L2` touches
//!
//! * `(ANY, ANY, ANY)`, the total relationship count,
//! * `(T, ANY, ANY)`,
//! * `(T, a, ANY)` for every `a` in `L1`,
//! * `(T, ANY, b)` for every `b` in `L2`,
//! * `(T, a, b)` for every pair in `L1 x L2`.
//!
//! Sentinel ids never name a concrete label or type: they are dropped from
//! label sets, and label changes or relationships carrying one are skipped.

use crate::types::{TokenId, TxId, ANY_LABEL, ANY_RELATIONSHIP_TYPE};
use crate::updater::CountsSink;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a transaction reaches the store. Recorded for diagnostics only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationMode {
    /// Committed by a local writer.
    Internal,
    /// Replayed from the transaction log after a crash.
    Recovery,
    /// Received from another instance.
    External,
}

/// A decoded write event relevant to counts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    NodeCreated {
        labels: Vec<TokenId>,
    },
    NodeDeleted {
        labels: Vec<TokenId>,
    },
    LabelAdded {
        label: TokenId,
    },
    LabelRemoved {
        label: TokenId,
    },
    RelationshipCreated {
        rel_type: TokenId,
        start_labels: Vec<TokenId>,
        end_labels: Vec<TokenId>,
    },
    RelationshipDeleted {
        rel_type: TokenId,
        start_labels: Vec<TokenId>,
        end_labels: Vec<TokenId>,
    },
}

/// A committed transaction handed over by the apply layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub tx_id: TxId,
    pub mode: ApplicationMode,
    pub commands: Vec<Command>,
}

impl CommittedTransaction {
    pub fn new(tx_id: TxId, mode: ApplicationMode, commands: Vec<Command>) -> Self {
        Self {
            tx_id,
            mode,
            commands,
        }
    }
}

/// Feed the deltas of every command into `sink`.
pub fn translate<S: CountsSink + ?Sized>(sink: &mut S, commands: &[Command]) {
    for command in commands {
        translate_one(sink, command);
    }
}

fn translate_one<S: CountsSink + ?Sized>(sink: &mut S, command: &Command) {
    match command {
        Command::NodeCreated { labels } => node_delta(sink, labels, 1),
        Command::NodeDeleted { labels } => node_delta(sink, labels, -1),
        Command::LabelAdded { label } => label_delta(sink, *label, 1),
        Command::LabelRemoved { label } => label_delta(sink, *label, -1),
        Command::RelationshipCreated {
            rel_type,
            start_labels,
            end_labels,
        } => relationship_delta(sink, *rel_type, start_labels, end_labels, 1),
        Command::RelationshipDeleted {
            rel_type,
            start_labels,
            end_labels,
        } => relationship_delta(sink, *rel_type, start_labels, end_labels, -1),
    }
}

fn distinct(labels: &[TokenId]) -> Vec<TokenId> {
    let mut out: Vec<TokenId> = labels.iter().copied().filter(|l| *l != ANY_LABEL).collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn node_delta<S: CountsSink + ?Sized>(sink: &mut S, labels: &[TokenId], delta: i64) {
    sink.increment_node_count(ANY_LABEL, delta);
    for label in distinct(labels) {
        sink.increment_node_count(label, delta);
    }
}

fn label_delta<S: CountsSink + ?Sized>(sink: &mut S, label: TokenId, delta: i64) {
    if label == ANY_LABEL {
        warn!(delta, "Skipping label change on the any-label sentinel");
        return;
    }
    sink.increment_node_count(label, delta);
}

fn relationship_delta<S: CountsSink + ?Sized>(
    sink: &mut S,
    rel_type: TokenId,
    start_labels: &[TokenId],
    end_labels: &[TokenId],
    delta: i64,
) {
    if rel_type == ANY_RELATIONSHIP_TYPE {
        warn!(delta, "Skipping relationship with the any-type sentinel");
        return;
    }
    let start = distinct(start_labels);
    let end = distinct(end_labels);

    sink.increment_relationship_count(ANY_LABEL, ANY_RELATIONSHIP_TYPE, ANY_LABEL, delta);
    sink.increment_relationship_count(ANY_LABEL, rel_type, ANY_LABEL, delta);
    for &a in &start {
        sink.increment_relationship_count(a, rel_type, ANY_LABEL, delta);
    }
    for &b in &end {
        sink.increment_relationship_count(ANY_LABEL, rel_type, b, delta);
    }
    for &a in &start {
        for &b in &end {
            sink.increment_relationship_count(a, rel_type, b, delta);
        }
    }
}

//! # Vote Reconciliation
//!
//! Pure logic that turns the per-instance outcomes for one frame into a
//! single decision: accept, accept-with-fault-identified, or reject as
//! irreconcilable.
//!
//! ## Invariants
//!
//! - Value equality is deep structural equality of the captured publication
//!   list, never byte-identity of incidental metadata
//! - A vote is computed fresh per frame and never cached
//! - Trapped instances are always reported faulty; dissenting instances are
//!   identifiable only when a majority group exists

use crate::invoke::Outcome;
use crate::sink::Publication;

/// Voting regime derived from the configured replica count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    /// R = 1: no voting; a trap fails the frame.
    Single,
    /// R = 2: one active slot, one pre-warmed standby; trap-driven failover,
    /// no divergence detection. This is a deliberately weaker guarantee.
    HotStandby,
    /// R >= 3: majority agreement with threshold `ceil((R + 1) / 2)`.
    Majority { replicas: usize },
}

impl Policy {
    pub fn from_replicas(replicas: usize) -> Self {
        match replicas {
            0 | 1 => Self::Single,
            2 => Self::HotStandby,
            n => Self::Majority { replicas: n },
        }
    }

    /// Minimum healthy instances required before dispatch is meaningful.
    pub fn quorum_min(&self) -> usize {
        match self {
            Self::Single | Self::HotStandby => 1,
            Self::Majority { replicas } => majority_threshold(*replicas),
        }
    }
}

fn majority_threshold(replicas: usize) -> usize {
    (replicas + 1).div_ceil(2)
}

/// Severity of the reconciled decision.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Unanimous,
    Majority,
    Irreconcilable,
}

/// The decision derived from one frame's outcome set.
#[derive(Clone, Debug)]
pub struct Vote {
    pub severity: Severity,
    /// Agreement ratio over the instances actually invoked, e.g. "2/3".
    pub agreement: String,
    /// The accepted publication list, absent on rejection.
    pub accepted: Option<Vec<Publication>>,
    /// Slot indices identified as faulty (dissenters and traps).
    pub faulty: Vec<usize>,
}

/// Reconciles an indexed outcome set into a Vote.
///
/// For `Majority`, indices are grouped by structurally equal values; the
/// largest group wins if it reaches the majority threshold computed over the
/// configured replica count. `Unanimous` requires agreement of all configured
/// replicas, so a degraded pool (one slot rebuilding) can reach `Majority` at
/// best. With no winning group the frame is `Irreconcilable` and only trapped
/// indices are identifiable as faulty.
pub fn reconcile(policy: &Policy, outcomes: &[(usize, Outcome)]) -> Vote {
    match policy {
        Policy::Single | Policy::HotStandby => reconcile_single(outcomes),
        Policy::Majority { replicas } => reconcile_majority(*replicas, outcomes),
    }
}

fn reconcile_single(outcomes: &[(usize, Outcome)]) -> Vote {
    match outcomes.first() {
        Some((_, Outcome::Value(value))) => Vote {
            severity: Severity::Unanimous,
            agreement: "1/1".to_string(),
            accepted: Some(value.clone()),
            faulty: Vec::new(),
        },
        Some((index, Outcome::Trap(_))) => Vote {
            severity: Severity::Irreconcilable,
            agreement: "0/1".to_string(),
            accepted: None,
            faulty: vec![*index],
        },
        None => Vote {
            severity: Severity::Irreconcilable,
            agreement: "0/0".to_string(),
            accepted: None,
            faulty: Vec::new(),
        },
    }
}

fn reconcile_majority(replicas: usize, outcomes: &[(usize, Outcome)]) -> Vote {
    let participants = outcomes.len();
    let threshold = majority_threshold(replicas);

    // Group indices by structurally equal values. R is small, so a linear
    // scan per outcome is fine.
    let mut groups: Vec<(&Vec<Publication>, Vec<usize>)> = Vec::new();
    let mut trapped: Vec<usize> = Vec::new();
    for (index, outcome) in outcomes {
        match outcome {
            Outcome::Trap(_) => trapped.push(*index),
            Outcome::Value(value) => match groups.iter_mut().find(|(v, _)| *v == value) {
                Some((_, members)) => members.push(*index),
                None => groups.push((value, vec![*index])),
            },
        }
    }

    let winner = groups.iter().max_by_key(|(_, members)| members.len());
    match winner {
        Some((value, members)) if members.len() >= threshold => {
            let severity = if members.len() == replicas {
                Severity::Unanimous
            } else {
                Severity::Majority
            };
            let faulty = outcomes
                .iter()
                .map(|(index, _)| *index)
                .filter(|index| !members.contains(index))
                .collect();
            Vote {
                severity,
                agreement: format!("{}/{}", members.len(), participants),
                accepted: Some((*value).clone()),
                faulty,
            }
        }
        _ => {
            let best = winner.map(|(_, members)| members.len()).unwrap_or(0);
            Vote {
                severity: Severity::Irreconcilable,
                agreement: format!("{}/{}", best, participants),
                accepted: None,
                faulty: trapped,
            }
        }
    }
}

//! Table-driven phase state machine.
//!
//! Each resource kind declares a closed phase enum and an adjacency table.
//! A target that is not listed for the current phase is illegal; phases with
//! no outgoing edges are terminal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A closed lifecycle phase enum.
pub trait Phase: Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Every variant, in declaration order.
    const ALL: &'static [Self];

    /// Stable lowercase name used in logs, events and conditions.
    fn as_str(&self) -> &'static str;
}

/// An illegal phase transition was requested.
///
/// This signals a controller defect and must never be retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal {kind} transition from '{from}' to '{to}'")]
pub struct TransitionError {
    pub kind: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Record of an applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord<P: Phase> {
    pub from: P,
    pub to: P,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Transition table for one resource kind.
#[derive(Debug, Clone)]
pub struct StateMachine<P: Phase> {
    kind: &'static str,
    transitions: BTreeMap<P, BTreeSet<P>>,
}

impl<P: Phase> StateMachine<P> {
    /// Build a state machine from an adjacency table.
    ///
    /// Phases missing from the table are terminal.
    pub fn new(kind: &'static str, table: &[(P, &[P])]) -> Self {
        let mut transitions: BTreeMap<P, BTreeSet<P>> =
            P::ALL.iter().map(|p| (*p, BTreeSet::new())).collect();

        for (from, targets) in table {
            transitions
                .entry(*from)
                .or_default()
                .extend(targets.iter().copied());
        }

        Self { kind, transitions }
    }

    /// Resource kind this machine governs (used in errors).
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Pure legality check.
    pub fn can_transition_to(&self, current: P, target: P) -> bool {
        self.transitions
            .get(&current)
            .is_some_and(|targets| targets.contains(&target))
    }

    /// Legal targets from `current`.
    pub fn allowed_transitions(&self, current: P) -> impl Iterator<Item = P> + '_ {
        self.transitions
            .get(&current)
            .into_iter()
            .flat_map(|targets| targets.iter().copied())
    }

    /// True when `phase` has no outgoing transitions.
    pub fn is_terminal(&self, phase: P) -> bool {
        self.transitions
            .get(&phase)
            .is_none_or(|targets| targets.is_empty())
    }

    /// Validate a transition and produce its record.
    ///
    /// The caller applies the record; nothing is mutated on failure.
    pub fn execute_transition(
        &self,
        current: P,
        target: P,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<TransitionRecord<P>, TransitionError> {
        if !self.can_transition_to(current, target) {
            return Err(TransitionError {
                kind: self.kind,
                from: current.as_str(),
                to: target.as_str(),
            });
        }

        Ok(TransitionRecord {
            from: current,
            to: target,
            reason: reason.into(),
            at,
        })
    }
}

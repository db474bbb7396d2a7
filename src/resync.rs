//! Replication state machine and the resynchronization gate.
//!
//! The gate is a single per-node flag owned by the state machine and read,
//! never written, by the pre-image writer. It is closed through the
//! data-copy phase and the catch-up portion of log replay, and opens exactly
//! at the transition into steady-state replay. The open point is the single
//! authoritative suppression boundary; there is no finer-grained suppression
//! during catch-up.

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMode {
    /// Full-data resynchronization: cloning current collection state
    /// directly, not from log replay.
    CopyingData,
    /// Replaying log entries accumulated during the data copy. The copy
    /// already reflects their content, so capture stays disabled.
    CatchingUpOnLog,
    /// Normal ongoing application of newly committed log entries.
    SteadyReplay,
    /// Post-crash startup: replaying the durable log from the last
    /// checkpoint. Capture is enabled so lost records are regenerated.
    Recovering,
}

impl NodeMode {
    fn gate_open(self) -> bool {
        matches!(self, NodeMode::SteadyReplay | NodeMode::Recovering)
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeMode::CopyingData => "copying_data",
            NodeMode::CatchingUpOnLog => "catching_up_on_log",
            NodeMode::SteadyReplay => "steady_replay",
            NodeMode::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// Read-only handle on the capture gate. Cheap to clone; the writer holds
/// one and never mutates it.
#[derive(Debug, Clone)]
pub struct ResyncGate {
    open: Arc<AtomicBool>,
}

impl ResyncGate {
    fn new(open: bool) -> Self {
        Self {
            open: Arc::new(AtomicBool::new(open)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn set(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }
}

pub type TransitionObserver = Box<dyn Fn(NodeMode, NodeMode) + Send>;

pub struct ReplicationStateMachine {
    mode: NodeMode,
    gate: ResyncGate,
    observers: Vec<TransitionObserver>,
}

impl fmt::Debug for ReplicationStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationStateMachine")
            .field("mode", &self.mode)
            .field("gate_open", &self.gate.is_open())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ReplicationStateMachine {
    pub fn new(initial: NodeMode) -> Self {
        Self {
            mode: initial,
            gate: ResyncGate::new(initial.gate_open()),
            observers: Vec::new(),
        }
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn gate(&self) -> ResyncGate {
        self.gate.clone()
    }

    /// Registers a callback fired after every successful transition, with
    /// the old and new mode. Fired after the gate value is updated, so an
    /// observer always sees the post-transition gate.
    pub fn subscribe(&mut self, observer: TransitionObserver) {
        self.observers.push(observer);
    }

    pub fn transition(&mut self, to: NodeMode) -> Result<(), TransitionError> {
        let from = self.mode;
        let legal = matches!(
            (from, to),
            (NodeMode::CopyingData, NodeMode::CatchingUpOnLog)
                | (NodeMode::CatchingUpOnLog, NodeMode::SteadyReplay)
                | (NodeMode::Recovering, NodeMode::SteadyReplay)
                | (NodeMode::SteadyReplay, NodeMode::CopyingData)
        );
        if !legal {
            return Err(TransitionError::Illegal { from, to });
        }
        self.mode = to;
        self.gate.set(to.gate_open());
        info!(
            "event=node_mode_transition from={} to={} gate_open={}",
            from,
            to,
            self.gate.is_open()
        );
        for observer in &self.observers {
            observer(from, to);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal node mode transition {from} -> {to}")]
    Illegal { from: NodeMode, to: NodeMode },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn gate_opens_exactly_at_steady_replay() {
        let mut machine = ReplicationStateMachine::new(NodeMode::CopyingData);
        let gate = machine.gate();
        assert!(!gate.is_open());
        machine.transition(NodeMode::CatchingUpOnLog).unwrap();
        assert!(!gate.is_open());
        machine.transition(NodeMode::SteadyReplay).unwrap();
        assert!(gate.is_open());
    }

    #[test]
    fn recovering_node_has_open_gate() {
        let machine = ReplicationStateMachine::new(NodeMode::Recovering);
        assert!(machine.gate().is_open());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut machine = ReplicationStateMachine::new(NodeMode::CopyingData);
        let err = machine.transition(NodeMode::SteadyReplay).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: NodeMode::CopyingData,
                to: NodeMode::SteadyReplay,
            }
        );
        assert_eq!(machine.mode(), NodeMode::CopyingData);
    }

    #[test]
    fn observers_see_post_transition_gate() {
        let mut machine = ReplicationStateMachine::new(NodeMode::CatchingUpOnLog);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_observer = fired.clone();
        let gate = machine.gate();
        machine.subscribe(Box::new(move |from, to| {
            assert_eq!(from, NodeMode::CatchingUpOnLog);
            assert_eq!(to, NodeMode::SteadyReplay);
            assert!(gate.is_open());
            fired_in_observer.fetch_add(1, Ordering::SeqCst);
        }));
        machine.transition(NodeMode::SteadyReplay).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

//! Phase status tracking.
//!
//! Each phase keeps an immutable [`PhaseStatus`] snapshot in an atomic cell.
//! Updates read the current snapshot, compute the successor and publish it with
//! compare-and-swap, retrying on contention. No locks are taken.

use crossbeam::atomic::AtomicCell;

/// One of the three processing phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Line parsing and clustering.
    Intake,
    Transformation,
    /// Unclustering, routing, formatting and writing.
    Output,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Intake => "intake",
            Phase::Transformation => "transformation",
            Phase::Output => "output",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseState {
    NotYetStarted,
    Running,
    Complete,
}

/// Immutable snapshot of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub transformer_index: usize,
    pub state: PhaseState,
    pub record_count: u64,
    pub cluster_count: u64,
}

impl PhaseStatus {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            transformer_index: 0,
            state: PhaseState::NotYetStarted,
            record_count: 0,
            cluster_count: 0,
        }
    }

    fn advanced(self, records: u64, clusters: u64) -> Self {
        Self {
            state: self.state.max(PhaseState::Running),
            record_count: self.record_count + records,
            cluster_count: self.cluster_count + clusters,
            ..self
        }
    }

    fn completed(self) -> Self {
        Self {
            state: PhaseState::Complete,
            ..self
        }
    }
}

/// Result of one successful compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub before: PhaseStatus,
    pub after: PhaseStatus,
}

impl PhaseTransition {
    /// This update moved the phase out of `NotYetStarted`.
    pub fn started(&self) -> bool {
        self.before.state == PhaseState::NotYetStarted && self.after.state != PhaseState::NotYetStarted
    }

    /// This update moved the phase into `Complete`.
    pub fn finished(&self) -> bool {
        self.before.state != PhaseState::Complete && self.after.state == PhaseState::Complete
    }
}

/// Lock-free holder of the current [`PhaseStatus`] of one phase.
#[derive(Debug)]
pub struct PhaseTracker {
    cell: AtomicCell<PhaseStatus>,
}

impl PhaseTracker {
    pub fn new(phase: Phase) -> Self {
        Self {
            cell: AtomicCell::new(PhaseStatus::new(phase)),
        }
    }

    pub fn snapshot(&self) -> PhaseStatus {
        self.cell.load()
    }

    fn update(&self, next: impl Fn(PhaseStatus) -> PhaseStatus) -> PhaseTransition {
        let mut current = self.cell.load();
        loop {
            let proposed = next(current);
            match self.cell.compare_exchange(current, proposed) {
                Ok(before) => {
                    return PhaseTransition {
                        before,
                        after: proposed,
                    }
                },
                Err(actual) => current = actual,
            }
        }
    }

    /// Count processed records and clusters; the first call marks the phase running.
    pub fn advance(&self, records: u64, clusters: u64) -> PhaseTransition {
        self.update(|status| status.advanced(records, clusters))
    }

    /// Mark the phase running without counting anything.
    pub fn start(&self) -> PhaseTransition {
        self.advance(0, 0)
    }

    pub fn complete(&self) -> PhaseTransition {
        self.update(PhaseStatus::completed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_advance_starts_phase() {
        let tracker = PhaseTracker::new(Phase::Intake);
        assert_eq!(tracker.snapshot().state, PhaseState::NotYetStarted);

        let first = tracker.advance(1, 0);
        assert!(first.started());
        assert_eq!(first.after.state, PhaseState::Running);

        let second = tracker.advance(1, 1);
        assert!(!second.started());
        assert_eq!(second.after.record_count, 2);
        assert_eq!(second.after.cluster_count, 1);
    }

    #[test]
    fn test_complete_never_regresses() {
        let tracker = PhaseTracker::new(Phase::Output);
        tracker.start();
        assert!(tracker.complete().finished());
        assert!(!tracker.complete().finished());

        let late = tracker.advance(3, 0);
        assert_eq!(late.after.state, PhaseState::Complete);
        assert!(!late.started());
    }

    #[test]
    fn test_concurrent_advances_are_not_lost() {
        let tracker = Arc::new(PhaseTracker::new(Phase::Transformation));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        tracker.advance(2, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let status = tracker.snapshot();
        assert_eq!(status.record_count, 16_000);
        assert_eq!(status.cluster_count, 8_000);
    }
}

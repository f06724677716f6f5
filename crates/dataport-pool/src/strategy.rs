//! Source selection strategies.

use std::sync::atomic::{AtomicUsize, Ordering};

/// How the pool chooses a source for the next handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Rotate through sources with an atomic counter.
    RoundRobin,
    /// Pick the source with the fewest active handles.
    LeastConnections,
    /// Exclude sources the throttle tracker reports as cooling off,
    /// then rotate among the rest. When every source is throttled, the
    /// pool waits for the soonest expiry. The default.
    #[default]
    ThrottleAware,
}

/// A selectable source as seen by a strategy: its slot index and its
/// current active-handle count. Candidates are pre-filtered to sources
/// with spare capacity (and, for throttle-aware, not throttled).
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub index: usize,
    pub active: usize,
}

impl SelectionStrategy {
    /// Picks one of `candidates`, or `None` when the slice is empty.
    pub(crate) fn pick(&self, candidates: &[Candidate], rotation: &AtomicUsize) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self {
            SelectionStrategy::RoundRobin | SelectionStrategy::ThrottleAware => {
                let turn = rotation.fetch_add(1, Ordering::Relaxed);
                candidates[turn % candidates.len()]
            }
            SelectionStrategy::LeastConnections => *candidates
                .iter()
                .min_by_key(|candidate| candidate.active)
                .expect("non-empty candidates"),
        };
        Some(chosen.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(active: &[usize]) -> Vec<Candidate> {
        active
            .iter()
            .enumerate()
            .map(|(index, active)| Candidate {
                index,
                active: *active,
            })
            .collect()
    }

    #[test]
    fn round_robin_rotates() {
        let rotation = AtomicUsize::new(0);
        let candidates = candidates(&[0, 0, 0]);
        let picks: Vec<_> = (0..6)
            .map(|_| {
                SelectionStrategy::RoundRobin
                    .pick(&candidates, &rotation)
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_connections_picks_minimum() {
        let rotation = AtomicUsize::new(0);
        let candidates = candidates(&[3, 1, 2]);
        assert_eq!(
            SelectionStrategy::LeastConnections.pick(&candidates, &rotation),
            Some(1)
        );
    }

    #[test]
    fn empty_candidates_yield_none() {
        let rotation = AtomicUsize::new(0);
        assert_eq!(
            SelectionStrategy::ThrottleAware.pick(&[], &rotation),
            None
        );
    }

    #[test]
    fn rotation_skips_missing_indices() {
        // Candidates are a filtered subset; rotation must still cover them.
        let rotation = AtomicUsize::new(0);
        let filtered = vec![
            Candidate { index: 1, active: 0 },
            Candidate { index: 3, active: 0 },
        ];
        let picks: Vec<_> = (0..4)
            .map(|_| {
                SelectionStrategy::ThrottleAware
                    .pick(&filtered, &rotation)
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec![1, 3, 1, 3]);
    }
}

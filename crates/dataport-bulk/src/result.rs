//! Bulk operation results.

use std::time::Duration;
use uuid::Uuid;

/// One failed record, keyed by its index in the original input.
#[derive(Debug, Clone)]
pub struct RecordError {
    /// Index into the input collection handed to the executor.
    pub index: usize,
    /// The record identifier, when known.
    pub id: Option<Uuid>,
    /// Server error code, when one was reported.
    pub code: Option<i32>,
    pub message: String,
}

/// Outcome of one bulk operation.
#[derive(Debug, Clone)]
pub struct BulkResult {
    /// Target identifier per input index; `None` for failed or
    /// unattempted records.
    pub target_ids: Vec<Option<Uuid>>,
    /// Per-record errors, ordered by input index.
    pub errors: Vec<RecordError>,
    pub duration: Duration,
}

impl BulkResult {
    pub(crate) fn empty() -> Self {
        Self {
            target_ids: Vec::new(),
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Records written successfully.
    pub fn success_count(&self) -> usize {
        self.target_ids.iter().flatten().count()
    }

    /// Records that failed with a recorded error.
    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }

    /// Whether every input record was written.
    pub fn is_complete_success(&self) -> bool {
        self.errors.is_empty() && self.success_count() == self.target_ids.len()
    }

    /// Pairs of (input index, target id) for successful records.
    pub fn successes(&self) -> impl Iterator<Item = (usize, Uuid)> + '_ {
        self.target_ids
            .iter()
            .enumerate()
            .filter_map(|(index, id)| id.map(|id| (index, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let result = BulkResult {
            target_ids: vec![Some(Uuid::from_u128(1)), None, Some(Uuid::from_u128(3))],
            errors: vec![RecordError {
                index: 1,
                id: None,
                code: Some(-1),
                message: "failed".into(),
            }],
            duration: Duration::from_millis(10),
        };
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failure_count(), 1);
        assert!(!result.is_complete_success());
        let successes: Vec<_> = result.successes().collect();
        assert_eq!(successes[0], (0, Uuid::from_u128(1)));
        assert_eq!(successes[1], (2, Uuid::from_u128(3)));
    }

    #[test]
    fn empty_is_complete() {
        assert!(BulkResult::empty().is_complete_success());
    }
}

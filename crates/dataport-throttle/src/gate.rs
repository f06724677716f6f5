//! Admission gate: a counting-semaphore-equivalent whose capacity is the
//! rate controller's current parallelism, re-read on every acquire.
//!
//! A plain semaphore cannot shrink its permit count when the controller
//! backs off, so the gate keeps its own in-flight counter and parks
//! waiters on a [`Notify`]. A lowered cap takes effect as soon as
//! in-flight batches complete; no stale permits survive a decrease.

use crate::controller::RateController;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Gate admitting at most `controller.current()` concurrent batches.
pub struct AdmissionGate {
    controller: Arc<RateController>,
    in_flight: AtomicUsize,
    notify: Notify,
}

impl AdmissionGate {
    pub fn new(controller: Arc<RateController>) -> Self {
        Self {
            controller,
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Waits until a slot is available under the controller's current
    /// cap and claims it. The returned permit releases on drop.
    pub async fn admit(&self) -> AdmissionPermit<'_> {
        loop {
            if self.try_claim() {
                return AdmissionPermit { gate: self };
            }
            let notified = self.notify.notified();
            // Re-check after registering to avoid a missed wakeup.
            if self.try_claim() {
                return AdmissionPermit { gate: self };
            }
            notified.await;
        }
    }

    /// Claims a slot if one is available right now.
    pub fn try_admit(&self) -> Option<AdmissionPermit<'_>> {
        self.try_claim().then_some(AdmissionPermit { gate: self })
    }

    /// Batches currently admitted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn controller(&self) -> &Arc<RateController> {
        &self.controller
    }

    fn try_claim(&self) -> bool {
        loop {
            let cap = self.controller.current();
            let current = self.in_flight.load(Ordering::Acquire);
            if current >= cap {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// A claimed admission slot. Dropping it releases the slot and wakes
/// waiters.
pub struct AdmissionPermit<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateConfigBuilder;
    use std::time::Duration;

    fn controller() -> Arc<RateController> {
        Arc::new(RateController::new(
            RateConfigBuilder::new()
                .successes_per_increase(1)
                .min_increase_interval(Duration::ZERO)
                .build(),
        ))
    }

    #[tokio::test]
    async fn admits_up_to_current_parallelism() {
        let controller = controller();
        let gate = AdmissionGate::new(Arc::clone(&controller));

        let first = gate.admit().await;
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_admit().is_none());

        drop(first);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.try_admit().is_some());
    }

    #[tokio::test]
    async fn raised_cap_admits_more() {
        let controller = controller();
        let gate = AdmissionGate::new(Arc::clone(&controller));

        controller.record_success(Duration::from_millis(100));
        assert_eq!(controller.current(), 2);

        let _first = gate.admit().await;
        let _second = gate.admit().await;
        assert_eq!(gate.in_flight(), 2);
        assert!(gate.try_admit().is_none());
    }

    #[tokio::test]
    async fn lowered_cap_blocks_new_admissions() {
        let controller = controller();
        let gate = AdmissionGate::new(Arc::clone(&controller));
        for _ in 0..3 {
            controller.record_success(Duration::from_millis(100));
        }
        assert_eq!(controller.current(), 4);

        let first = gate.admit().await;
        let _second = gate.admit().await;

        controller.record_throttle(Duration::from_millis(1));
        assert_eq!(controller.current(), 2);

        // Two in flight at a cap of two: nothing new fits.
        assert!(gate.try_admit().is_none());
        drop(first);
        // Still at cap after one release? 1 in flight, cap 2: fits.
        assert!(gate.try_admit().is_some());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let controller = controller();
        let gate = Arc::new(AdmissionGate::new(controller));

        let permit = gate.admit().await;
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _permit = gate.admit().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_cap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let controller = controller();
        for _ in 0..4 {
            controller.record_success(Duration::from_millis(50));
        }
        let cap = controller.current();
        let gate = Arc::new(AdmissionGate::new(controller));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let gate = Arc::clone(&gate);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.admit().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= cap);
    }
}

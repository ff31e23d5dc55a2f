mod error;
mod ledger;
mod mutations;
mod queries;
mod waitlist;
mod window;
#[cfg(test)]
mod tests;

pub use error::{AdmissionError, Locale};
pub use ledger::{CapacityLedger, SeatDecision};
pub use waitlist::{WaitlistEntry, WaitlistQueue};
pub use window::{check_booking_window, check_cancellation_deadline};

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::clock::{ClockSource, SystemClock};
use crate::daily_limit::{DailyLimitPolicy, LimitsSource};
use crate::membership::MembershipGate;
use crate::model::Booking;
use crate::notify::NotifyHub;
use crate::store::{BookingRepository, WalStore};

/// Result of a cancellation: the cancelled booking and whoever took the seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Booking,
    pub promoted: Option<Booking>,
}

/// The booking admission engine. Every write runs inside one class transaction.
pub struct Engine {
    store: Arc<dyn BookingRepository>,
    gate: Arc<dyn MembershipGate>,
    daily: DailyLimitPolicy,
    clock: Arc<dyn ClockSource>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BookingRepository>,
        gate: Arc<dyn MembershipGate>,
        limits: Arc<dyn LimitsSource>,
        clock: Arc<dyn ClockSource>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            daily: DailyLimitPolicy::new(store.clone(), limits),
            store,
            gate,
            clock,
            notify,
        }
    }

    /// Engine over a `WalStore`, using the store's own memberships and limits.
    pub fn over_store(store: Arc<WalStore>, clock: Arc<dyn ClockSource>, notify: Arc<NotifyHub>) -> Self {
        let gate = store.memberships();
        Self::new(store.clone(), gate, store, clock, notify)
    }

    pub fn with_system_clock(store: Arc<WalStore>) -> Self {
        Self::over_store(store, Arc::new(SystemClock), Arc::new(NotifyHub::new()))
    }

    /// Run a whole transaction, retrying it once if the class lock could not be taken.
    async fn retry_on_conflict<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, AdmissionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdmissionError>>,
    {
        match attempt().await {
            Err(AdmissionError::StorageConflict(class_id)) => {
                warn!("{op}: lock conflict on class {class_id}, retrying");
                metrics::counter!(crate::observability::STORAGE_RETRIES_TOTAL, "op" => op).increment(1);
                attempt().await
            }
            other => other,
        }
    }
}

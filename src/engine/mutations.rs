use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::daily_limit::DailyQuota;
use crate::limits::*;
use crate::model::*;
use crate::notify::BookingEvent;
use crate::observability as obs;
use crate::store::StorageError;

use super::{
    check_booking_window, check_cancellation_deadline, AdmissionError, CancelOutcome, CapacityLedger, Engine,
    SeatDecision, WaitlistQueue,
};

impl Engine {
    /// Admit `member_id` into `class_id` as confirmed or waitlisted.
    pub async fn reserve(
        &self,
        organization_id: &str,
        class_id: Ulid,
        member_id: Ulid,
        actor: Actor,
    ) -> Result<Booking, AdmissionError> {
        let start = Instant::now();
        if let Actor::Member(acting) = actor
            && acting != member_id
        {
            return Err(AdmissionError::Forbidden);
        }
        let result = self
            .retry_on_conflict("reserve", move || self.try_reserve(organization_id, class_id, member_id))
            .await;
        metrics::histogram!(obs::OPERATION_DURATION_SECONDS, "op" => "reserve")
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                metrics::counter!(obs::RESERVATIONS_TOTAL, "outcome" => booking.status.as_str()).increment(1);
                info!(
                    "reserve {organization_id}/{class_id}: member {member_id} {} (booking {}, position {:?})",
                    booking.status, booking.id, booking.waitlist_position
                );
                let event = if booking.status == BookingStatus::Waitlist {
                    BookingEvent::Waitlisted {
                        booking: booking.clone(),
                    }
                } else {
                    BookingEvent::Admitted {
                        booking: booking.clone(),
                    }
                };
                self.notify.send(event);
            }
            Err(e) => {
                metrics::counter!(obs::RESERVATIONS_TOTAL, "outcome" => e.code()).increment(1);
                debug!("reserve {organization_id}/{class_id}: member {member_id} rejected: {e}");
            }
        }
        result
    }

    async fn try_reserve(
        &self,
        organization_id: &str,
        class_id: Ulid,
        member_id: Ulid,
    ) -> Result<Booking, AdmissionError> {
        let Some(mut tx) = self.store.lock_class(organization_id, class_id).await? else {
            return Err(AdmissionError::ClassUnavailable(class_id));
        };
        let class = tx.class().clone();
        if class.organization_id != organization_id || class.is_cancelled {
            return Err(AdmissionError::ClassUnavailable(class_id));
        }

        let now = self.clock.now_ms();
        check_booking_window(&class, now)?;

        if let DailyQuota::Reached {
            limit,
            current_count,
            target_date,
        } = self.daily.check(organization_id, member_id, class.start_time).await?
        {
            return Err(AdmissionError::DailyLimitReached {
                limit,
                current_count,
                target_date,
            });
        }

        let verdict = self.gate.validate(member_id, organization_id, class.start_time).await?;
        if !verdict.can_book {
            return Err(AdmissionError::MembershipInvalid {
                code: verdict.error_code.unwrap_or_else(|| "membership_invalid".into()),
                message: verdict.error_message.unwrap_or_default(),
            });
        }

        if let Some(existing) = tx.active_booking_for(&member_id) {
            return Err(AdmissionError::AlreadyBooked {
                status: existing.status,
            });
        }

        let mut waitlist = WaitlistQueue::load(tx.waitlist_ordered());
        let ledger = CapacityLedger::new(&class, waitlist.len());
        let booking_id = Ulid::new();
        let (status, waitlist_position) = match ledger.decide() {
            SeatDecision::Confirm => (BookingStatus::Confirmed, None),
            SeatDecision::Waitlist { .. } => (BookingStatus::Waitlist, Some(waitlist.enqueue(booking_id))),
            SeatDecision::ClassFull => return Err(AdmissionError::ClassFull),
            SeatDecision::WaitlistFull => return Err(AdmissionError::WaitlistFull),
        };

        let booking = Booking {
            id: booking_id,
            organization_id: organization_id.to_string(),
            class_id,
            member_id,
            status,
            waitlist_position,
            checked_in_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            created_at: now,
        };
        tx.insert_booking(booking.clone())?;
        if let Some(count) = (status == BookingStatus::Confirmed)
            .then(|| ledger.take_seat())
            .flatten()
        {
            tx.update_confirmed_count(count)?;
        }
        tx.commit().await?;
        Ok(booking)
    }

    /// Cancel a booking and, if it held a seat, hand the seat to the waitlist head.
    pub async fn cancel(
        &self,
        organization_id: &str,
        booking_id: Ulid,
        actor: Actor,
        reason: Option<&str>,
    ) -> Result<CancelOutcome, AdmissionError> {
        let start = Instant::now();
        if let Some(r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(AdmissionError::LimitExceeded("cancellation reason too long"));
        }
        let result = self
            .retry_on_conflict("cancel", move || self.try_cancel(organization_id, booking_id, actor, reason))
            .await;
        metrics::histogram!(obs::OPERATION_DURATION_SECONDS, "op" => "cancel")
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::counter!(obs::CANCELLATIONS_TOTAL, "outcome" => "cancelled").increment(1);
                info!(
                    "cancel {organization_id}: booking {booking_id} of member {}",
                    outcome.cancelled.member_id
                );
                self.notify.send(BookingEvent::Cancelled {
                    booking: outcome.cancelled.clone(),
                });
                if let Some(promoted) = &outcome.promoted {
                    metrics::counter!(obs::PROMOTIONS_TOTAL).increment(1);
                    info!(
                        "promoted booking {} (member {}) into class {}",
                        promoted.id, promoted.member_id, promoted.class_id
                    );
                    self.notify.send(BookingEvent::Promoted {
                        booking: promoted.clone(),
                    });
                }
            }
            Err(e) => {
                metrics::counter!(obs::CANCELLATIONS_TOTAL, "outcome" => e.code()).increment(1);
                debug!("cancel {organization_id}: booking {booking_id} rejected: {e}");
            }
        }
        result
    }

    async fn try_cancel(
        &self,
        organization_id: &str,
        booking_id: Ulid,
        actor: Actor,
        reason: Option<&str>,
    ) -> Result<CancelOutcome, AdmissionError> {
        let class_id = self
            .store
            .class_for_booking(&booking_id)
            .ok_or(AdmissionError::BookingNotFound(booking_id))?;
        let Some(mut tx) = self.store.lock_class(organization_id, class_id).await? else {
            return Err(AdmissionError::BookingNotFound(booking_id));
        };
        let booking = match tx.booking(&booking_id) {
            Some(b) if b.organization_id == organization_id => b.clone(),
            _ => return Err(AdmissionError::BookingNotFound(booking_id)),
        };
        if let Actor::Member(acting) = actor
            && acting != booking.member_id
        {
            return Err(AdmissionError::Forbidden);
        }
        if booking.status.is_final() {
            return Err(AdmissionError::AlreadyFinal(booking.status));
        }

        let now = self.clock.now_ms();
        if matches!(actor, Actor::Member(_)) {
            check_cancellation_deadline(tx.class(), now)?;
        }

        let mut waitlist = WaitlistQueue::load(tx.waitlist_ordered());
        let ledger = CapacityLedger::new(tx.class(), waitlist.len());

        tx.update_booking_status(StatusUpdate {
            booking_id,
            status: BookingStatus::Cancelled,
            waitlist_position: None,
            at: now,
            reason: reason.map(str::to_string),
        })?;

        let mut promoted_id = None;
        match booking.status {
            BookingStatus::Confirmed => {
                let mut count = ledger.release_seat();
                if let Some(head) = waitlist.promote_head() {
                    tx.update_booking_status(StatusUpdate {
                        booking_id: head.booking_id,
                        status: BookingStatus::Confirmed,
                        waitlist_position: None,
                        at: now,
                        reason: None,
                    })?;
                    count += 1;
                    promoted_id = Some(head.booking_id);
                }
                tx.update_confirmed_count(count)?;
            }
            BookingStatus::Waitlist => {
                waitlist.remove(&booking_id);
            }
            _ => {}
        }
        tx.bulk_update_waitlist_positions(waitlist.renumber())?;

        let cancelled = tx
            .booking(&booking_id)
            .cloned()
            .ok_or(AdmissionError::BookingNotFound(booking_id))?;
        let promoted = promoted_id.and_then(|id| tx.booking(&id).cloned());
        tx.commit().await?;
        Ok(CancelOutcome { cancelled, promoted })
    }

    /// confirmed → attended.
    pub async fn check_in(&self, organization_id: &str, booking_id: Ulid) -> Result<Booking, AdmissionError> {
        let booking = self
            .retry_on_conflict("check_in", move || {
                self.try_mark_attendance(organization_id, booking_id, BookingStatus::Attended)
            })
            .await?;
        metrics::counter!(obs::ATTENDANCE_MARKS_TOTAL, "status" => "attended").increment(1);
        info!("check-in {organization_id}: booking {booking_id}");
        self.notify.send(BookingEvent::CheckedIn {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    /// confirmed → no_show. The seat stays taken.
    pub async fn mark_no_show(&self, organization_id: &str, booking_id: Ulid) -> Result<Booking, AdmissionError> {
        let booking = self
            .retry_on_conflict("mark_no_show", move || {
                self.try_mark_attendance(organization_id, booking_id, BookingStatus::NoShow)
            })
            .await?;
        metrics::counter!(obs::ATTENDANCE_MARKS_TOTAL, "status" => "no_show").increment(1);
        info!("no-show {organization_id}: booking {booking_id}");
        self.notify.send(BookingEvent::MarkedNoShow {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    async fn try_mark_attendance(
        &self,
        organization_id: &str,
        booking_id: Ulid,
        to: BookingStatus,
    ) -> Result<Booking, AdmissionError> {
        let class_id = self
            .store
            .class_for_booking(&booking_id)
            .ok_or(AdmissionError::BookingNotFound(booking_id))?;
        let Some(mut tx) = self.store.lock_class(organization_id, class_id).await? else {
            return Err(AdmissionError::BookingNotFound(booking_id));
        };
        let from = match tx.booking(&booking_id) {
            Some(b) if b.organization_id == organization_id => b.status,
            _ => return Err(AdmissionError::BookingNotFound(booking_id)),
        };
        if from != BookingStatus::Confirmed {
            return Err(AdmissionError::InvalidTransition { from, to });
        }
        tx.update_booking_status(StatusUpdate {
            booking_id,
            status: to,
            waitlist_position: None,
            at: self.clock.now_ms(),
            reason: None,
        })?;
        let booking = tx
            .booking(&booking_id)
            .cloned()
            .ok_or(AdmissionError::BookingNotFound(booking_id))?;
        tx.commit().await?;
        Ok(booking)
    }

    /// Mark every still-confirmed booking of classes that ended more than `grace` ago.
    /// Returns how many were marked.
    pub async fn sweep_no_shows(&self, organization_id: &str, grace: Ms) -> usize {
        let cutoff = self.clock.now_ms() - grace;
        let mut marked = 0;
        for booking_id in self.store.ended_with_confirmed(cutoff) {
            match self.mark_no_show(organization_id, booking_id).await {
                Ok(_) => marked += 1,
                // Checked in or cancelled between the scan and the lock.
                Err(e) => debug!("no-show sweep skip {booking_id}: {e}"),
            }
        }
        marked
    }

    /// Register a class. Counters and the cancelled flag always start cleared.
    pub async fn schedule_class(&self, mut class: ClassSession) -> Result<ClassSession, AdmissionError> {
        validate_class(&class)?;
        class.confirmed_count = 0;
        class.is_cancelled = false;
        self.store
            .insert_class(class.clone())
            .await
            .map_err(|e| match e {
                StorageError::AlreadyExists(id) => AdmissionError::ClassAlreadyExists(id),
                other => other.into(),
            })?;
        info!(
            "scheduled class {} for {} (capacity {}, waitlist {})",
            class.id,
            class.organization_id,
            class.capacity,
            if class.waitlist_enabled { class.waitlist_capacity } else { 0 }
        );
        Ok(class)
    }

    /// Stop admitting into a class. Existing bookings are kept for history.
    pub async fn cancel_class(&self, organization_id: &str, class_id: Ulid) -> Result<(), AdmissionError> {
        match self.store.class_snapshot(&class_id) {
            Some(state) if state.class.organization_id == organization_id => {}
            _ => return Err(AdmissionError::ClassUnavailable(class_id)),
        }
        self.store.mark_class_cancelled(class_id).await?;
        self.notify.remove(&class_id);
        info!("cancelled class {class_id} for {organization_id}");
        Ok(())
    }
}

fn validate_class(class: &ClassSession) -> Result<(), AdmissionError> {
    if class.capacity == 0 {
        return Err(AdmissionError::InvalidClass("capacity must be at least 1"));
    }
    if class.capacity > MAX_CAPACITY {
        return Err(AdmissionError::LimitExceeded("capacity too large"));
    }
    if class.waitlist_capacity > MAX_WAITLIST_CAPACITY {
        return Err(AdmissionError::LimitExceeded("waitlist capacity too large"));
    }
    if let Some(ref n) = class.name
        && n.len() > MAX_NAME_LEN
    {
        return Err(AdmissionError::LimitExceeded("class name too long"));
    }
    for t in [class.start_time, class.end_time] {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
            return Err(AdmissionError::LimitExceeded("timestamp out of range"));
        }
    }
    if class.end_time <= class.start_time {
        return Err(AdmissionError::InvalidClass("class must end after it starts"));
    }
    if class.end_time - class.start_time > MAX_CLASS_DURATION_MS {
        return Err(AdmissionError::LimitExceeded("class too long"));
    }
    if class.booking_opens_hours.is_some_and(|h| h > MAX_WINDOW_HOURS)
        || class.cancellation_deadline_hours > MAX_WINDOW_HOURS
    {
        return Err(AdmissionError::LimitExceeded("window too wide"));
    }
    if class.booking_closes_minutes > MAX_CLOSES_MINUTES {
        return Err(AdmissionError::LimitExceeded("booking close offset too large"));
    }
    if let Some(opens_at) = class.booking_opens_at()
        && opens_at > class.booking_closes_at()
    {
        return Err(AdmissionError::InvalidClass("booking opens after it closes"));
    }
    Ok(())
}

//! Per-organization cap on classes per member per local calendar day.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;
use crate::store::{BookingRepository, StorageError};

/// Supplies `OrganizationBookingLimits` for an organization.
#[async_trait]
pub trait LimitsSource: Send + Sync {
    async fn booking_limits(&self, organization_id: &str) -> Result<OrganizationBookingLimits, StorageError>;
}

/// Calendar date of `at` as seen in `tz`.
pub fn local_date(at: Ms, tz: Tz) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(at)
        .single()
        .map(|utc| utc.with_timezone(&tz).date_naive())
}

/// Non-cancelled bookings whose class falls on `target` in `tz`.
pub fn count_on_date(booked: &[BookedClass], target: NaiveDate, tz: Tz) -> u32 {
    booked
        .iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .filter(|b| local_date(b.class_start, tz) == Some(target))
        .count() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyQuota {
    Unlimited,
    Available {
        limit: u32,
        current_count: u32,
        target_date: NaiveDate,
    },
    Reached {
        limit: u32,
        current_count: u32,
        target_date: NaiveDate,
    },
}

pub struct DailyLimitPolicy {
    repo: Arc<dyn BookingRepository>,
    limits: Arc<dyn LimitsSource>,
}

impl DailyLimitPolicy {
    pub fn new(repo: Arc<dyn BookingRepository>, limits: Arc<dyn LimitsSource>) -> Self {
        Self { repo, limits }
    }

    /// Re-derived on every call, so cancellations are reflected immediately.
    pub async fn count(
        &self,
        organization_id: &str,
        member_id: Ulid,
        target: NaiveDate,
        tz: Tz,
    ) -> Result<u32, StorageError> {
        let Some(midnight) = target.and_hms_opt(0, 0, 0) else {
            return Ok(0);
        };
        // UTC offsets stay within ±14h, so a day of slack on each side covers every zone.
        let midnight_utc = midnight.and_utc().timestamp_millis();
        let from = midnight_utc - 24 * HOUR_MS;
        let to = midnight_utc + 48 * HOUR_MS;
        let booked = self
            .repo
            .member_bookings_between(organization_id, member_id, from, to)
            .await?;
        Ok(count_on_date(&booked, target, tz))
    }

    pub async fn check(
        &self,
        organization_id: &str,
        member_id: Ulid,
        class_start: Ms,
    ) -> Result<DailyQuota, StorageError> {
        let limits = self.limits.booking_limits(organization_id).await?;
        let Some(limit) = limits.max_classes_per_day else {
            return Ok(DailyQuota::Unlimited);
        };
        let Some(target_date) = local_date(class_start, limits.timezone) else {
            return Ok(DailyQuota::Unlimited);
        };
        let current_count = self
            .count(organization_id, member_id, target_date, limits.timezone)
            .await?;
        if current_count >= limit {
            Ok(DailyQuota::Reached {
                limit,
                current_count,
                target_date,
            })
        } else {
            Ok(DailyQuota::Available {
                limit,
                current_count,
                target_date,
            })
        }
    }
}

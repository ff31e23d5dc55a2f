use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Waitlist,
    Cancelled,
    Attended,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Waitlist => "waitlist",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Attended => "attended",
            BookingStatus::NoShow => "no_show",
        }
    }

    /// `cancelled`, `attended` and `no_show` never change again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            BookingStatus::Cancelled | BookingStatus::Attended | BookingStatus::NoShow
        )
    }

    /// Statuses that occupy a seat and count towards `confirmed_count`.
    pub fn holds_seat(&self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Attended | BookingStatus::NoShow
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "waitlist" => Ok(BookingStatus::Waitlist),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "attended" => Ok(BookingStatus::Attended),
            "no_show" => Ok(BookingStatus::NoShow),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub organization_id: String,
    pub class_id: Ulid,
    pub member_id: Ulid,
    pub status: BookingStatus,
    /// Present iff `status == Waitlist`.
    pub waitlist_position: Option<u32>,
    pub checked_in_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

// ── Classes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: Ulid,
    pub organization_id: String,
    pub name: Option<String>,
    pub start_time: Ms,
    pub end_time: Ms,
    pub capacity: u32,
    pub waitlist_enabled: bool,
    pub waitlist_capacity: u32,
    /// `None` means reservations are accepted any time before the close.
    pub booking_opens_hours: Option<u32>,
    pub booking_closes_minutes: u32,
    pub cancellation_deadline_hours: u32,
    pub is_cancelled: bool,
    /// Seats held by confirmed, attended and no-show bookings.
    pub confirmed_count: u32,
}

impl ClassSession {
    /// Last instant at which a reservation is still accepted.
    pub fn booking_closes_at(&self) -> Ms {
        self.start_time - self.booking_closes_minutes as Ms * MINUTE_MS
    }

    pub fn booking_opens_at(&self) -> Option<Ms> {
        self.booking_opens_hours
            .map(|h| self.start_time - h as Ms * HOUR_MS)
    }

    /// Last instant at which a member may cancel on their own.
    pub fn cancellation_deadline(&self) -> Ms {
        self.start_time - self.cancellation_deadline_hours as Ms * HOUR_MS
    }
}

/// A class together with every booking ever made for it, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassState {
    pub class: ClassSession,
    pub bookings: Vec<Booking>,
}

impl ClassState {
    pub fn new(class: ClassSession) -> Self {
        Self {
            class,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    pub fn active_booking_for(&self, member_id: &Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.member_id == *member_id && b.is_active())
    }

    /// Waitlisted bookings, head first.
    pub fn waitlist_ordered(&self) -> Vec<&Booking> {
        let mut waiting: Vec<&Booking> = self
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Waitlist)
            .collect();
        waiting.sort_by_key(|b| (b.waitlist_position.unwrap_or(u32::MAX), b.created_at, b.id));
        waiting
    }

    pub fn waitlist_len(&self) -> usize {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Waitlist)
            .count()
    }

    /// Apply one committed change. Shared by live transactions and WAL replay.
    pub fn apply(&mut self, change: &Change) {
        match change {
            Change::BookingInserted(booking) => self.bookings.push(booking.clone()),
            Change::BookingStatusChanged(update) => {
                if let Some(b) = self.booking_mut(&update.booking_id) {
                    b.status = update.status;
                    b.waitlist_position = update.waitlist_position;
                    match update.status {
                        BookingStatus::Cancelled => {
                            b.cancelled_at = Some(update.at);
                            b.cancellation_reason = update.reason.clone();
                        }
                        BookingStatus::Attended => b.checked_in_at = Some(update.at),
                        _ => {}
                    }
                }
            }
            Change::ConfirmedCountSet(count) => self.class.confirmed_count = *count,
            Change::WaitlistRenumbered(positions) => {
                for (id, pos) in positions {
                    if let Some(b) = self.booking_mut(id) {
                        b.waitlist_position = Some(*pos);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    pub waitlist_position: Option<u32>,
    pub at: Ms,
    pub reason: Option<String>,
}

/// One row-level write inside a class transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    BookingInserted(Booking),
    BookingStatusChanged(StatusUpdate),
    ConfirmedCountSet(u32),
    /// Bulk `(booking id, new position)` rewrite.
    WaitlistRenumbered(Vec<(Ulid, u32)>),
}

// ── Collaborator state ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipStatus {
    Active,
    Suspended,
    Cancelled,
}

impl FromStr for MembershipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(MembershipStatus::Active),
            "suspended" => Ok(MembershipStatus::Suspended),
            "cancelled" | "canceled" => Ok(MembershipStatus::Cancelled),
            other => Err(format!("unknown membership status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub member_id: Ulid,
    pub status: MembershipStatus,
    pub valid_from: Ms,
    pub valid_until: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrganizationBookingLimits {
    /// `None` = unlimited.
    pub max_classes_per_day: Option<u32>,
    pub timezone: Tz,
}

impl Default for OrganizationBookingLimits {
    fn default() -> Self {
        Self {
            max_classes_per_day: None,
            timezone: Tz::UTC,
        }
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|_| format!("unknown timezone: {name}"))
}

/// Who is performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Front-desk or admin user; may act on any member of the organization.
    Staff,
    /// Self-service member; may only act on their own bookings.
    Member(Ulid),
}

/// A member's booking joined with its class start, for daily-limit counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedClass {
    pub booking_id: Ulid,
    pub class_id: Ulid,
    pub status: BookingStatus,
    pub class_start: Ms,
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassScheduled {
        class: ClassSession,
    },
    ClassCancelled {
        id: Ulid,
    },
    /// Every change of one class transaction, written as a single record.
    ClassCommitted {
        class_id: Ulid,
        changes: Vec<Change>,
    },
    MembershipSet {
        membership: Membership,
    },
    LimitsConfigured {
        max_classes_per_day: Option<u32>,
        timezone: String,
    },
}

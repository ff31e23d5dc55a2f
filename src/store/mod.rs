//! Transactional repository seam between the admission engine and persistence.
//!
//! A [`ClassTransaction`] is the equivalent of a database transaction that opened
//! with `SELECT … FROM classes WHERE id = $1 FOR UPDATE`: it holds the class
//! exclusively until it is committed or dropped. Dropping without commit discards
//! every staged write.

mod wal_store;

pub use wal_store::{StoreOptions, WalStore};

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Lock wait or serialization failure. Safe to retry the whole transaction.
    #[error("class {0} is locked by a concurrent transaction")]
    Conflict(Ulid),
    /// The commit could not be made durable before its deadline. Nothing was written.
    #[error("storage round-trip timed out")]
    Timeout,
    #[error("unique constraint violated: member {member_id} already holds an active booking for class {class_id}")]
    UniqueViolation { class_id: Ulid, member_id: Ulid },
    #[error("check constraint violated: {0}")]
    CheckViolation(&'static str),
    #[error("row not found: {0}")]
    RowNotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            StorageError::Timeout
        } else {
            StorageError::Io(e.to_string())
        }
    }
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Fetch a class and lock it for the lifetime of the returned transaction.
    /// `Ok(None)` when the class does not exist in this organization.
    async fn lock_class(
        &self,
        organization_id: &str,
        class_id: Ulid,
    ) -> Result<Option<Box<dyn ClassTransaction>>, StorageError>;

    fn class_for_booking(&self, booking_id: &Ulid) -> Option<Ulid>;

    /// Unlocked read of a member's bookings whose class starts in `[from, to)`.
    async fn member_bookings_between(
        &self,
        organization_id: &str,
        member_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<BookedClass>, StorageError>;

    /// Last committed state of a class.
    fn class_snapshot(&self, class_id: &Ulid) -> Option<ClassState>;

    /// Bookings still `confirmed` in classes that ended before `ended_before`.
    fn ended_with_confirmed(&self, ended_before: Ms) -> Vec<Ulid>;

    async fn insert_class(&self, class: ClassSession) -> Result<(), StorageError>;

    async fn mark_class_cancelled(&self, class_id: Ulid) -> Result<(), StorageError>;
}

/// Row-level operations inside one locked class. Reads observe the transaction's
/// own staged writes.
#[async_trait]
pub trait ClassTransaction: Send {
    fn class(&self) -> &ClassSession;

    fn booking(&self, booking_id: &Ulid) -> Option<&Booking>;

    fn active_booking_for(&self, member_id: &Ulid) -> Option<&Booking>;

    fn waitlist_ordered(&self) -> Vec<&Booking>;

    fn insert_booking(&mut self, booking: Booking) -> Result<(), StorageError>;

    fn update_booking_status(&mut self, update: StatusUpdate) -> Result<(), StorageError>;

    fn update_confirmed_count(&mut self, count: u32) -> Result<(), StorageError>;

    fn bulk_update_waitlist_positions(&mut self, positions: Vec<(Ulid, u32)>) -> Result<(), StorageError>;

    /// Make every staged write durable in one step and release the lock.
    async fn commit(&mut self) -> Result<(), StorageError>;
}

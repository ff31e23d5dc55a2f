use crate::model::ClassSession;

/// Seat accounting for one locked class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityLedger {
    pub confirmed_count: u32,
    pub capacity: u32,
    pub waitlist_enabled: bool,
    pub waitlist_len: u32,
    pub waitlist_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatDecision {
    Confirm,
    Waitlist { position: u32 },
    ClassFull,
    WaitlistFull,
}

impl CapacityLedger {
    pub fn new(class: &ClassSession, waitlist_len: usize) -> Self {
        Self {
            confirmed_count: class.confirmed_count,
            capacity: class.capacity,
            waitlist_enabled: class.waitlist_enabled,
            waitlist_len: waitlist_len as u32,
            waitlist_capacity: class.waitlist_capacity,
        }
    }

    pub fn has_free_seat(&self) -> bool {
        self.confirmed_count < self.capacity
    }

    pub fn decide(&self) -> SeatDecision {
        if self.has_free_seat() {
            SeatDecision::Confirm
        } else if !self.waitlist_enabled {
            SeatDecision::ClassFull
        } else if self.waitlist_len < self.waitlist_capacity {
            SeatDecision::Waitlist {
                position: self.waitlist_len + 1,
            }
        } else {
            SeatDecision::WaitlistFull
        }
    }

    /// Count after taking one seat. `None` if the class is already full.
    pub fn take_seat(&self) -> Option<u32> {
        self.has_free_seat().then_some(self.confirmed_count + 1)
    }

    pub fn release_seat(&self) -> u32 {
        self.confirmed_count.saturating_sub(1)
    }
}

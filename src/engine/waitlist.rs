use ulid::Ulid;

use crate::model::Booking;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitlistEntry {
    pub booking_id: Ulid,
    pub position: u32,
}

/// FIFO of waitlisted bookings for one class, head first.
///
/// Built from the locked class, mutated in memory, and then flushed back with one
/// bulk position update from [`WaitlistQueue::renumber`].
#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    entries: Vec<WaitlistEntry>,
}

impl WaitlistQueue {
    /// `ordered` must already be head first.
    pub fn load<'a>(ordered: impl IntoIterator<Item = &'a Booking>) -> Self {
        Self {
            entries: ordered
                .into_iter()
                .map(|b| WaitlistEntry {
                    booking_id: b.id,
                    position: b.waitlist_position.unwrap_or(0),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append at the tail; returns the assigned position.
    pub fn enqueue(&mut self, booking_id: Ulid) -> u32 {
        let position = self.entries.len() as u32 + 1;
        self.entries.push(WaitlistEntry {
            booking_id,
            position,
        });
        position
    }

    pub fn peek_head(&self) -> Option<&WaitlistEntry> {
        self.entries.first()
    }

    pub fn promote_head(&mut self) -> Option<WaitlistEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn remove(&mut self, booking_id: &Ulid) -> Option<WaitlistEntry> {
        let idx = self.entries.iter().position(|e| e.booking_id == *booking_id)?;
        Some(self.entries.remove(idx))
    }

    /// Rewrite positions to 1..N in current order. Returns only the entries whose
    /// position changed, for a single bulk write.
    pub fn renumber(&mut self) -> Vec<(Ulid, u32)> {
        let mut changed = Vec::new();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let want = i as u32 + 1;
            if entry.position != want {
                entry.position = want;
                changed.push((entry.booking_id, want));
            }
        }
        changed
    }

    pub fn positions(&self) -> Vec<(Ulid, u32)> {
        self.entries.iter().map(|e| (e.booking_id, e.position)).collect()
    }
}

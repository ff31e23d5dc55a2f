use ulid::Ulid;

use crate::model::*;

use super::{AdmissionError, Engine};

impl Engine {
    /// Last committed view of a class; never waits on its lock.
    pub fn get_class(&self, organization_id: &str, class_id: Ulid) -> Option<ClassSession> {
        self.store
            .class_snapshot(&class_id)
            .map(|state| state.class)
            .filter(|class| class.organization_id == organization_id)
    }

    /// Every booking of a class in creation order, cancelled ones included.
    pub fn list_bookings(&self, organization_id: &str, class_id: Ulid) -> Result<Vec<Booking>, AdmissionError> {
        match self.store.class_snapshot(&class_id) {
            Some(state) if state.class.organization_id == organization_id => Ok(state.bookings),
            _ => Err(AdmissionError::ClassUnavailable(class_id)),
        }
    }

    /// Waitlisted bookings of a class, head first.
    pub fn waitlist(&self, organization_id: &str, class_id: Ulid) -> Result<Vec<Booking>, AdmissionError> {
        match self.store.class_snapshot(&class_id) {
            Some(state) if state.class.organization_id == organization_id => {
                Ok(state.waitlist_ordered().into_iter().cloned().collect())
            }
            _ => Err(AdmissionError::ClassUnavailable(class_id)),
        }
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }
}

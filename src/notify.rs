use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Booking;

const CHANNEL_CAPACITY: usize = 256;

/// Committed booking transitions, published after the transaction is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingEvent {
    Admitted { booking: Booking },
    Waitlisted { booking: Booking },
    Cancelled { booking: Booking },
    Promoted { booking: Booking },
    CheckedIn { booking: Booking },
    MarkedNoShow { booking: Booking },
}

impl BookingEvent {
    pub fn booking(&self) -> &Booking {
        match self {
            BookingEvent::Admitted { booking }
            | BookingEvent::Waitlisted { booking }
            | BookingEvent::Cancelled { booking }
            | BookingEvent::Promoted { booking }
            | BookingEvent::CheckedIn { booking }
            | BookingEvent::MarkedNoShow { booking } => booking,
        }
    }

    /// JSON payload handed to notification delivery.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub: one channel per class plus an organization-wide firehose.
/// Delivery (push, WhatsApp, email) subscribes here; the engine never waits on it.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
    all: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self, class_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        self.channels
            .entry(class_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// No-op when nobody listens.
    pub fn send(&self, event: BookingEvent) {
        if let Some(sender) = self.channels.get(&event.booking().class_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    pub fn remove(&self, class_id: &Ulid) {
        self.channels.remove(class_id);
    }
}

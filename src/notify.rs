use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Money};

const CHANNEL_CAPACITY: usize = 256;

/// A state change pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Availability {
        slot_id: Ulid,
        available: u32,
        capacity: u32,
        unit_price: Money,
    },
    /// Full record; `status` conveys whether this is a confirm or a cancel.
    Booking { booking: Booking },
}

/// Broadcast hub: one channel per slot for availability changes, one
/// global channel for booking changes. Senders fire while the mutating
/// task still holds the slot write lock, so notices for a given entity
/// arrive in commit order.
pub struct FanoutHub {
    slots: DashMap<Ulid, broadcast::Sender<Notice>>,
    bookings: broadcast::Sender<Notice>,
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            bookings: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Availability feed for one slot. Creates the channel if needed.
    pub fn availability_feed(&self, slot_id: Ulid) -> AvailabilityFeed {
        let sender = self
            .slots
            .entry(slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        AvailabilityFeed {
            rx: sender.subscribe(),
        }
    }

    /// Booking feed restricted to `scope`. The filter is applied before any
    /// frame reaches a transport, so an unprivileged subscriber never
    /// observes another owner's records.
    pub fn booking_feed(&self, scope: BookingScope) -> BookingFeed {
        BookingFeed {
            rx: self.bookings.subscribe(),
            scope,
        }
    }

    /// Push an availability change. No-op if nobody is listening.
    pub fn send_availability(&self, slot_id: Ulid, available: u32, capacity: u32, unit_price: Money) {
        if let Some(sender) = self.slots.get(&slot_id) {
            let _ = sender.send(Notice::Availability {
                slot_id,
                available,
                capacity,
                unit_price,
            });
        }
    }

    /// Push a booking change to the global feed. No-op if nobody is listening.
    pub fn send_booking(&self, booking: &Booking) {
        let _ = self.bookings.send(Notice::Booking {
            booking: booking.clone(),
        });
    }
}

/// Which bookings a subscriber may observe. Fixed at subscription setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingScope {
    Owner(String),
    All,
}

impl BookingScope {
    pub fn admits(&self, booking: &Booking) -> bool {
        match self {
            BookingScope::Owner(id) => booking.owner == *id,
            BookingScope::All => true,
        }
    }
}

/// What a feed yields next.
#[derive(Debug)]
pub enum FeedMessage {
    Notice(Notice),
    /// The receiver fell behind and missed notices. The subscriber must
    /// resync from a fresh snapshot instead of silently skipping the gap.
    Lagged,
}

pub struct AvailabilityFeed {
    rx: broadcast::Receiver<Notice>,
}

impl AvailabilityFeed {
    /// Next availability notice, or `None` when the producer side is gone.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        loop {
            match self.rx.recv().await {
                Ok(notice @ Notice::Availability { .. }) => {
                    return Some(FeedMessage::Notice(notice))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(FeedMessage::Lagged),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct BookingFeed {
    rx: broadcast::Receiver<Notice>,
    scope: BookingScope,
}

impl BookingFeed {
    /// Next in-scope booking notice, or `None` when the producer side is gone.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        loop {
            match self.rx.recv().await {
                Ok(Notice::Booking { booking }) => {
                    if self.scope.admits(&booking) {
                        return Some(FeedMessage::Notice(Notice::Booking { booking }));
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(FeedMessage::Lagged),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn scope(&self) -> &BookingScope {
        &self.scope
    }
}

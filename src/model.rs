use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Money in integer minor units (cents). Never floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    /// Total for `n` units at this price. `None` on overflow.
    pub fn times(self, n: u32) -> Option<Money> {
        self.0.checked_mul(u64::from(n)).map(Money)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// The acting identity for a request, supplied by the (external) identity
/// provider and passed explicitly into every engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// A booking record. Created only by a successful capacity claim; never
/// deleted — cancellation flips `status` and restores the claimed units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub owner: String,
    pub units: u32,
    /// Unit price captured at claim time. Later price changes on the slot
    /// never alter this record.
    pub unit_price: Money,
    pub total: Money,
    pub contact: Contact,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub idempotency_key: Option<String>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// In-memory state of one bookable slot. The `available` counter is the
/// authoritative capacity count; only ledger claim/release mutate it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub name: String,
    pub starts_at: Ms,
    /// Fixed at creation.
    pub capacity: u32,
    pub unit_price: Money,
    /// Invariant: `0 <= available <= capacity`.
    pub available: u32,
    /// All bookings ever made against this slot, confirmed and cancelled.
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(id: Ulid, name: String, starts_at: Ms, capacity: u32, unit_price: Money) -> Self {
        Self {
            id,
            name,
            starts_at,
            capacity,
            unit_price,
            available: capacity,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Sum of units held by confirmed bookings. u64 so that anomalous
    /// states (more claims than capacity) still sum without overflow.
    pub fn claimed_units(&self) -> u64 {
        self.bookings
            .iter()
            .filter(|b| b.is_confirmed())
            .map(|b| u64::from(b.units))
            .sum()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        name: String,
        starts_at: Ms,
        capacity: u32,
        unit_price: Money,
    },
    SlotPriceChanged {
        id: Ulid,
        unit_price: Money,
    },
    BookingConfirmed {
        id: Ulid,
        slot_id: Ulid,
        owner: String,
        units: u32,
        unit_price: Money,
        total: Money,
        contact: Contact,
        idempotency_key: Option<String>,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
}

impl Event {
    /// The slot an event applies to.
    pub fn slot_id(&self) -> Ulid {
        match self {
            Event::SlotCreated { id, .. } | Event::SlotPriceChanged { id, .. } => *id,
            Event::BookingConfirmed { slot_id, .. } | Event::BookingCancelled { slot_id, .. } => {
                *slot_id
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: Ulid,
    pub name: String,
    pub starts_at: Ms,
    pub capacity: u32,
    pub available: u32,
    pub unit_price: Money,
}

impl From<&SlotState> for SlotInfo {
    fn from(rs: &SlotState) -> Self {
        Self {
            id: rs.id,
            name: rs.name.clone(),
            starts_at: rs.starts_at,
            capacity: rs.capacity,
            available: rs.available,
            unit_price: rs.unit_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
        }
    }

    fn booking(slot_id: Ulid, units: u32, status: BookingStatus) -> Booking {
        let price = Money::from_cents(2500);
        Booking {
            id: Ulid::new(),
            slot_id,
            owner: "user-1".into(),
            units,
            unit_price: price,
            total: price.times(units).unwrap(),
            contact: contact(),
            status,
            created_at: 1000,
            updated_at: 1000,
            idempotency_key: None,
        }
    }

    #[test]
    fn money_times_and_display() {
        let price = Money::from_cents(1999);
        assert_eq!(price.times(3), Some(Money::from_cents(5997)));
        assert_eq!(price.to_string(), "19.99");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
    }

    #[test]
    fn money_times_overflow_is_none() {
        let price = Money::from_cents(u64::MAX);
        assert_eq!(price.times(2), None);
    }

    #[test]
    fn slot_starts_fully_available() {
        let rs = SlotState::new(Ulid::new(), "GP heat".into(), 0, 12, Money::from_cents(100));
        assert_eq!(rs.available, 12);
        assert_eq!(rs.claimed_units(), 0);
        assert!(rs.bookings.is_empty());
    }

    #[test]
    fn claimed_units_counts_confirmed_only() {
        let id = Ulid::new();
        let mut rs = SlotState::new(id, "heat".into(), 0, 10, Money::from_cents(100));
        rs.bookings.push(booking(id, 3, BookingStatus::Confirmed));
        rs.bookings.push(booking(id, 2, BookingStatus::Cancelled));
        rs.bookings.push(booking(id, 4, BookingStatus::Confirmed));
        assert_eq!(rs.claimed_units(), 7);
    }

    #[test]
    fn booking_lookup_by_id() {
        let slot = Ulid::new();
        let mut rs = SlotState::new(slot, "heat".into(), 0, 10, Money::from_cents(100));
        let b = booking(slot, 1, BookingStatus::Confirmed);
        let bid = b.id;
        rs.bookings.push(b);
        assert!(rs.booking(bid).is_some());
        assert!(rs.booking(Ulid::new()).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingConfirmed {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            owner: "user-9".into(),
            units: 2,
            unit_price: Money::from_cents(1500),
            total: Money::from_cents(3000),
            contact: contact(),
            idempotency_key: Some("attempt-1".into()),
            at: 123_456,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn event_slot_id_extraction() {
        let slot = Ulid::new();
        let e = Event::BookingCancelled {
            id: Ulid::new(),
            slot_id: slot,
            at: 0,
        };
        assert_eq!(e.slot_id(), slot);
        let c = Event::SlotCreated {
            id: slot,
            name: "heat".into(),
            starts_at: 0,
            capacity: 1,
            unit_price: Money::from_cents(0),
        };
        assert_eq!(c.slot_id(), slot);
    }
}

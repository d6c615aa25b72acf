use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{ledger, Engine, EngineError};

/// A client's request to claim units of a slot. The idempotency key is
/// scoped to (owner, slot, key): a retried request with the same key
/// returns the original booking and claims nothing.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub slot_id: Ulid,
    pub units: u32,
    pub contact: Contact,
    pub idempotency_key: Option<String>,
}

fn require_identity(actor: Option<&Identity>) -> Result<&Identity, EngineError> {
    actor.ok_or(EngineError::Unauthenticated)
}

fn require_admin(actor: Option<&Identity>) -> Result<&Identity, EngineError> {
    let identity = require_identity(actor)?;
    if !identity.is_admin() {
        return Err(EngineError::Forbidden);
    }
    Ok(identity)
}

fn validate_booking_request(req: &BookingRequest) -> Result<(), EngineError> {
    if req.units == 0 {
        return Err(EngineError::Validation("units must be at least 1"));
    }
    if req.units > MAX_UNITS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many units in one booking"));
    }
    if req.contact.name.trim().is_empty() {
        return Err(EngineError::Validation("contact name required"));
    }
    if req.contact.email.trim().is_empty() {
        return Err(EngineError::Validation("contact email required"));
    }
    if req.contact.name.len() > MAX_CONTACT_FIELD_LEN
        || req.contact.email.len() > MAX_CONTACT_FIELD_LEN
    {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    if let Some(key) = &req.idempotency_key {
        if key.is_empty() {
            return Err(EngineError::Validation("idempotency key must not be empty"));
        }
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key too long"));
        }
    }
    Ok(())
}

impl Engine {
    /// Administrative: create a slot with fixed capacity. Capacity is never
    /// edited afterwards; only ledger claim/release move `available`.
    pub async fn create_slot(
        &self,
        actor: Option<&Identity>,
        id: Ulid,
        name: String,
        starts_at: Ms,
        capacity: u32,
        unit_price: Money,
    ) -> Result<SlotInfo, EngineError> {
        require_admin(actor)?;
        if self.state.len() >= MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if name.trim().is_empty() {
            return Err(EngineError::Validation("slot name required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("slot name too long"));
        }
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&starts_at) {
            return Err(EngineError::LimitExceeded("start time out of range"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SlotCreated {
            id,
            name: name.clone(),
            starts_at,
            capacity,
            unit_price,
        };
        self.wal_append(&event).await?;
        let rs = SlotState::new(id, name, starts_at, capacity, unit_price);
        let info = SlotInfo::from(&rs);
        self.state
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(rs)));
        Ok(info)
    }

    /// Administrative: change the unit price for future claims. Existing
    /// bookings keep the price captured at their claim time.
    pub async fn set_slot_price(
        &self,
        actor: Option<&Identity>,
        id: Ulid,
        unit_price: Money,
    ) -> Result<SlotInfo, EngineError> {
        require_admin(actor)?;
        let rs = self.get_slot(&id).ok_or(EngineError::SlotNotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::SlotPriceChanged { id, unit_price };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(SlotInfo::from(&*guard))
    }

    /// Claim capacity and persist a confirmed booking, or fail with a typed
    /// error and no partial write. The check-claim-persist sequence runs
    /// under the slot's write lock: two racing requests for the last units
    /// resolve to exactly one confirmation.
    pub async fn create_booking(
        &self,
        actor: Option<&Identity>,
        req: BookingRequest,
    ) -> Result<Booking, EngineError> {
        // Absent identity fails here — the ledger is never consulted.
        let identity = require_identity(actor)?;
        validate_booking_request(&req)?;

        let rs = self
            .get_slot(&req.slot_id)
            .ok_or(EngineError::SlotNotFound(req.slot_id))?;
        let mut guard = rs.write().await;

        // Idempotent retry? Checked under the slot lock so a concurrent
        // duplicate cannot slip past between check and insert.
        if let Some(key) = &req.idempotency_key {
            let idem = (identity.id.clone(), req.slot_id, key.clone());
            if let Some(existing) = self.idempotency.get(&idem) {
                let id = *existing.value();
                drop(existing);
                if let Some(b) = guard.booking(id) {
                    return Ok(b.clone());
                }
            }
        }

        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        ledger::can_claim(&guard, req.units)?;

        let unit_price = guard.unit_price;
        let total = unit_price
            .times(req.units)
            .ok_or(EngineError::Validation("total price overflows"))?;
        let at = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            slot_id: req.slot_id,
            owner: identity.id.clone(),
            units: req.units,
            unit_price,
            total,
            contact: req.contact,
            status: BookingStatus::Confirmed,
            created_at: at,
            updated_at: at,
            idempotency_key: req.idempotency_key,
        };

        let event = Event::BookingConfirmed {
            id: booking.id,
            slot_id: booking.slot_id,
            owner: booking.owner.clone(),
            units: booking.units,
            unit_price: booking.unit_price,
            total: booking.total,
            contact: booking.contact.clone(),
            idempotency_key: booking.idempotency_key.clone(),
            at,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Cancel a booking and restore its units. Idempotent: cancelling an
    /// already-cancelled booking is a successful no-op. The status flip and
    /// the release are one event applied under one lock, so they cannot
    /// diverge.
    pub async fn cancel_booking(
        &self,
        actor: Option<&Identity>,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        let identity = require_identity(actor)?;

        let slot_id = self
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut guard = rs.write().await;

        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if !booking.is_confirmed() {
            return Ok(());
        }
        if booking.owner != identity.id && !identity.is_admin() {
            return Err(EngineError::Forbidden);
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        Ok(())
    }

    /// Scan for slots whose `available` counter disagrees with the sum of
    /// confirmed bookings. Contended slots are skipped — a mutation in
    /// flight means the slot is being maintained correctly anyway.
    pub fn collect_drift(&self) -> Vec<(Ulid, u32)> {
        let mut drifted = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let read = rs.try_read();
            if let Ok(guard) = read {
                let expected = expected_available(&guard);
                if expected != guard.available {
                    drifted.push((guard.id, expected));
                }
            }
        }
        drifted
    }

    /// Re-derive `available` from the booking records for one slot. Returns
    /// the (before, after) pair when a repair happened. Repairs touch only
    /// derived state, so no WAL event is written.
    pub async fn repair_slot(&self, id: Ulid) -> Option<(u32, u32)> {
        let rs = self.get_slot(&id)?;
        let mut guard = rs.write().await;
        let expected = expected_available(&guard);
        if expected == guard.available {
            return None;
        }
        let before = guard.available;
        tracing::warn!(
            slot = %id,
            before,
            after = expected,
            "availability drift repaired"
        );
        metrics::counter!(observability::CONSISTENCY_ANOMALIES_TOTAL).increment(1);
        guard.available = expected;
        self.notify
            .send_availability(guard.id, guard.available, guard.capacity, guard.unit_price);
        Some((before, expected))
    }
}

fn expected_available(rs: &SlotState) -> u32 {
    let claimed = rs.claimed_units().min(u64::from(rs.capacity)) as u32;
    rs.capacity - claimed
}

mod error;
mod ledger;
mod mutations;
mod queries;

pub use error::EngineError;
pub use mutations::BookingRequest;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::FanoutHub;
use crate::wal::{self, Wal, WalCommand};

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Idempotency scope: (owner, slot, caller-supplied key).
type IdemKey = (String, Ulid, String);

/// The reservation engine for one tenant store. Owns the authoritative
/// capacity counters, the booking records, the WAL, and the fanout hub.
/// Contention is per slot: each slot sits behind its own RwLock and
/// unrelated slots never block each other.
pub struct Engine {
    pub(crate) state: DashMap<Ulid, SharedSlotState>,
    wal_tx: tokio::sync::mpsc::Sender<WalCommand>,
    pub notify: Arc<FanoutHub>,
    /// Reverse lookup: booking id → slot id.
    pub(crate) booking_to_slot: DashMap<Ulid, Ulid>,
    /// Completed claims by idempotency key, so a retried request returns
    /// the original booking instead of claiming twice.
    pub(crate) idempotency: DashMap<IdemKey, Ulid>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<FanoutHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let opened = Wal::open(&wal_path)?;
        let wal_tx = wal::spawn_writer(opened);

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_slot: DashMap::new(),
            idempotency: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::SlotCreated {
                    id,
                    name,
                    starts_at,
                    capacity,
                    unit_price,
                } => {
                    let rs =
                        SlotState::new(*id, name.clone(), *starts_at, *capacity, *unit_price);
                    engine
                        .state
                        .entry(*id)
                        .or_insert_with(|| Arc::new(RwLock::new(rs)));
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.slot_id()) {
                        let rs_arc = entry.value().clone();
                        drop(entry);
                        let mut guard =
                            rs_arc.try_write().expect("replay: uncontended write");
                        engine.apply_to_slot(&mut guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + fanout in one call, while the caller holds the
    /// slot's write lock. The append comes first: a storage failure leaves
    /// no partial state and no phantom claim.
    pub(crate) async fn persist_and_apply(
        &self,
        rs: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_slot(rs, event);
        self.publish(rs, event);
        Ok(())
    }

    /// Apply an event to a slot (caller holds the write lock). Shared by
    /// the live mutation path and WAL replay, so both produce identical
    /// state, including the booking and idempotency indexes.
    fn apply_to_slot(&self, rs: &mut SlotState, event: &Event) {
        match event {
            Event::SlotPriceChanged { unit_price, .. } => {
                rs.unit_price = *unit_price;
            }
            Event::BookingConfirmed {
                id,
                slot_id,
                owner,
                units,
                unit_price,
                total,
                contact,
                idempotency_key,
                at,
            } => {
                if rs.booking(*id).is_some() {
                    tracing::warn!(booking = %id, "duplicate confirm event ignored");
                    return;
                }
                rs.bookings.push(Booking {
                    id: *id,
                    slot_id: *slot_id,
                    owner: owner.clone(),
                    units: *units,
                    unit_price: *unit_price,
                    total: *total,
                    contact: contact.clone(),
                    status: BookingStatus::Confirmed,
                    created_at: *at,
                    updated_at: *at,
                    idempotency_key: idempotency_key.clone(),
                });
                ledger::claim(rs, *units);
                self.booking_to_slot.insert(*id, *slot_id);
                if let Some(key) = idempotency_key {
                    self.idempotency
                        .insert((owner.clone(), *slot_id, key.clone()), *id);
                }
            }
            Event::BookingCancelled { id, at, .. } => {
                let units = match rs.booking_mut(*id) {
                    Some(b) if b.is_confirmed() => {
                        b.status = BookingStatus::Cancelled;
                        b.updated_at = *at;
                        b.units
                    }
                    Some(_) => return, // already cancelled — idempotent
                    None => {
                        tracing::warn!(booking = %id, "cancel event for unknown booking ignored");
                        return;
                    }
                };
                ledger::release(rs, units);
            }
            // SlotCreated is handled at the DashMap level, not here
            Event::SlotCreated { .. } => {}
        }
    }

    /// Push the fanout notices for a just-applied event.
    fn publish(&self, rs: &SlotState, event: &Event) {
        match event {
            Event::SlotPriceChanged { .. } => {
                self.notify
                    .send_availability(rs.id, rs.available, rs.capacity, rs.unit_price);
            }
            Event::BookingConfirmed { id, .. } | Event::BookingCancelled { id, .. } => {
                if let Some(b) = rs.booking(*id) {
                    self.notify.send_booking(b);
                }
                self.notify
                    .send_availability(rs.id, rs.available, rs.capacity, rs.unit_price);
            }
            Event::SlotCreated { .. } => {}
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Cancelled bookings are retained — they
    /// are audit records, not garbage.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let slots: Vec<SharedSlotState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        for rs_arc in slots {
            let guard = rs_arc.read().await;
            events.push(Event::SlotCreated {
                id: guard.id,
                name: guard.name.clone(),
                starts_at: guard.starts_at,
                capacity: guard.capacity,
                unit_price: guard.unit_price,
            });
            // Emit each booking's confirm (and, adjacent, its cancel) in
            // creation order so replay never transits an invalid count.
            for b in &guard.bookings {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    slot_id: b.slot_id,
                    owner: b.owner.clone(),
                    units: b.units,
                    unit_price: b.unit_price,
                    total: b.total,
                    contact: b.contact.clone(),
                    idempotency_key: b.idempotency_key.clone(),
                    at: b.created_at,
                });
                if !b.is_confirmed() {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        slot_id: b.slot_id,
                        at: b.updated_at,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

use ulid::Ulid;

use crate::model::*;
use crate::notify::{AvailabilityFeed, BookingFeed, BookingScope};

use super::{Engine, EngineError, SharedSlotState};

impl Engine {
    /// Consistent availability snapshot for one slot.
    pub async fn availability(&self, slot_id: Ulid) -> Result<SlotInfo, EngineError> {
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let guard = rs.read().await;
        Ok(SlotInfo::from(&*guard))
    }

    pub async fn list_slots(&self) -> Vec<SlotInfo> {
        let mut infos = Vec::with_capacity(self.state.len());
        for rs in self.snapshot_slots() {
            let guard = rs.read().await;
            infos.push(SlotInfo::from(&*guard));
        }
        infos.sort_by_key(|s| (s.starts_at, s.id));
        infos
    }

    /// Fetch one booking. Owners see their own records; the admin role sees
    /// all (this is the path the ticket artifact renderer consumes).
    pub async fn get_booking(
        &self,
        actor: Option<&Identity>,
        booking_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let identity = actor.ok_or(EngineError::Unauthenticated)?;
        let slot_id = self
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let guard = rs.read().await;
        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if booking.owner != identity.id && !identity.is_admin() {
            return Err(EngineError::Forbidden);
        }
        Ok(booking.clone())
    }

    pub async fn bookings_for(&self, owner: &str) -> Vec<Booking> {
        self.collect_bookings(|b| b.owner == owner).await
    }

    pub async fn all_bookings(&self) -> Vec<Booking> {
        self.collect_bookings(|_| true).await
    }

    /// Subscribe to a slot's availability. The feed is attached *before*
    /// the snapshot is taken, so no change can fall between them; the
    /// caller must deliver the snapshot before any feed message.
    pub async fn watch_availability(
        &self,
        slot_id: Ulid,
    ) -> Result<(SlotInfo, AvailabilityFeed), EngineError> {
        let rs = self
            .get_slot(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let feed = self.notify.availability_feed(slot_id);
        let guard = rs.read().await;
        Ok((SlotInfo::from(&*guard), feed))
    }

    /// Subscribe to the actor's own bookings. The owner partition is fixed
    /// inside the feed at setup; other identities' records never reach it.
    pub async fn watch_bookings(
        &self,
        actor: Option<&Identity>,
    ) -> Result<(Vec<Booking>, BookingFeed), EngineError> {
        let identity = actor.ok_or(EngineError::Unauthenticated)?;
        let feed = self
            .notify
            .booking_feed(BookingScope::Owner(identity.id.clone()));
        let snapshot = self.bookings_for(&identity.id).await;
        Ok((snapshot, feed))
    }

    /// Subscribe to every booking. Privileged role only.
    pub async fn watch_all_bookings(
        &self,
        actor: Option<&Identity>,
    ) -> Result<(Vec<Booking>, BookingFeed), EngineError> {
        let identity = actor.ok_or(EngineError::Unauthenticated)?;
        if !identity.is_admin() {
            return Err(EngineError::Forbidden);
        }
        let feed = self.notify.booking_feed(BookingScope::All);
        let snapshot = self.all_bookings().await;
        Ok((snapshot, feed))
    }

    /// Clone out the slot handles without holding DashMap shard locks
    /// across awaits.
    fn snapshot_slots(&self) -> Vec<SharedSlotState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut out = Vec::new();
        for rs in self.snapshot_slots() {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        out.sort_by_key(|b| (b.created_at, b.id));
        out
    }
}

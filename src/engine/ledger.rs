//! Capacity arithmetic for a single slot. Every function here runs while
//! the caller holds the slot's write lock, which is what makes the
//! check-then-decrement sequence atomic per slot.

use crate::model::SlotState;
use crate::observability;

use super::EngineError;

/// Would a claim of `units` succeed right now? Rejection is a typed error,
/// not a panic; the caller re-queries availability and may retry smaller.
pub(crate) fn can_claim(rs: &SlotState, units: u32) -> Result<(), EngineError> {
    if units > rs.available {
        metrics::counter!(observability::CLAIMS_REJECTED_TOTAL).increment(1);
        return Err(EngineError::CapacityExceeded {
            requested: units,
            available: rs.available,
        });
    }
    Ok(())
}

/// Decrement `available` for a validated claim. Returns the new count.
///
/// An underflow here means the event log disagrees with the counter (only
/// possible via a corrupt or hand-edited WAL); it is logged and clamped so
/// replay never wedges the slot.
pub(crate) fn claim(rs: &mut SlotState, units: u32) -> u32 {
    if units > rs.available {
        tracing::warn!(
            slot = %rs.id,
            units,
            available = rs.available,
            "claim exceeds available, clamping to zero"
        );
        metrics::counter!(observability::CONSISTENCY_ANOMALIES_TOTAL).increment(1);
        rs.available = 0;
    } else {
        rs.available -= units;
    }
    rs.available
}

/// Restore `units` to the slot. Always succeeds; the result is clamped to
/// capacity. A release that would exceed capacity indicates a lost
/// slot/booking relationship upstream — it is logged as an anomaly for an
/// operator, never surfaced to the cancelling user.
pub(crate) fn release(rs: &mut SlotState, units: u32) -> u32 {
    let restored = rs.available.saturating_add(units);
    if restored > rs.capacity {
        tracing::warn!(
            slot = %rs.id,
            units,
            available = rs.available,
            capacity = rs.capacity,
            "release exceeds capacity, clamping"
        );
        metrics::counter!(observability::CONSISTENCY_ANOMALIES_TOTAL).increment(1);
        rs.available = rs.capacity;
    } else {
        rs.available = restored;
    }
    rs.available
}

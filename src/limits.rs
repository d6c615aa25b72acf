//! Hard input bounds. Everything a client can grow is capped here so a
//! misbehaving storefront backend cannot exhaust the engine.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_SLOTS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 50_000;

/// A single booking may claim at most this many units.
pub const MAX_UNITS_PER_BOOKING: u32 = 100;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_FIELD_LEN: usize = 256;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Slot start times must fall in [2000-01-01, 3000-01-01) as unix millis.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 32_503_680_000_000;

/// One JSON frame on the wire may not exceed this many bytes.
pub const MAX_WIRE_FRAME_LEN: usize = 64 * 1024;

//! Ticket identity issuing. The code is derived deterministically from the
//! booking's persisted identifier, so re-rendering a ticket (or its QR
//! artifact) always yields the same scannable payload, and two distinct
//! bookings never collide. The code carries no capacity or pricing data —
//! those are looked up from the booking record at scan time.

use ulid::Ulid;

const PREFIX: &str = "PDK";

/// `PDK-<ulid>-<crc32 of the ulid bytes, hex>`.
pub fn issue(booking_id: Ulid) -> String {
    let check = crc32fast::hash(&booking_id.to_bytes());
    format!("{PREFIX}-{booking_id}-{check:08X}")
}

/// Recover the booking id from a scanned code. Returns `None` for wrong
/// shape, an unparsable id, or a checksum mismatch.
pub fn parse(code: &str) -> Option<Ulid> {
    let rest = code.strip_prefix(PREFIX)?.strip_prefix('-')?;
    let (id_part, check_part) = rest.split_once('-')?;
    let id = Ulid::from_string(id_part).ok()?;
    let check = u32::from_str_radix(check_part, 16).ok()?;
    if check != crc32fast::hash(&id.to_bytes()) {
        return None;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_is_stable() {
        let id = Ulid::new();
        assert_eq!(issue(id), issue(id));
    }

    #[test]
    fn distinct_bookings_get_distinct_codes() {
        let a = Ulid::new();
        let b = Ulid::new();
        assert_ne!(issue(a), issue(b));
    }

    #[test]
    fn parse_roundtrip() {
        let id = Ulid::new();
        assert_eq!(parse(&issue(id)), Some(id));
    }

    #[test]
    fn parse_rejects_tampered_checksum() {
        let id = Ulid::new();
        let code = issue(id);
        let (body, check) = code.rsplit_once('-').unwrap();
        let flipped = if check.starts_with('0') { "1" } else { "0" };
        let tampered = format!("{body}-{flipped}{}", &check[1..]);
        assert_eq!(parse(&tampered), None);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("PDK-"), None);
        assert_eq!(parse("PDK-notaulid-00000000"), None);
        assert_eq!(parse("TKT-01ARZ3NDEKTSV4RRFFQ69G5FAV-00000000"), None);
    }

    #[test]
    fn code_contains_no_pricing_or_capacity() {
        let id = Ulid::new();
        let code = issue(id);
        // Shape is exactly prefix + id + checksum.
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "PDK");
        assert_eq!(parts[1], id.to_string());
    }
}

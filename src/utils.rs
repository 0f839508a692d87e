// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use rand::RngExt;

/// Draws a uniformly random duration in `[lo, hi]`, used by the secure
/// routing group-timer algorithm for its keeper/follower scheduling jitter
/// (§4.8). Returns `lo` unchanged when `hi <= lo`.
pub fn random_duration_in_range(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let span = hi - lo;
    let offset_nanos = rand::rng().random_range(0..=span.as_nanos());
    lo + Duration::from_nanos(offset_nanos as u64)
}

/// Derives the 6-byte serial number KNX IP Secure uses to identify a device
/// in `SecureSessionAuth`/`SecureGroupSync` frames (§4.7/§4.8) from a NIC
/// MAC address, when no explicit override is configured. Falls back to all
/// zeroes if no MAC is available, matching `SecureConfig`'s documented
/// default.
pub fn serial_number_from_mac(mac: Option<[u8; 6]>) -> [u8; 6] {
    mac.unwrap_or([0u8; 6])
}

/// Parses a hex-encoded fixed-size key/serial field from config (16-byte
/// AES keys, 6-byte serials). Returns `None` for an empty string so callers
/// can distinguish "not configured" from a malformed value.
pub fn parse_hex_fixed<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.is_empty() {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_duration_stays_in_bounds() {
        let lo = Duration::from_secs(10);
        let hi = Duration::from_millis(10_000 + 3 * 300);
        for _ in 0..100 {
            let d = random_duration_in_range(lo, hi);
            assert!(d >= lo && d <= hi);
        }
    }

    #[test]
    fn degenerate_range_returns_lower_bound() {
        let lo = Duration::from_secs(5);
        assert_eq!(random_duration_in_range(lo, lo), lo);
    }

    #[test]
    fn parse_hex_fixed_rejects_wrong_length() {
        assert_eq!(parse_hex_fixed::<16>("aabb"), None);
    }

    #[test]
    fn parse_hex_fixed_roundtrips_full_key() {
        let key_hex = "000102030405060708090a0b0c0d0e0f";
        let parsed: [u8; 16] = parse_hex_fixed(key_hex).expect("valid hex");
        assert_eq!(parsed[0], 0x00);
        assert_eq!(parsed[15], 0x0f);
    }
}

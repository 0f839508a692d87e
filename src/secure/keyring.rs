// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Password-hashing utilities (§6): PBKDF2-HMAC-SHA256, 65536 iterations,
//! 128-bit output, with the two fixed KNX salts.

use hmac::Hmac;
use sha2::Sha256;

const ITERATIONS: u32 = 65_536;

pub const USER_PASSWORD_SALT: &[u8] = b"user-password.1.secure.ip.knx.org";
pub const DEVICE_AUTH_SALT: &[u8] = b"device-authentication-code.1.secure.ip.knx.org";

/// Replaces any byte outside the printable ASCII range `[0x20, 0x7E]` with
/// `'?'`, per §6. Operates on an owned buffer so the caller can zeroise it
/// afterward.
fn sanitize(password: &str) -> Vec<u8> {
    password
        .bytes()
        .map(|b| if (0x20..=0x7E).contains(&b) { b } else { b'?' })
        .collect()
}

/// Derives a 16-byte key from `password` and `salt` via PBKDF2-HMAC-SHA256.
/// The sanitized input buffer is zeroised before returning.
pub fn derive_key(password: &str, salt: &[u8]) -> [u8; 16] {
    let mut input = sanitize(password);
    let mut key = [0u8; 16];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(&input, salt, ITERATIONS, &mut key)
        .expect("16-byte output is a valid PBKDF2-HMAC-SHA256 key length");
    input.iter_mut().for_each(|b| *b = 0);
    key
}

pub fn derive_user_password_key(password: &str) -> [u8; 16] {
    derive_key(password, USER_PASSWORD_SALT)
}

pub fn derive_device_authentication_key(password: &str) -> [u8; 16] {
    derive_key(password, DEVICE_AUTH_SALT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_printable_bytes() {
        let sanitized = sanitize("ab\tcd\u{7F}");
        assert_eq!(sanitized, b"ab?cd?");
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let a = derive_user_password_key("hunter2");
        let b = derive_user_password_key("hunter2");
        assert_eq!(a, b);
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let user = derive_user_password_key("hunter2");
        let device = derive_device_authentication_key("hunter2");
        assert_ne!(user, device);
    }
}

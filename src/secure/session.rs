// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! KNX IP Secure unicast session (§4.7 "C8"): X25519 handshake, the
//! `SecureWrapper` AES-128-CTR + CBC-MAC codec, and the 30s keep-alive.

use std::sync::atomic::{AtomicU64, Ordering};

use aes::Aes128;
use cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::{
    error::{ConnResult, ConnectionError},
    wire::{SecureSessionAuth, SecureSessionResponse, SecureSessionStatus, SecureStatus, SecureWrapper},
};

type Aes128Ctr = ctr::Ctr64BE<Aes128>;

/// One ephemeral handshake's client-side secret, consumed on first use
/// (`EphemeralSecret` is not `Clone` by design).
pub struct Handshake {
    secret: EphemeralSecret,
    pub public_value: [u8; 32],
}

impl Handshake {
    pub fn generate() -> Self {
        // Uses the "getrandom" OS RNG baked into x25519-dalek rather than
        // threading rand's OsRng through, since the two crates pin
        // different rand_core major versions.
        let secret = EphemeralSecret::random();
        let public_value = PublicKey::from(&secret).to_bytes();
        Self { secret, public_value }
    }

    /// Computes the session key: the first 16 bytes of SHA-256 of the
    /// X25519 shared secret (§4.7 step 2).
    pub fn session_key(self, server_public_value: [u8; 32]) -> [u8; 16] {
        let shared = self.secret.diffie_hellman(&PublicKey::from(server_public_value));
        let digest = Sha256::digest(shared.as_bytes());
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        key
    }
}

/// An authenticated unicast secure session's per-message state: the
/// session key, serial number, and the monotonically-increasing send
/// sequence counter (§4.7 "sequence: 48-bit ... counter per session").
pub struct Session {
    pub session_id: u16,
    key: [u8; 16],
    serial_number: [u8; 6],
    send_sequence: AtomicU64,
    recv_sequence: AtomicU64,
}

const MAX_48BIT: u64 = (1u64 << 48) - 1;

impl Session {
    pub fn new(session_id: u16, key: [u8; 16], serial_number: [u8; 6]) -> Self {
        Self {
            session_id,
            key,
            serial_number,
            send_sequence: AtomicU64::new(0),
            recv_sequence: AtomicU64::new(0),
        }
    }

    fn next_send_sequence(&self) -> ConnResult<u64> {
        let seq = self.send_sequence.fetch_add(1, Ordering::SeqCst);
        if seq > MAX_48BIT {
            return Err(ConnectionError::Secure("sequence counter exhausted".to_string()));
        }
        Ok(seq)
    }

    /// Encrypts and wraps `header_and_payload` (the cleartext KNXnet/IP
    /// frame) into a `SecureWrapper` body (§4.7).
    pub fn wrap(&self, header_and_payload: &[u8], tag: u16) -> ConnResult<SecureWrapper> {
        let sequence = self.next_send_sequence()?;
        let mac = cbc_mac_with_security_info(&self.key, sequence, &self.serial_number, tag, header_and_payload);
        let mut payload = header_and_payload.to_vec();
        ctr_apply(&self.key, sequence, &self.serial_number, tag, &mut payload);
        Ok(SecureWrapper {
            session_id: self.session_id,
            sequence_info: sequence.to_be_bytes()[2..8].try_into().expect("48-bit sequence"),
            serial_number: self.serial_number,
            message_tag: tag,
            encrypted_payload: payload.into(),
            mac,
        })
    }

    /// Decrypts and authenticates a received `SecureWrapper`, applying
    /// the rejection policies from §4.7 (zero session id, stale sequence,
    /// unexpected tag, MAC mismatch).
    pub fn unwrap(&self, wrapper: &SecureWrapper, expected_tag: u16) -> ConnResult<Vec<u8>> {
        if wrapper.session_id == 0 {
            return Err(ConnectionError::Secure("session_id 0 on receive".to_string()));
        }
        if wrapper.message_tag != expected_tag {
            return Err(ConnectionError::Secure("unexpected message tag".to_string()));
        }
        let mut sequence_bytes = [0u8; 8];
        sequence_bytes[2..8].copy_from_slice(&wrapper.sequence_info);
        let sequence = u64::from_be_bytes(sequence_bytes);
        let expected = self.recv_sequence.load(Ordering::SeqCst);
        if sequence < expected {
            return Err(ConnectionError::Secure("sequence below expected recv-seq".to_string()));
        }

        let mut payload = wrapper.encrypted_payload.to_vec();
        ctr_apply(&self.key, sequence, &self.serial_number, wrapper.message_tag, &mut payload);

        let expected_mac =
            cbc_mac_with_security_info(&self.key, sequence, &self.serial_number, wrapper.message_tag, &payload);
        if expected_mac != wrapper.mac {
            return Err(ConnectionError::Secure("MAC mismatch".to_string()));
        }
        self.recv_sequence.store(sequence + 1, Ordering::SeqCst);
        Ok(payload)
    }
}

/// `security_info(serial_no, tag, length)`: the 16-byte block used both
/// as the CTR counter seed and as the CBC-MAC prefix (§4.7). Shared by
/// both the unicast [`Session`] and the multicast group-timer codec.
pub(crate) fn security_info(sequence: u64, serial_number: &[u8; 6], tag: u16, length: u16) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..6].copy_from_slice(&sequence.to_be_bytes()[2..8]);
    block[6..12].copy_from_slice(serial_number);
    block[12..14].copy_from_slice(&tag.to_be_bytes());
    block[14..16].copy_from_slice(&length.to_be_bytes());
    block
}

/// AES-128-CTR keystream seeded by `security_info`, applied in place.
pub(crate) fn ctr_apply(key: &[u8; 16], sequence: u64, serial_number: &[u8; 6], tag: u16, payload: &mut [u8]) {
    let block = security_info(sequence, serial_number, tag, payload.len() as u16);
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&block));
    cipher.apply_keystream(payload);
}

/// AES-128 CBC-MAC over `security_info(length=payload_size) ‖
/// length-prefix(2) ‖ cleartext`, truncated to 16 bytes, then "encrypted"
/// with the counter block at index 0 (§4.7).
pub(crate) fn cbc_mac_with_security_info(
    key: &[u8; 16],
    sequence: u64,
    serial_number: &[u8; 6],
    tag: u16,
    cleartext: &[u8],
) -> [u8; 16] {
    let mut to_mac = Vec::with_capacity(16 + 2 + cleartext.len());
    to_mac.extend_from_slice(&security_info(sequence, serial_number, tag, cleartext.len() as u16));
    to_mac.extend_from_slice(&(cleartext.len() as u16).to_be_bytes());
    to_mac.extend_from_slice(cleartext);

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut mac_block = [0u8; 16];
    for chunk in to_mac.chunks(16) {
        let mut block = [0u8; 16];
        block[..chunk.len()].copy_from_slice(chunk);
        for (m, b) in mac_block.iter_mut().zip(block.iter()) {
            *m ^= b;
        }
        let mut ga = *GenericArray::from_slice(&mac_block);
        cipher.encrypt_block(&mut ga);
        mac_block.copy_from_slice(&ga);
    }

    let mut mask = *GenericArray::from_slice(&security_info(0, serial_number, tag, 0));
    cipher.encrypt_block(&mut mask);
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = mac_block[i] ^ mask[i];
    }
    out
}

/// CBC-MAC over `(header ‖ session_id ‖ xor(server_pub, client_pub))`
/// under the device-authentication key, for `SessionResponse`
/// verification (§4.7 step 2). Returns `true` (accept) when `device_key`
/// is all-zero, logging the skip at the call site. An `EarlyRejection`
/// carries no public value or MAC to check, so it never verifies.
pub fn verify_session_response_mac(
    device_key: [u8; 16],
    header: &[u8; 6],
    response: &SecureSessionResponse,
    client_public_value: [u8; 32],
) -> bool {
    let SecureSessionResponse::Accepted { session_id, server_public_value, mac } = response else {
        return false;
    };
    if device_key == [0u8; 16] {
        return true;
    }
    let mut xored = [0u8; 32];
    for i in 0..32 {
        xored[i] = server_public_value[i] ^ client_public_value[i];
    }
    let mut data = Vec::with_capacity(6 + 2 + 32);
    data.extend_from_slice(header);
    data.extend_from_slice(&session_id.to_be_bytes());
    data.extend_from_slice(&xored);
    cbc_mac(device_key, &data) == *mac
}

/// Resolves a decoded `SessionResponse` to the accepted session's fields,
/// or a `Secure` error when the server issued an early rejection (§4.7:
/// "total length neither 0x38 nor 0x08" is malformed at the wire layer;
/// 0x08 itself is a well-formed refusal to open a session).
pub fn resolve_session_response(response: SecureSessionResponse) -> ConnResult<(u16, [u8; 32], [u8; 16])> {
    match response {
        SecureSessionResponse::Accepted { session_id, server_public_value, mac } => {
            Ok((session_id, server_public_value, mac))
        },
        SecureSessionResponse::EarlyRejection { session_id } => Err(ConnectionError::Secure(format!(
            "server rejected SessionRequest for session {session_id} (no session capacity)"
        ))),
    }
}

/// CBC-MAC for `SessionAuthenticate` under the user-password key.
pub fn session_auth_mac(user_key: [u8; 16], header: &[u8; 6], auth: &SecureSessionAuth) -> [u8; 16] {
    let mut data = Vec::with_capacity(6 + 2 + 16);
    data.extend_from_slice(header);
    data.extend_from_slice(&[0, auth.user_id]);
    data.extend_from_slice(&auth.message_authentication_code);
    cbc_mac(user_key, &data)
}

fn cbc_mac(key: [u8; 16], data: &[u8]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(&key));
    let mut state = [0u8; 16];
    for chunk in data.chunks(16) {
        let mut block = [0u8; 16];
        block[..chunk.len()].copy_from_slice(chunk);
        for (s, b) in state.iter_mut().zip(block.iter()) {
            *s ^= b;
        }
        let mut ga = *GenericArray::from_slice(&state);
        cipher.encrypt_block(&mut ga);
        state.copy_from_slice(&ga);
    }
    state
}

/// The client-side status callback for `SessionStatus` (§4.7 step 4):
/// maps the decoded status to either success or a `Secure` error.
pub fn resolve_session_status(status: SecureSessionStatus) -> ConnResult<()> {
    match status.status {
        SecureStatus::AuthSuccess => Ok(()),
        other => Err(ConnectionError::Secure(format!("session authentication failed: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_round_trips() {
        let session = Session::new(7, [0x42; 16], [1, 2, 3, 4, 5, 6]);
        let plaintext = b"hello knx secure";
        let wrapper = session.wrap(plaintext, 0).expect("wrap");

        let peer = Session::new(7, [0x42; 16], [1, 2, 3, 4, 5, 6]);
        let recovered = peer.unwrap(&wrapper, 0).expect("unwrap");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn unwrap_rejects_wrong_tag() {
        let session = Session::new(7, [0x11; 16], [9, 9, 9, 9, 9, 9]);
        let wrapper = session.wrap(b"payload", 5).expect("wrap");
        let peer = Session::new(7, [0x11; 16], [9, 9, 9, 9, 9, 9]);
        assert!(matches!(peer.unwrap(&wrapper, 0), Err(ConnectionError::Secure(_))));
    }

    #[test]
    fn unwrap_rejects_tampered_mac() {
        let session = Session::new(1, [0x77; 16], [0; 6]);
        let mut wrapper = session.wrap(b"payload", 0).expect("wrap");
        wrapper.mac[0] ^= 0xFF;
        let peer = Session::new(1, [0x77; 16], [0; 6]);
        assert!(matches!(peer.unwrap(&wrapper, 0), Err(ConnectionError::Secure(_))));
    }

    #[test]
    fn zero_device_key_skips_mac_verification() {
        let response =
            SecureSessionResponse::Accepted { session_id: 1, server_public_value: [0; 32], mac: [0xAA; 16] };
        assert!(verify_session_response_mac([0u8; 16], &[0u8; 6], &response, [0u8; 32]));
    }

    #[test]
    fn early_rejection_never_verifies_and_resolves_to_an_error() {
        let response = SecureSessionResponse::EarlyRejection { session_id: 3 };
        assert!(!verify_session_response_mac([0u8; 16], &[0u8; 6], &response, [0u8; 32]));
        assert!(matches!(resolve_session_response(response), Err(ConnectionError::Secure(_))));
    }
}

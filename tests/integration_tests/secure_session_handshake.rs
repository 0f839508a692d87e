// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use knxnetip_core::secure::{
    keyring::{derive_device_authentication_key, derive_user_password_key},
    session::{resolve_session_status, session_auth_mac, verify_session_response_mac, Handshake, Session},
};
use knxnetip_core::wire::{SecureSessionAuth, SecureSessionResponse, SecureSessionStatus, SecureStatus};

/// Derives both KNX IP Secure keys from the same password and checks they
/// diverge (the two fixed salts must actually be distinguishing the two
/// purposes, not just decorative constants).
#[tokio::test]
async fn password_derivation_is_deterministic_and_salt_dependent() {
    let user_key_a = derive_user_password_key("testpass");
    let user_key_b = derive_user_password_key("testpass");
    assert_eq!(user_key_a, user_key_b);

    let device_key = derive_device_authentication_key("testpass");
    assert_ne!(user_key_a, device_key);
}

/// Runs a full client/server X25519 handshake and checks both sides land on
/// the same session key, that a zero device-authentication key skips
/// `SessionResponse` MAC verification while a real key rejects a forged
/// MAC, and that the resulting `Session` wrap/unwrap codec round-trips an
/// application frame end to end (§8 scenario 4).
#[tokio::test]
async fn full_handshake_then_secure_wrap_unwrap_round_trip() {
    let client = Handshake::generate();
    let server = Handshake::generate();
    let client_public = client.public_value;
    let server_public = server.public_value;

    let client_derived_key = client.session_key(server_public);
    let server_derived_key = server.session_key(client_public);
    assert_eq!(client_derived_key, server_derived_key);

    let header = [0x06, 0x10, 0x09, 0x51, 0x00, 0x3e];
    let session_id = 42;
    let response =
        SecureSessionResponse::Accepted { session_id, server_public_value: server_public, mac: [0u8; 16] };

    // A zero device-authentication key means CBC-MAC verification is
    // skipped entirely (§11).
    assert!(verify_session_response_mac([0u8; 16], &header, &response, client_public));

    // With a real key configured, a forged/zero MAC must be rejected.
    let device_key = derive_device_authentication_key("hunter2");
    assert!(!verify_session_response_mac(device_key, &header, &response, client_public));

    let user_key = derive_user_password_key("testpass");
    let auth_header = [0x06, 0x10, 0x09, 0x53, 0x00, 0x18];
    let auth = SecureSessionAuth { user_id: 2, message_authentication_code: [0u8; 16] };
    let mac = session_auth_mac(user_key, &auth_header, &auth);
    // Deterministic: re-deriving the MAC for the same inputs must match.
    assert_eq!(mac, session_auth_mac(user_key, &auth_header, &auth));

    resolve_session_status(SecureSessionStatus { status: SecureStatus::AuthSuccess })
        .expect("AuthSuccess should resolve Ok");
    resolve_session_status(SecureSessionStatus { status: SecureStatus::AuthFailed })
        .expect_err("AuthFailed should resolve to an error");

    let client_session = Session::new(session_id, client_derived_key, [1, 2, 3, 4, 5, 6]);
    let server_session = Session::new(session_id, server_derived_key, [1, 2, 3, 4, 5, 6]);

    let cleartext = b"\x04\x04\x00\x80group value write".to_vec();
    let wrapped = client_session.wrap(&cleartext, 0x0100).expect("wrap should succeed");
    let decrypted = server_session.unwrap(&wrapped, 0x0100).expect("unwrap should succeed and authenticate");
    assert_eq!(decrypted, cleartext);
}

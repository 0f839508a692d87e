// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Secure routing group timer and sync role algorithm (§4.8 "C9").
//!
//! Mirrors the plain async-loop shape of [`crate::state_machine::heartbeat`]:
//! this is a scheduled periodic task, not a request/response exchange, so it
//! is not modelled as a [`crate::state_machine::common::StateMachine`].

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::ConnResult,
    secure::session::{cbc_mac_with_security_info, ctr_apply},
    utils::random_duration_in_range,
    wire::SecureGroupSync,
};

const MAX_48BIT: u64 = (1u64 << 48) - 1;
const KEEPER_BASE: Duration = Duration::from_secs(10);

/// The shared 48-bit group-timer clock: `local_monotonic_ms + offset`
/// (§4.8). `offset` only ever moves forward, towards whichever peer has
/// observed the furthest-advanced timer.
pub struct GroupTimer {
    started: Instant,
    offset_ms: AtomicI64,
}

impl GroupTimer {
    pub fn new() -> Self {
        Self { started: Instant::now(), offset_ms: AtomicI64::new(0) }
    }

    pub fn now_ms(&self) -> u64 {
        let local = self.started.elapsed().as_millis() as i64 + self.offset_ms.load(Ordering::SeqCst);
        (local.max(0) as u64).min(MAX_48BIT)
    }

    /// Adjusts `offset` forward when `remote` is ahead of the local timer
    /// (§4.8 "adjusts offset += (remote − local)").
    fn adjust_forward(&self, remote_ms: u64) {
        let local = self.now_ms();
        if remote_ms > local {
            self.offset_ms.fetch_add((remote_ms - local) as i64, Ordering::SeqCst);
        }
    }
}

impl Default for GroupTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encrypts `header_and_payload` for multicast under the backbone key,
/// carrying `session_id = 0` and `sequence = local group timer` (§4.8).
pub fn wrap_group_frame(
    backbone_key: [u8; 16],
    timer_ms: u64,
    serial_number: [u8; 6],
    routing_count: u16,
    header_and_payload: &[u8],
) -> crate::wire::SecureWrapper {
    let mac = cbc_mac_with_security_info(&backbone_key, timer_ms, &serial_number, routing_count, header_and_payload);
    let mut payload = header_and_payload.to_vec();
    ctr_apply(&backbone_key, timer_ms, &serial_number, routing_count, &mut payload);
    crate::wire::SecureWrapper {
        session_id: 0,
        sequence_info: timer_ms.to_be_bytes()[2..8].try_into().expect("48-bit timer"),
        serial_number,
        message_tag: routing_count,
        encrypted_payload: payload.into(),
        mac,
    }
}

/// Decrypts a received group frame and applies the freshness check from
/// §4.8: `received_timer >= local_timer - latency_tolerance`.
pub fn unwrap_group_frame(
    backbone_key: [u8; 16],
    timer: &GroupTimer,
    latency_tolerance: Duration,
    wrapper: &crate::wire::SecureWrapper,
) -> Option<Vec<u8>> {
    let mut sequence_bytes = [0u8; 8];
    sequence_bytes[2..8].copy_from_slice(&wrapper.sequence_info);
    let remote_timer = u64::from_be_bytes(sequence_bytes);

    let local_timer = timer.now_ms();
    let tolerance = latency_tolerance.as_millis() as u64;
    if remote_timer < local_timer.saturating_sub(tolerance) {
        debug!(remote_timer, local_timer, "stale group timer, dropping frame");
        return None;
    }

    let mut payload = wrapper.encrypted_payload.to_vec();
    ctr_apply(&backbone_key, remote_timer, &wrapper.serial_number, wrapper.message_tag, &mut payload);
    let expected_mac =
        cbc_mac_with_security_info(&backbone_key, remote_timer, &wrapper.serial_number, wrapper.message_tag, &payload);
    if expected_mac != wrapper.mac {
        debug!("group frame MAC mismatch, dropping");
        return None;
    }
    if remote_timer > local_timer {
        timer.adjust_forward(remote_timer);
    }
    Some(payload)
}

pub fn encode_group_sync(timer_ms: u64, serial_number: [u8; 6], backbone_key: [u8; 16], tag: u16) -> SecureGroupSync {
    let timer_value: [u8; 6] = timer_ms.to_be_bytes()[2..8].try_into().expect("48-bit timer");
    let mac = cbc_mac_with_security_info(&backbone_key, timer_ms, &serial_number, tag, &[]);
    SecureGroupSync { timer_value, serial_number, message_tag: tag, mac }
}

fn decode_timer(timer_value: &[u8; 6]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[2..8].copy_from_slice(timer_value);
    u64::from_be_bytes(bytes)
}

/// The two roles from §4.8's synchronisation protocol. At most one node is
/// expected to be time keeper at steady state; any node believing itself
/// unchallenged remains keeper, and any node that observes another keeper's
/// notify demotes itself to follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Keeper,
    Follower,
}

/// Runs the group-timer synchronisation task for one routing instance
/// until `cancel` fires. `send_sync` transmits an (already wrapped)
/// `SecureGroupSync`; `received` carries every group-sync or secured data
/// frame's timer value, tagged with whether it originated locally.
pub async fn run(
    backbone_key: [u8; 16],
    serial_number: [u8; 6],
    timer: std::sync::Arc<GroupTimer>,
    latency_tolerance: Duration,
    send_sync: impl Fn(SecureGroupSync) -> ConnResult<()>,
    mut received: mpsc::Receiver<SecureGroupSync>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let sync_tolerance = latency_tolerance / 10;
    let keeper_max = KEEPER_BASE + sync_tolerance * 3;
    let mut role = Role::Keeper;
    let mut tag: u16 = 0;

    // Join behaviour: schedule an initial notify immediately (§4.8).
    let mut next_deadline = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next_deadline) => {
                let timer_ms = timer.now_ms();
                let sync = encode_group_sync(timer_ms, serial_number, backbone_key, tag);
                tag = tag.wrapping_add(1);
                if send_sync(sync).is_err() {
                    return;
                }
                let delay = match role {
                    Role::Keeper => random_duration_in_range(KEEPER_BASE, keeper_max),
                    Role::Follower => random_duration_in_range(
                        keeper_max + sync_tolerance,
                        keeper_max + sync_tolerance * 11,
                    ),
                };
                next_deadline = tokio::time::Instant::now() + delay;
            }
            Some(sync) = received.recv() => {
                let remote_timer = decode_timer(&sync.timer_value);
                let local_timer = timer.now_ms();
                if remote_timer > local_timer {
                    timer.adjust_forward(remote_timer);
                }
                let slightly_behind = sync_tolerance.as_millis() as u64;
                if remote_timer + slightly_behind >= local_timer && remote_timer <= local_timer && sync.serial_number != serial_number {
                    if role == Role::Keeper {
                        debug!("another keeper observed, demoting to follower");
                    }
                    role = Role::Follower;
                    next_deadline = tokio::time::Instant::now()
                        + random_duration_in_range(keeper_max + sync_tolerance, keeper_max + sync_tolerance * 11);
                }
            }
        }
    }
}

/// Blocks (asynchronously) for up to `2*latency_tolerance + 100ms +
/// 12*sync_tolerance`, releasing early as soon as a sync is observed
/// (§4.8 "Join behaviour").
pub async fn wait_for_join_sync(latency_tolerance: Duration, mut joined: mpsc::Receiver<()>) {
    let sync_tolerance = latency_tolerance / 10;
    let window = latency_tolerance * 2 + Duration::from_millis(100) + sync_tolerance * 12;
    let _ = tokio::time::timeout(window, joined.recv()).await;
}

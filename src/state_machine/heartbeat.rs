// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Heartbeat loop (§4.3): once `Ok`, send `ConnectionState.req` every
//! `interval`; on no reply within `wait`, retry up to `retries` times at a
//! fixed 1s cadence, then give up.
//!
//! Plain async loop rather than a `StateMachine` impl: a loop around a
//! timeout earns its keep here, since the state-machine apparatus is for
//! multi-branch protocol exchanges, not a single repeated request.

use std::time::Duration;

use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ConnResult, ConnectionError};

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of waiting for one `ConnectionState.res`.
#[derive(Debug, Clone, Copy)]
pub enum HeartbeatReply {
    Ok,
    /// Non-zero status in the response.
    Error,
}

pub struct HeartbeatParams {
    pub interval: Duration,
    pub wait: Duration,
    pub retries: u32,
}

/// Runs until `cancel` fires or the heartbeat is declared dead, in which
/// case it returns `Err(ConnectionError::Protocol("heartbeat"))` so the
/// caller can close the connection with that reason (§4.3).
pub async fn run(
    params: HeartbeatParams,
    send_request: impl Fn() -> ConnResult<()>,
    mut replies: mpsc::Receiver<HeartbeatReply>,
    cancel: CancellationToken,
) -> ConnResult<()> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(params.interval) => {},
        }

        let mut succeeded = false;
        for attempt in 1..=params.retries {
            send_request()?;
            match timeout(params.wait, replies.recv()).await {
                Ok(Some(HeartbeatReply::Ok)) => {
                    succeeded = true;
                    break;
                },
                Ok(Some(HeartbeatReply::Error)) => {
                    warn!(attempt, "heartbeat reply carried an error status");
                },
                Ok(None) => return Err(ConnectionError::Protocol("heartbeat".to_string())),
                Err(_elapsed) => {
                    warn!(attempt, retries = params.retries, "heartbeat timed out");
                },
            }
            if attempt < params.retries {
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }

        if !succeeded {
            return Err(ConnectionError::Protocol("heartbeat".to_string()));
        }
        info!("heartbeat ok");
    }
}

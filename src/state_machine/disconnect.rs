// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `close()`'s `Disconnect.req`/`Disconnect.res` exchange (§4.3). Single
//! attempt, single timeout, no retransmission — unlike `Connect.req` the
//! spec does not ask for retry here, so a plain timeout suffices.

use std::time::Duration;

use tokio::{sync::oneshot, time::timeout};

use crate::{error::ConnResult, wire::Status};

pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends the disconnect request via `send_request` and waits up to
/// `DISCONNECT_TIMEOUT` for the matching `Disconnect.res`. Times out
/// silently (the caller tears the connection down either way) rather than
/// surfacing an error, since `close()` always proceeds to teardown.
pub async fn run(send_request: impl FnOnce() -> ConnResult<()>, reply: oneshot::Receiver<Status>) {
    if let Err(err) = send_request() {
        tracing::debug!(%err, "failed to send Disconnect.req, tearing down anyway");
        return;
    }
    match timeout(DISCONNECT_TIMEOUT, reply).await {
        Ok(Ok(status)) if status.is_ok() => tracing::debug!("Disconnect.res ok"),
        Ok(Ok(status)) => tracing::debug!(?status, "Disconnect.res carried an error status"),
        Ok(Err(_)) => tracing::debug!("Disconnect.res channel closed before a reply arrived"),
        Err(_elapsed) => tracing::debug!("Disconnect.res timed out"),
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tunneling connection mode (§4.4): `Tunneling.req`/`.ack`, 1s/2-attempt
//! ack budget, `L_Data.req` only (forbidden outright in `BusMonitor`).

use std::time::Duration;

use crate::{
    cemi::{CemiFrame, MessageCode},
    connection::ConnectionMode,
    error::{ConnResult, ConnectionError},
    wire::{Cri, DataAck, DataRequest, Frame, TunnelLayer},
};

const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 2;

pub struct TunnelMode {
    pub layer: TunnelLayer,
}

impl ConnectionMode for TunnelMode {
    fn cri(&self) -> Cri {
        Cri::Tunnel { layer: self.layer }
    }

    fn ack_timeout(&self) -> Duration {
        ACK_TIMEOUT
    }

    fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    fn validate_outgoing(&self, cemi: &CemiFrame) -> ConnResult<()> {
        if self.layer == TunnelLayer::BusMonitor {
            return Err(ConnectionError::IllegalState(
                "sending is forbidden on a BusMonitor tunnel".to_string(),
            ));
        }
        if cemi.message_code() != MessageCode::LDataReq {
            return Err(ConnectionError::IllegalState(format!(
                "{:?} is not a valid outgoing message code on a Link tunnel",
                cemi.message_code()
            )));
        }
        Ok(())
    }

    fn wrap_request(&self, request: DataRequest) -> Frame {
        Frame::TunnelingRequest(request)
    }

    fn wrap_ack(&self, ack: DataAck) -> Frame {
        Frame::TunnelingAck(ack)
    }
}

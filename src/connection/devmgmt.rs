// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Device-management connection mode (§4.4): `DeviceConfiguration.req`/
//! `.ack`, 10s/4-attempt ack budget, only `M_*` cEMI variants allowed.

use std::time::Duration;

use crate::{
    cemi::{CemiFrame, MessageCode},
    connection::ConnectionMode,
    error::{ConnResult, ConnectionError},
    wire::{Cri, DataAck, DataRequest, Frame},
};

const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 4;

pub struct DeviceManagementMode;

impl ConnectionMode for DeviceManagementMode {
    fn cri(&self) -> Cri {
        Cri::DeviceManagement
    }

    fn ack_timeout(&self) -> Duration {
        ACK_TIMEOUT
    }

    fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    fn validate_outgoing(&self, cemi: &CemiFrame) -> ConnResult<()> {
        match cemi.message_code() {
            MessageCode::DeviceManagement(_) => Ok(()),
            other => Err(ConnectionError::IllegalState(format!(
                "{other:?} is not a device-management cEMI variant"
            ))),
        }
    }

    fn wrap_request(&self, request: DataRequest) -> Frame {
        Frame::DeviceConfigurationRequest(request)
    }

    fn wrap_ack(&self, ack: DataAck) -> Frame {
        Frame::DeviceConfigurationAck(ack)
    }
}

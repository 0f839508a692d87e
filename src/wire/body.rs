// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-service body encode/decode (§4.1). Bodies mix fixed substructures
//! (HPAI, CRI/CRD) with opaque payloads (DIB blocks, cEMI frames) whose
//! internal layout this crate does not interpret, so bodies are hand-rolled
//! big-endian slicing rather than `zerocopy` structs.

use bytes::{Bytes, BytesMut};

use super::{
    cri::{Crd, Cri},
    hpai::Hpai,
};
use crate::error::MalformedFrame;

fn need(buf: &[u8], n: usize) -> Result<(), MalformedFrame> {
    if buf.len() < n {
        Err(MalformedFrame::BufferTooShort { need: n, got: buf.len() })
    } else {
        Ok(())
    }
}

/// Opaque Description Information Block list, as found in `SearchResponse`
/// and `DescriptionResponse` bodies. Internal DIB layout (device info,
/// supported service families, ...) is out of scope; callers that need it
/// get the raw bytes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDibs(pub Bytes);

/// One Search Request Parameter block, as attached to `SearchRequest` in
/// extended discovery (§6). Opaque: only the SRP header's length/type are
/// not even inspected here, this crate forwards whatever the caller built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srp(pub Bytes);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub discovery_endpoint: Hpai,
    pub srps: Vec<Srp>,
}

impl SearchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.discovery_endpoint.encode().to_vec();
        for srp in &self.srps {
            out.extend_from_slice(&srp.0);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        let discovery_endpoint = Hpai::decode(buf)?;
        let mut srps = Vec::new();
        let mut pos = super::hpai::HPAI_LEN;
        while pos < buf.len() {
            need(buf, pos + 1)?;
            let len = buf[pos] as usize;
            need(buf, pos + len)?;
            srps.push(Srp(Bytes::copy_from_slice(&buf[pos..pos + len])));
            pos += len;
        }
        Ok(Self { discovery_endpoint, srps })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub control_endpoint: Hpai,
    pub dibs: RawDibs,
}

impl SearchResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.control_endpoint.encode().to_vec();
        out.extend_from_slice(&self.dibs.0);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        let control_endpoint = Hpai::decode(buf)?;
        let rest = &buf[super::hpai::HPAI_LEN..];
        Ok(Self {
            control_endpoint,
            dibs: RawDibs(Bytes::copy_from_slice(rest)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionRequest {
    pub control_endpoint: Hpai,
}

impl DescriptionRequest {
    pub fn encode(&self) -> Vec<u8> {
        self.control_endpoint.encode().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        Ok(Self { control_endpoint: Hpai::decode(buf)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResponse {
    pub dibs: RawDibs,
}

impl DescriptionResponse {
    pub fn encode(&self) -> Vec<u8> {
        self.dibs.0.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        Ok(Self { dibs: RawDibs(Bytes::copy_from_slice(buf)) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub control_endpoint: Hpai,
    pub data_endpoint: Hpai,
    pub cri: Cri,
}

impl ConnectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.control_endpoint.encode().to_vec();
        out.extend_from_slice(&self.data_endpoint.encode());
        out.extend_from_slice(&self.cri.encode());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        let control_endpoint = Hpai::decode(buf)?;
        let data_endpoint = Hpai::decode(&buf[super::hpai::HPAI_LEN..])?;
        let (cri, _) = Cri::decode(&buf[2 * super::hpai::HPAI_LEN..])?;
        Ok(Self { control_endpoint, data_endpoint, cri })
    }
}

/// KNXnet/IP error/status codes from the common status table (§4.3). Only
/// the codes this crate's connection/secure state machines branch on are
/// named; anything else round-trips through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    HostProtocolType,
    VersionNotSupported,
    SequenceNumber,
    ConnectionId,
    ConnectionType,
    ConnectionOption,
    NoMoreConnections,
    DataConnection,
    KnxConnection,
    TunnelingLayer,
    Other(u8),
}

impl Status {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::NoError,
            0x01 => Self::HostProtocolType,
            0x02 => Self::VersionNotSupported,
            0x04 => Self::SequenceNumber,
            0x21 => Self::ConnectionId,
            0x22 => Self::ConnectionType,
            0x23 => Self::ConnectionOption,
            0x24 => Self::NoMoreConnections,
            0x26 => Self::DataConnection,
            0x27 => Self::KnxConnection,
            0x29 => Self::TunnelingLayer,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::NoError => 0x00,
            Self::HostProtocolType => 0x01,
            Self::VersionNotSupported => 0x02,
            Self::SequenceNumber => 0x04,
            Self::ConnectionId => 0x21,
            Self::ConnectionType => 0x22,
            Self::ConnectionOption => 0x23,
            Self::NoMoreConnections => 0x24,
            Self::DataConnection => 0x26,
            Self::KnxConnection => 0x27,
            Self::TunnelingLayer => 0x29,
            Self::Other(v) => v,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub channel_id: u8,
    pub status: Status,
    /// Only present when `status.is_ok()`.
    pub data_endpoint: Option<Hpai>,
    pub crd: Option<Crd>,
}

impl ConnectResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.channel_id, self.status.to_u8()];
        if let Some(data_endpoint) = &self.data_endpoint {
            out.extend_from_slice(&data_endpoint.encode());
        }
        if let Some(crd) = &self.crd {
            out.extend_from_slice(&crd.encode());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 2)?;
        let channel_id = buf[0];
        let status = Status::from_u8(buf[1]);
        if !status.is_ok() {
            return Ok(Self { channel_id, status, data_endpoint: None, crd: None });
        }
        let data_endpoint = Hpai::decode(&buf[2..])?;
        let (crd, _) = Crd::decode(&buf[2 + super::hpai::HPAI_LEN..])?;
        Ok(Self {
            channel_id,
            status,
            data_endpoint: Some(data_endpoint),
            crd: Some(crd),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    pub channel_id: u8,
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.channel_id, 0];
        out.extend_from_slice(&self.control_endpoint.encode());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 2)?;
        Ok(Self {
            channel_id: buf[0],
            control_endpoint: Hpai::decode(&buf[2..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    pub channel_id: u8,
    pub status: Status,
}

impl ConnectionStateResponse {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.channel_id, self.status.to_u8()]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 2)?;
        Ok(Self { channel_id: buf[0], status: Status::from_u8(buf[1]) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    pub channel_id: u8,
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.channel_id, 0];
        out.extend_from_slice(&self.control_endpoint.encode());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 2)?;
        Ok(Self {
            channel_id: buf[0],
            control_endpoint: Hpai::decode(&buf[2..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    pub channel_id: u8,
    pub status: Status,
}

impl DisconnectResponse {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.channel_id, self.status.to_u8()]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 2)?;
        Ok(Self { channel_id: buf[0], status: Status::from_u8(buf[1]) })
    }
}

/// Shared shape of `TunnelingRequest`/`DeviceConfigurationRequest`: a
/// 4-byte connection header (struct length, channel id, sequence, reserved)
/// followed by an opaque cEMI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub channel_id: u8,
    pub sequence: u8,
    pub cemi: Bytes,
}

const CONN_HEADER_LEN: u8 = 4;

impl DataRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(4 + self.cemi.len());
        out.extend_from_slice(&[CONN_HEADER_LEN, self.channel_id, self.sequence, 0]);
        out.extend_from_slice(&self.cemi);
        out.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 4)?;
        if buf[0] != CONN_HEADER_LEN {
            return Err(MalformedFrame::BadSubStructureLength {
                what: "connection header",
                want: CONN_HEADER_LEN as usize,
                got: buf[0] as usize,
            });
        }
        Ok(Self {
            channel_id: buf[1],
            sequence: buf[2],
            cemi: Bytes::copy_from_slice(&buf[4..]),
        })
    }
}

/// Shared shape of `TunnelingAck`/`DeviceConfigurationAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    pub channel_id: u8,
    pub sequence: u8,
    pub status: Status,
}

impl DataAck {
    pub fn encode(&self) -> Vec<u8> {
        vec![CONN_HEADER_LEN, self.channel_id, self.sequence, self.status.to_u8()]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 4)?;
        if buf[0] != CONN_HEADER_LEN {
            return Err(MalformedFrame::BadSubStructureLength {
                what: "connection header",
                want: CONN_HEADER_LEN as usize,
                got: buf[0] as usize,
            });
        }
        Ok(Self {
            channel_id: buf[1],
            sequence: buf[2],
            status: Status::from_u8(buf[3]),
        })
    }
}

/// `RoutingIndication` / `RoutingSystemBroadcast`: bare cEMI, no connection
/// header (§4.5 — routing is connectionless).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCemi {
    pub cemi: Bytes,
}

impl RoutingCemi {
    pub fn encode(&self) -> Vec<u8> {
        self.cemi.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        Ok(Self { cemi: Bytes::copy_from_slice(buf) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingLostMessage {
    pub device_state: u8,
    pub lost_message_count: u16,
}

impl RoutingLostMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![4, self.device_state];
        out.extend_from_slice(&self.lost_message_count.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 4)?;
        Ok(Self {
            device_state: buf[1],
            lost_message_count: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingBusy {
    pub device_state: u8,
    pub routing_busy_wait_ms: u16,
    pub routing_busy_control_field: u16,
}

impl RoutingBusy {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![6, self.device_state];
        out.extend_from_slice(&self.routing_busy_wait_ms.to_be_bytes());
        out.extend_from_slice(&self.routing_busy_control_field.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 6)?;
        Ok(Self {
            device_state: buf[1],
            routing_busy_wait_ms: u16::from_be_bytes([buf[2], buf[3]]),
            routing_busy_control_field: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

/// `SecureWrapper` (§4.7): opaque AEAD-sealed payload plus the 6-byte
/// sequence counter and the 6-byte serial/tag fields that accompany it on
/// the wire. The actual cryptographic unwrap lives in [`crate::secure`];
/// this is just the frame shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureWrapper {
    pub session_id: u16,
    pub sequence_info: [u8; 6],
    pub serial_number: [u8; 6],
    pub message_tag: u16,
    pub encrypted_payload: Bytes,
    pub mac: [u8; 16],
}

impl SecureWrapper {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.encrypted_payload.len() + 16);
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.extend_from_slice(&self.sequence_info);
        out.extend_from_slice(&self.serial_number);
        out.extend_from_slice(&self.message_tag.to_be_bytes());
        out.extend_from_slice(&self.encrypted_payload);
        out.extend_from_slice(&self.mac);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 16 + 16)?;
        let payload_len = buf.len() - 16 - 16;
        let mut sequence_info = [0u8; 6];
        sequence_info.copy_from_slice(&buf[2..8]);
        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&buf[8..14]);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&buf[16 + payload_len..]);
        Ok(Self {
            session_id: u16::from_be_bytes([buf[0], buf[1]]),
            sequence_info,
            serial_number,
            message_tag: u16::from_be_bytes([buf[14], buf[15]]),
            encrypted_payload: Bytes::copy_from_slice(&buf[16..16 + payload_len]),
            mac,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureSessionRequest {
    pub control_endpoint: Hpai,
    pub client_public_value: [u8; 32],
}

impl SecureSessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.control_endpoint.encode().to_vec();
        out.extend_from_slice(&self.client_public_value);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        let control_endpoint = Hpai::decode(buf)?;
        let rest = &buf[super::hpai::HPAI_LEN..];
        need(rest, 32)?;
        let mut client_public_value = [0u8; 32];
        client_public_value.copy_from_slice(&rest[..32]);
        Ok(Self { control_endpoint, client_public_value })
    }
}

/// A server's reply to `SessionRequest` (§4.7 step 1). Total frame length
/// is either 0x38 (accepted: session id, public value, MAC) or 0x08 (early
/// rejection: session id only, no key material — the server has no free
/// session slot and closes the handshake right there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureSessionResponse {
    Accepted { session_id: u16, server_public_value: [u8; 32], mac: [u8; 16] },
    EarlyRejection { session_id: u16 },
}

impl SecureSessionResponse {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Accepted { session_id, server_public_value, mac } => {
                let mut out = session_id.to_be_bytes().to_vec();
                out.extend_from_slice(server_public_value);
                out.extend_from_slice(mac);
                out
            },
            Self::EarlyRejection { session_id } => session_id.to_be_bytes().to_vec(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 2)?;
        let session_id = u16::from_be_bytes([buf[0], buf[1]]);
        match buf.len() {
            2 => Ok(Self::EarlyRejection { session_id }),
            50 => {
                let mut server_public_value = [0u8; 32];
                server_public_value.copy_from_slice(&buf[2..34]);
                let mut mac = [0u8; 16];
                mac.copy_from_slice(&buf[34..50]);
                Ok(Self::Accepted { session_id, server_public_value, mac })
            },
            got => Err(MalformedFrame::BadSubStructureLength {
                what: "SecureSessionResponse",
                want: 50,
                got,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureSessionAuth {
    pub user_id: u8,
    pub message_authentication_code: [u8; 16],
}

impl SecureSessionAuth {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0, self.user_id];
        out.extend_from_slice(&self.message_authentication_code);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 18)?;
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&buf[2..18]);
        Ok(Self { user_id: buf[1], message_authentication_code: mac })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureSessionStatus {
    pub status: SecureStatus,
}

/// Status codes carried in `SecureSessionStatus` (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureStatus {
    AuthSuccess,
    AuthFailed,
    Unauthenticated,
    Timeout,
    KeepAlive,
    CloseSession,
    Other(u8),
}

impl SecureStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::AuthSuccess,
            0x01 => Self::AuthFailed,
            0x02 => Self::Unauthenticated,
            0x03 => Self::Timeout,
            0x04 => Self::KeepAlive,
            0x05 => Self::CloseSession,
            other => Self::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::AuthSuccess => 0x00,
            Self::AuthFailed => 0x01,
            Self::Unauthenticated => 0x02,
            Self::Timeout => 0x03,
            Self::KeepAlive => 0x04,
            Self::CloseSession => 0x05,
            Self::Other(v) => v,
        }
    }
}

impl SecureSessionStatus {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.status.to_u8()]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 1)?;
        Ok(Self { status: SecureStatus::from_u8(buf[0]) })
    }
}

/// `SecureGroupSync` (§4.9): multicast group-timer synchronization
/// heartbeat, MAC-protected but never encrypted (it carries no secret
/// payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureGroupSync {
    pub timer_value: [u8; 6],
    pub serial_number: [u8; 6],
    pub message_tag: u16,
    pub mac: [u8; 16],
}

impl SecureGroupSync {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(30);
        out.extend_from_slice(&self.timer_value);
        out.extend_from_slice(&self.serial_number);
        out.extend_from_slice(&self.message_tag.to_be_bytes());
        out.extend_from_slice(&self.mac);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        need(buf, 30)?;
        let mut timer_value = [0u8; 6];
        timer_value.copy_from_slice(&buf[0..6]);
        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&buf[6..12]);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&buf[14..30]);
        Ok(Self {
            timer_value,
            serial_number,
            message_tag: u16::from_be_bytes([buf[12], buf[13]]),
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_round_trips() {
        let req = ConnectRequest {
            control_endpoint: Hpai::ZERO_UDP,
            data_endpoint: Hpai::ZERO_UDP,
            cri: Cri::Tunnel { layer: super::super::cri::TunnelLayer::Link },
        };
        let bytes = req.encode();
        assert_eq!(ConnectRequest::decode(&bytes).expect("decode"), req);
    }

    #[test]
    fn connect_response_error_status_has_no_payload() {
        let bytes = vec![7, 0x24];
        let resp = ConnectResponse::decode(&bytes).expect("decode");
        assert_eq!(resp.channel_id, 7);
        assert!(!resp.status.is_ok());
        assert!(resp.data_endpoint.is_none());
        assert!(resp.crd.is_none());
    }

    #[test]
    fn data_request_round_trips() {
        let req = DataRequest {
            channel_id: 3,
            sequence: 9,
            cemi: Bytes::from_static(&[0x29, 0x00, 0xbc, 0xe0, 0x11, 0x01, 0x0a, 0x01, 0x01, 0x00]),
        };
        let bytes = req.encode();
        assert_eq!(DataRequest::decode(&bytes).expect("decode"), req);
    }

    #[test]
    fn secure_wrapper_round_trips() {
        let wrapper = SecureWrapper {
            session_id: 1,
            sequence_info: [0, 0, 0, 0, 0, 1],
            serial_number: [0xAA; 6],
            message_tag: 0,
            encrypted_payload: Bytes::from_static(&[1, 2, 3, 4]),
            mac: [0x42; 16],
        };
        let bytes = wrapper.encode();
        assert_eq!(SecureWrapper::decode(&bytes).expect("decode"), wrapper);
    }
}

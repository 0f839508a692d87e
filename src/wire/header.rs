// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::error::MalformedFrame;

pub const HEADER_LEN: usize = 6;
pub const PROTOCOL_VERSION_10: u8 = 0x10;
const STRUCT_LENGTH: u8 = 0x06;

/// All KNXnet/IP service type codes this core understands (§4.1). The
/// compatibility surface is the 16-bit wire value; unknown values decode to
/// [`MalformedFrame::UnknownService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    SearchRequest = 0x0201,
    SearchResponse = 0x0202,
    DescriptionRequest = 0x0203,
    DescriptionResponse = 0x0204,
    ConnectRequest = 0x0205,
    ConnectResponse = 0x0206,
    ConnectionStateRequest = 0x0207,
    ConnectionStateResponse = 0x0208,
    DisconnectRequest = 0x0209,
    DisconnectResponse = 0x020A,
    DeviceConfigurationRequest = 0x0310,
    DeviceConfigurationAck = 0x0311,
    TunnelingRequest = 0x0420,
    TunnelingAck = 0x0421,
    RoutingIndication = 0x0530,
    RoutingLostMessage = 0x0531,
    RoutingBusy = 0x0532,
    RoutingSystemBroadcast = 0x0536,
    SecureWrapper = 0x0950,
    SecureSessionRequest = 0x0951,
    SecureSessionResponse = 0x0952,
    SecureSessionAuth = 0x0953,
    SecureSessionStatus = 0x0954,
    SecureGroupSync = 0x0955,
}

impl ServiceType {
    pub const fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0201 => Self::SearchRequest,
            0x0202 => Self::SearchResponse,
            0x0203 => Self::DescriptionRequest,
            0x0204 => Self::DescriptionResponse,
            0x0205 => Self::ConnectRequest,
            0x0206 => Self::ConnectResponse,
            0x0207 => Self::ConnectionStateRequest,
            0x0208 => Self::ConnectionStateResponse,
            0x0209 => Self::DisconnectRequest,
            0x020A => Self::DisconnectResponse,
            0x0310 => Self::DeviceConfigurationRequest,
            0x0311 => Self::DeviceConfigurationAck,
            0x0420 => Self::TunnelingRequest,
            0x0421 => Self::TunnelingAck,
            0x0530 => Self::RoutingIndication,
            0x0531 => Self::RoutingLostMessage,
            0x0532 => Self::RoutingBusy,
            0x0536 => Self::RoutingSystemBroadcast,
            0x0950 => Self::SecureWrapper,
            0x0951 => Self::SecureSessionRequest,
            0x0952 => Self::SecureSessionResponse,
            0x0953 => Self::SecureSessionAuth,
            0x0954 => Self::SecureSessionStatus,
            0x0955 => Self::SecureGroupSync,
            _ => return None,
        })
    }

    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Wire-exact, fixed 6-byte KNXnet/IP header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawHeader {
    struct_length: u8,
    protocol_version: u8,
    service_type: U16<BigEndian>,
    total_length: U16<BigEndian>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub service_type: ServiceType,
    /// header length (6) + body length.
    pub total_length: u16,
}

impl Header {
    pub fn new(service_type: ServiceType, body_len: usize) -> Self {
        Self {
            service_type,
            total_length: (HEADER_LEN + body_len) as u16,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let raw = RawHeader {
            struct_length: STRUCT_LENGTH,
            protocol_version: PROTOCOL_VERSION_10,
            service_type: self.service_type.to_u16().into(),
            total_length: self.total_length.into(),
        };
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        if buf.len() < HEADER_LEN {
            return Err(MalformedFrame::BufferTooShort {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }
        let raw = RawHeader::ref_from_bytes(&buf[..HEADER_LEN])
            .map_err(|_| MalformedFrame::BufferTooShort {
                need: HEADER_LEN,
                got: buf.len(),
            })?;
        if raw.struct_length != STRUCT_LENGTH {
            return Err(MalformedFrame::BadStructLength(raw.struct_length));
        }
        if raw.protocol_version != PROTOCOL_VERSION_10 {
            return Err(MalformedFrame::BadProtocolVersion(raw.protocol_version));
        }
        let service_type = ServiceType::from_u16(raw.service_type.get())
            .ok_or(MalformedFrame::UnknownService(raw.service_type.get()))?;
        Ok(Self {
            service_type,
            total_length: raw.total_length.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let h = Header::new(ServiceType::ConnectRequest, 100);
        let bytes = h.encode();
        let decoded = Header::decode(&bytes).expect("decode");
        assert_eq!(decoded, h);
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = Header::new(ServiceType::ConnectRequest, 0).encode();
        bytes[1] = 0x11;
        assert_eq!(
            Header::decode(&bytes),
            Err(MalformedFrame::BadProtocolVersion(0x11))
        );
    }

    #[test]
    fn rejects_unknown_service() {
        let mut bytes = Header::new(ServiceType::ConnectRequest, 0).encode();
        bytes[2] = 0xFF;
        bytes[3] = 0xFF;
        assert_eq!(Header::decode(&bytes), Err(MalformedFrame::UnknownService(0xFFFF)));
    }
}

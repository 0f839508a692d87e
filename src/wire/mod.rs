// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! KNXnet/IP wire codec (C1, §4.1). Exposes a single [`Frame`] sum type and
//! the two pure functions the rest of the crate is built around:
//! [`encode`] and [`decode`].

pub mod body;
pub mod cri;
pub mod header;
pub mod hpai;

use bytes::Bytes;

pub use body::*;
pub use cri::{Crd, Cri, TunnelLayer};
pub use header::{Header, ServiceType, HEADER_LEN, PROTOCOL_VERSION_10};
pub use hpai::{HostProtocol, Hpai, HPAI_LEN};

use crate::error::MalformedFrame;

/// One decoded KNXnet/IP frame: header's service type fixes the body shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
    DescriptionRequest(DescriptionRequest),
    DescriptionResponse(DescriptionResponse),
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    ConnectionStateRequest(ConnectionStateRequest),
    ConnectionStateResponse(ConnectionStateResponse),
    DisconnectRequest(DisconnectRequest),
    DisconnectResponse(DisconnectResponse),
    DeviceConfigurationRequest(DataRequest),
    DeviceConfigurationAck(DataAck),
    TunnelingRequest(DataRequest),
    TunnelingAck(DataAck),
    RoutingIndication(RoutingCemi),
    RoutingLostMessage(RoutingLostMessage),
    RoutingBusy(RoutingBusy),
    RoutingSystemBroadcast(RoutingCemi),
    SecureWrapper(SecureWrapper),
    SecureSessionRequest(SecureSessionRequest),
    SecureSessionResponse(SecureSessionResponse),
    SecureSessionAuth(SecureSessionAuth),
    SecureSessionStatus(SecureSessionStatus),
    SecureGroupSync(SecureGroupSync),
}

impl Frame {
    pub fn service_type(&self) -> ServiceType {
        match self {
            Self::SearchRequest(_) => ServiceType::SearchRequest,
            Self::SearchResponse(_) => ServiceType::SearchResponse,
            Self::DescriptionRequest(_) => ServiceType::DescriptionRequest,
            Self::DescriptionResponse(_) => ServiceType::DescriptionResponse,
            Self::ConnectRequest(_) => ServiceType::ConnectRequest,
            Self::ConnectResponse(_) => ServiceType::ConnectResponse,
            Self::ConnectionStateRequest(_) => ServiceType::ConnectionStateRequest,
            Self::ConnectionStateResponse(_) => ServiceType::ConnectionStateResponse,
            Self::DisconnectRequest(_) => ServiceType::DisconnectRequest,
            Self::DisconnectResponse(_) => ServiceType::DisconnectResponse,
            Self::DeviceConfigurationRequest(_) => ServiceType::DeviceConfigurationRequest,
            Self::DeviceConfigurationAck(_) => ServiceType::DeviceConfigurationAck,
            Self::TunnelingRequest(_) => ServiceType::TunnelingRequest,
            Self::TunnelingAck(_) => ServiceType::TunnelingAck,
            Self::RoutingIndication(_) => ServiceType::RoutingIndication,
            Self::RoutingLostMessage(_) => ServiceType::RoutingLostMessage,
            Self::RoutingBusy(_) => ServiceType::RoutingBusy,
            Self::RoutingSystemBroadcast(_) => ServiceType::RoutingSystemBroadcast,
            Self::SecureWrapper(_) => ServiceType::SecureWrapper,
            Self::SecureSessionRequest(_) => ServiceType::SecureSessionRequest,
            Self::SecureSessionResponse(_) => ServiceType::SecureSessionResponse,
            Self::SecureSessionAuth(_) => ServiceType::SecureSessionAuth,
            Self::SecureSessionStatus(_) => ServiceType::SecureSessionStatus,
            Self::SecureGroupSync(_) => ServiceType::SecureGroupSync,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Self::SearchRequest(b) => b.encode(),
            Self::SearchResponse(b) => b.encode(),
            Self::DescriptionRequest(b) => b.encode(),
            Self::DescriptionResponse(b) => b.encode(),
            Self::ConnectRequest(b) => b.encode(),
            Self::ConnectResponse(b) => b.encode(),
            Self::ConnectionStateRequest(b) => b.encode(),
            Self::ConnectionStateResponse(b) => b.encode(),
            Self::DisconnectRequest(b) => b.encode(),
            Self::DisconnectResponse(b) => b.encode(),
            Self::DeviceConfigurationRequest(b) => b.encode(),
            Self::DeviceConfigurationAck(b) => b.encode(),
            Self::TunnelingRequest(b) => b.encode(),
            Self::TunnelingAck(b) => b.encode(),
            Self::RoutingIndication(b) => b.encode(),
            Self::RoutingLostMessage(b) => b.encode(),
            Self::RoutingBusy(b) => b.encode(),
            Self::RoutingSystemBroadcast(b) => b.encode(),
            Self::SecureWrapper(b) => b.encode(),
            Self::SecureSessionRequest(b) => b.encode(),
            Self::SecureSessionResponse(b) => b.encode(),
            Self::SecureSessionAuth(b) => b.encode(),
            Self::SecureSessionStatus(b) => b.encode(),
            Self::SecureGroupSync(b) => b.encode(),
        }
    }
}

/// Serializes a frame to its complete wire form: 6-byte header + body.
pub fn encode(frame: &Frame) -> Bytes {
    let body = frame.encode_body();
    let header = Header::new(frame.service_type(), body.len());
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    Bytes::from(out)
}

/// Parses a complete wire frame. Per §4.2, a declared `total_length` that
/// exceeds the supplied buffer is always rejected rather than read past;
/// trailing bytes beyond `total_length` (as can happen on a stream
/// transport) are silently ignored, the caller is expected to frame TCP
/// reads by `total_length` itself.
pub fn decode(buf: &[u8]) -> Result<Frame, MalformedFrame> {
    let header = Header::decode(buf)?;
    let total_length = header.total_length as usize;
    if total_length > buf.len() {
        return Err(MalformedFrame::TotalLengthExceedsBuffer {
            declared: header.total_length,
            available: buf.len(),
        });
    }
    let body = &buf[HEADER_LEN..total_length];
    decode_body(header.service_type, body)
}

/// Decodes a frame body once its header has already been split off, so a
/// caller holding a pre-parsed `(service_type, body)` pair (a receive loop
/// that parsed the header eagerly, or a payload just recovered from a
/// `SecureWrapper`) does not have to re-encode a header just to call
/// [`decode`].
pub fn decode_body(service_type: ServiceType, body: &[u8]) -> Result<Frame, MalformedFrame> {
    Ok(match service_type {
        ServiceType::SearchRequest => Frame::SearchRequest(SearchRequest::decode(body)?),
        ServiceType::SearchResponse => Frame::SearchResponse(SearchResponse::decode(body)?),
        ServiceType::DescriptionRequest => {
            Frame::DescriptionRequest(DescriptionRequest::decode(body)?)
        },
        ServiceType::DescriptionResponse => {
            Frame::DescriptionResponse(DescriptionResponse::decode(body)?)
        },
        ServiceType::ConnectRequest => Frame::ConnectRequest(ConnectRequest::decode(body)?),
        ServiceType::ConnectResponse => Frame::ConnectResponse(ConnectResponse::decode(body)?),
        ServiceType::ConnectionStateRequest => {
            Frame::ConnectionStateRequest(ConnectionStateRequest::decode(body)?)
        },
        ServiceType::ConnectionStateResponse => {
            Frame::ConnectionStateResponse(ConnectionStateResponse::decode(body)?)
        },
        ServiceType::DisconnectRequest => Frame::DisconnectRequest(DisconnectRequest::decode(body)?),
        ServiceType::DisconnectResponse => {
            Frame::DisconnectResponse(DisconnectResponse::decode(body)?)
        },
        ServiceType::DeviceConfigurationRequest => {
            Frame::DeviceConfigurationRequest(DataRequest::decode(body)?)
        },
        ServiceType::DeviceConfigurationAck => Frame::DeviceConfigurationAck(DataAck::decode(body)?),
        ServiceType::TunnelingRequest => Frame::TunnelingRequest(DataRequest::decode(body)?),
        ServiceType::TunnelingAck => Frame::TunnelingAck(DataAck::decode(body)?),
        ServiceType::RoutingIndication => Frame::RoutingIndication(RoutingCemi::decode(body)?),
        ServiceType::RoutingLostMessage => {
            Frame::RoutingLostMessage(RoutingLostMessage::decode(body)?)
        },
        ServiceType::RoutingBusy => Frame::RoutingBusy(RoutingBusy::decode(body)?),
        ServiceType::RoutingSystemBroadcast => {
            Frame::RoutingSystemBroadcast(RoutingCemi::decode(body)?)
        },
        ServiceType::SecureWrapper => Frame::SecureWrapper(SecureWrapper::decode(body)?),
        ServiceType::SecureSessionRequest => {
            Frame::SecureSessionRequest(SecureSessionRequest::decode(body)?)
        },
        ServiceType::SecureSessionResponse => {
            Frame::SecureSessionResponse(SecureSessionResponse::decode(body)?)
        },
        ServiceType::SecureSessionAuth => Frame::SecureSessionAuth(SecureSessionAuth::decode(body)?),
        ServiceType::SecureSessionStatus => {
            Frame::SecureSessionStatus(SecureSessionStatus::decode(body)?)
        },
        ServiceType::SecureGroupSync => Frame::SecureGroupSync(SecureGroupSync::decode(body)?),
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn connect_request_round_trips_through_top_level_codec() {
        let frame = Frame::ConnectRequest(ConnectRequest {
            control_endpoint: Hpai {
                host_protocol: HostProtocol::Udp,
                addr: Ipv4Addr::new(10, 0, 0, 5),
                port: 54321,
            },
            data_endpoint: Hpai::ZERO_UDP,
            cri: Cri::Tunnel { layer: TunnelLayer::Link },
        });
        let bytes = encode(&frame);
        assert_eq!(decode(&bytes).expect("decode"), frame);
    }

    #[test]
    fn rejects_declared_length_past_buffer() {
        let frame = Frame::DisconnectRequest(DisconnectRequest {
            channel_id: 1,
            control_endpoint: Hpai::ZERO_UDP,
        });
        let mut bytes = encode(&frame).to_vec();
        bytes[4] = 0xFF;
        bytes[5] = 0xFF;
        assert!(matches!(
            decode(&bytes),
            Err(MalformedFrame::TotalLengthExceedsBuffer { .. })
        ));
    }
}

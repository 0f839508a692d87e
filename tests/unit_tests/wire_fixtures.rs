// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use knxnetip_core::wire::{
    self, ConnectRequest, Cri, DataAck, DataRequest, Frame, HostProtocol, Hpai, SecureSessionResponse,
    ServiceType, Status, TunnelLayer,
};

#[test]
fn connect_request_round_trips_through_public_codec() {
    let frame = Frame::ConnectRequest(ConnectRequest {
        control_endpoint: Hpai {
            host_protocol: HostProtocol::Udp,
            addr: Ipv4Addr::new(192, 168, 1, 5),
            port: 56340,
        },
        data_endpoint: Hpai {
            host_protocol: HostProtocol::Udp,
            addr: Ipv4Addr::new(192, 168, 1, 6),
            port: 5352,
        },
        cri: Cri::Tunnel { layer: TunnelLayer::Link },
    });
    let encoded = wire::encode(&frame);
    let decoded = wire::decode(&encoded).expect("decode");
    assert_eq!(decoded, frame);
    assert_eq!(decoded.service_type(), ServiceType::ConnectRequest);
}

#[test]
fn tunneling_ack_round_trips_through_public_codec() {
    let frame = Frame::TunnelingAck(DataAck {
        channel_id: 4,
        sequence: 12,
        status: Status::NoError,
    });
    let encoded = wire::encode(&frame);
    assert_eq!(wire::decode(&encoded).expect("decode"), frame);
}

#[test]
fn tunneling_request_carries_opaque_cemi() {
    let cemi =
        bytes::Bytes::from_static(&[0x29, 0x00, 0xbc, 0xe0, 0x11, 0x02, 0x0a, 0x01, 0x01, 0x00]);
    let frame = Frame::TunnelingRequest(DataRequest {
        channel_id: 1,
        sequence: 0,
        cemi: cemi.clone(),
    });
    let encoded = wire::encode(&frame);
    let Frame::TunnelingRequest(decoded) = wire::decode(&encoded).expect("decode") else {
        panic!("expected TunnelingRequest");
    };
    assert_eq!(decoded.cemi, cemi);
}

#[test]
fn secure_session_response_round_trips_both_accepted_and_early_rejection_shapes() {
    let accepted =
        Frame::SecureSessionResponse(SecureSessionResponse::Accepted {
            session_id: 7,
            server_public_value: [0x11; 32],
            mac: [0x22; 16],
        });
    let encoded = wire::encode(&accepted);
    assert_eq!(wire::decode(&encoded).expect("decode"), accepted);

    let rejected = Frame::SecureSessionResponse(SecureSessionResponse::EarlyRejection { session_id: 7 });
    let encoded = wire::encode(&rejected);
    assert_eq!(wire::decode(&encoded).expect("decode"), rejected);
}

#[test]
fn secure_session_response_rejects_a_length_matching_neither_shape() {
    let err = SecureSessionResponse::decode(&[0, 7, 1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        knxnetip_core::error::MalformedFrame::BadSubStructureLength { .. }
    ));
}

#[test]
fn decode_rejects_truncated_header() {
    let err = wire::decode(&[0x06, 0x10, 0x02]).unwrap_err();
    assert!(matches!(
        err,
        knxnetip_core::error::MalformedFrame::BufferTooShort { .. }
    ));
}

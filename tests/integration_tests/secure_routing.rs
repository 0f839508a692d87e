// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use knxnetip_core::{
    cemi::CemiFrame,
    listener::Event,
    routing::Routing,
    secure::routing::{unwrap_group_frame, wrap_group_frame, GroupTimer},
    wire::{self, Frame, RoutingCemi, SecureWrapper},
};
use tokio::net::UdpSocket;

const BACKBONE_KEY: [u8; 16] = [0x5A; 16];
const GROUP: Ipv4Addr = Ipv4Addr::new(239, 41, 6, 30);

fn l_data_ind(source: u16, dest: u16, tpdu: &[u8]) -> CemiFrame {
    let mut raw = vec![0x29, 0x00, 0xBC, 0xE0];
    raw.extend_from_slice(&source.to_be_bytes());
    raw.extend_from_slice(&dest.to_be_bytes());
    raw.push(tpdu.len() as u8 - 1);
    raw.extend_from_slice(tpdu);
    CemiFrame::from_bytes(Bytes::from(raw)).expect("valid frame")
}

/// A `new_routing` instance wraps every outgoing `Routing.ind` under the
/// backbone key and unwraps secured frames from a foreign station,
/// matching the plain multicast cycle in `routing_loopback_suppression.rs`
/// but with §4.8 group-timer framing on both ends.
#[tokio::test]
async fn secure_routing_wraps_outgoing_and_accepts_incoming() {
    let routing = Routing::new_routing(Ipv4Addr::LOCALHOST, GROUP, BACKBONE_KEY, Duration::from_secs(2))
        .await
        .expect("join secure routing group");

    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = events.clone();
    routing.add_listener(Arc::new(move |event: &Event| {
        collected.lock().expect("lock").push(event.clone());
    }));

    // A foreign station observes our outgoing frame as an encrypted wrapper.
    let foreign_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.expect("bind foreign socket");
    foreign_socket
        .join_multicast_v4(GROUP, Ipv4Addr::LOCALHOST)
        .expect("foreign socket joins group");

    let own_frame = l_data_ind(0x1101, 0x0901, &[0x00, 0x80]);
    routing.send(own_frame.clone()).await.expect("send secured frame");

    let mut buf = vec![0u8; 512];
    let (len, _source) = tokio::time::timeout(Duration::from_secs(2), foreign_socket.recv_from(&mut buf))
        .await
        .expect("foreign recv timed out")
        .expect("foreign recv failed");
    let frame = wire::decode(&buf[..len]).expect("decode outgoing frame");
    let Frame::SecureWrapper(wrapper) = frame else {
        panic!("outgoing routing frame must be a SecureWrapper, got {:?}", frame.service_type());
    };
    let foreign_timer = GroupTimer::new();
    let decrypted = unwrap_group_frame(BACKBONE_KEY, &foreign_timer, Duration::from_secs(2), &wrapper)
        .expect("foreign station can unwrap our backbone-keyed frame");
    let inner = wire::decode(&decrypted).expect("decode inner frame");
    assert_eq!(inner.service_type(), wire::ServiceType::RoutingIndication);

    // A frame secured by a foreign station under the same backbone key is
    // delivered to our listeners once unwrapped.
    let foreign_frame = l_data_ind(0x1102, 0x0901, &[0x00, 0x81]);
    let foreign_timer_send = GroupTimer::new();
    let wrapper: SecureWrapper = wrap_group_frame(
        BACKBONE_KEY,
        foreign_timer_send.now_ms(),
        [9, 9, 9, 9, 9, 9],
        0,
        &wire::encode(&Frame::RoutingIndication(RoutingCemi { cemi: foreign_frame.as_bytes().clone() })),
    );
    let encoded = wire::encode(&Frame::SecureWrapper(wrapper));
    foreign_socket.send_to(&encoded, (GROUP, 3671)).await.expect("send secured foreign frame");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let seen = events.lock().expect("lock");
    assert!(
        seen.iter().any(|e| matches!(e, Event::Frame(f) if f == &foreign_frame)),
        "secured frame from a foreign station should be delivered once unwrapped"
    );
}

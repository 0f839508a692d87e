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
    cfg::config::RoutingConfig,
    listener::Event,
    routing::Routing,
    wire::{self, Frame, RoutingCemi},
};
use tokio::net::UdpSocket;

fn l_data_ind(source: u16, dest: u16, tpdu: &[u8]) -> CemiFrame {
    let mut raw = vec![0x29, 0x00, 0xBC, 0xE0];
    raw.extend_from_slice(&source.to_be_bytes());
    raw.extend_from_slice(&dest.to_be_bytes());
    raw.push(tpdu.len() as u8 - 1);
    raw.extend_from_slice(tpdu);
    CemiFrame::from_bytes(Bytes::from(raw)).expect("valid frame")
}

/// A routing instance must drop its own multicast echo but still deliver a
/// frame sent by a different station on the same group (§8 scenario 6's
/// two-station shape, modelled with a second raw socket standing in for the
/// foreign station).
#[tokio::test]
async fn own_frame_suppressed_foreign_frame_delivered() {
    let group = Ipv4Addr::new(239, 41, 5, 23);
    let cfg = RoutingConfig { multicast_group: group, multicast_port: 0, ..Default::default() };
    let mut cfg = cfg;
    // Bind to an OS-assigned port by probing one first, since Routing::join
    // binds to the configured port directly.
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.expect("probe bind");
    cfg.multicast_port = probe.local_addr().expect("local_addr").port();
    drop(probe);

    let routing = Routing::join(&cfg, Ipv4Addr::LOCALHOST).await.expect("join routing group");

    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = events.clone();
    routing.add_listener(Arc::new(move |event: &Event| {
        collected.lock().expect("lock").push(event.clone());
    }));

    let own_frame = l_data_ind(0x1101, 0x0901, &[0x00, 0x80]);
    routing.send(own_frame.clone()).await.expect("send own frame");
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let seen = events.lock().expect("lock");
        assert!(
            !seen.iter().any(|e| matches!(e, Event::Frame(f) if f == &own_frame)),
            "own sent frame should be suppressed as a loopback echo"
        );
    }

    let foreign_frame = l_data_ind(0x1102, 0x0901, &[0x00, 0x81]);
    let foreign_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.expect("bind foreign socket");
    let encoded = wire::encode(&Frame::RoutingIndication(RoutingCemi { cemi: foreign_frame.as_bytes().clone() }));
    foreign_socket.send_to(&encoded, (group, cfg.multicast_port)).await.expect("send foreign frame");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let seen = events.lock().expect("lock");
    assert!(
        seen.iter().any(|e| matches!(e, Event::Frame(f) if f == &foreign_frame)),
        "frame from a foreign station should be delivered to listeners"
    );
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use knxnetip_core::{
    address::IndividualAddress,
    connection::{tunnel::TunnelMode, Connection, VisibleState},
    wire::{self, Crd, Frame, ServiceType, Status, TunnelLayer},
};

use super::common::bind_server;

/// A server that never answers `ConnectionState.req` should drive the
/// connection to `Closed` once the heartbeat's retry budget is exhausted
/// (§8 scenario 3's failure shape, applied to the heartbeat instead of the
/// connect handshake).
#[tokio::test]
async fn heartbeat_failure_closes_the_connection() {
    let (server, server_hpai) = bind_server().await;

    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        let (len, client_addr) = server.recv_from(&mut buf).await.expect("recv connect request");
        let frame = wire::decode(&buf[..len]).expect("decode connect request");
        assert_eq!(frame.service_type(), ServiceType::ConnectRequest);

        let response = Frame::ConnectResponse(knxnetip_core::wire::ConnectResponse {
            channel_id: 3,
            status: Status::NoError,
            data_endpoint: Some(server_hpai),
            crd: Some(Crd::Tunnel {
                individual_address: IndividualAddress::new(1, 1, 9).expect("valid address"),
            }),
        });
        server.send_to(&wire::encode(&response), client_addr).await.expect("send connect response");

        // Silently drop every subsequent datagram (heartbeats included).
        loop {
            if server.recv_from(&mut buf).await.is_err() {
                return;
            }
        }
    });

    let mut cfg = super::common::default_connection_config("ignored");
    cfg.ack_timeout = Duration::from_millis(300);
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.heartbeat_wait = Duration::from_millis(50);
    cfg.heartbeat_retries = 2;

    let conn = Connection::connect(cfg, Box::new(TunnelMode { layer: TunnelLayer::Link }), server_hpai)
        .await
        .expect("connect");
    assert_eq!(conn.state(), VisibleState::Ok);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(conn.state(), VisibleState::Closed);
}

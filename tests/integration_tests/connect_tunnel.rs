// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use knxnetip_core::{
    address::IndividualAddress,
    connection::{tunnel::TunnelMode, Connection, VisibleState},
    wire::{self, Crd, DisconnectResponse, Frame, ServiceType, Status, TunnelLayer},
};

use super::common::bind_server;

/// Drives a full connect/disconnect cycle against a fake server, matching
/// the end-to-end scenario of Connect.req/.res followed by a clean
/// Disconnect.req/.res exchange.
#[tokio::test]
async fn connects_and_disconnects_cleanly() {
    let (server, server_hpai) = bind_server().await;

    let server_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        let (len, client_addr) = server.recv_from(&mut buf).await.expect("recv connect request");
        let frame = wire::decode(&buf[..len]).expect("decode connect request");
        assert_eq!(frame.service_type(), ServiceType::ConnectRequest);

        let response = Frame::ConnectResponse(knxnetip_core::wire::ConnectResponse {
            channel_id: 7,
            status: Status::NoError,
            data_endpoint: Some(server_hpai),
            crd: Some(Crd::Tunnel {
                individual_address: IndividualAddress::new(1, 1, 5).expect("valid address"),
            }),
        });
        server.send_to(&wire::encode(&response), client_addr).await.expect("send connect response");

        let (len, client_addr) = server.recv_from(&mut buf).await.expect("recv disconnect request");
        let frame = wire::decode(&buf[..len]).expect("decode disconnect request");
        assert_eq!(frame.service_type(), ServiceType::DisconnectRequest);

        let response = Frame::DisconnectResponse(DisconnectResponse { channel_id: 7, status: Status::NoError });
        server.send_to(&wire::encode(&response), client_addr).await.expect("send disconnect response");
    });

    let mut cfg = super::common::default_connection_config("ignored");
    cfg.ack_timeout = Duration::from_millis(500);
    cfg.heartbeat_interval = Duration::from_secs(60);

    let conn = Connection::connect(cfg, Box::new(TunnelMode { layer: TunnelLayer::Link }), server_hpai)
        .await
        .expect("connect");
    assert_eq!(conn.state(), VisibleState::Ok);

    conn.close().await;
    assert_eq!(conn.state(), VisibleState::Closed);

    tokio::time::timeout(Duration::from_secs(2), server_task).await.expect("server task timed out").expect("server task panicked");
}

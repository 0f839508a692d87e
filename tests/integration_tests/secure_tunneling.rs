// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use knxnetip_core::{
    address::IndividualAddress,
    connection::{Connection, VisibleState},
    secure::session::Session,
    wire::{self, Crd, DisconnectResponse, Frame, Header, ServiceType, Status, TunnelLayer, HEADER_LEN},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::common::bind_server_tcp;

const SESSION_KEY: [u8; 16] = [0x5A; 16];
const SERIAL: [u8; 6] = [1, 2, 3, 4, 5, 6];

fn unwrap_secure(buf: &[u8], session: &Session) -> Frame {
    let frame = wire::decode(buf).expect("decode outer frame");
    let Frame::SecureWrapper(wrapper) = frame else {
        panic!("expected a SecureWrapper frame, got {:?}", frame.service_type());
    };
    let decrypted = session.unwrap(&wrapper, 0).expect("unwrap secure wrapper");
    wire::decode(&decrypted).expect("decode inner frame")
}

fn wrap_secure(frame: &Frame, session: &Session) -> bytes::Bytes {
    let encoded = wire::encode(frame);
    let wrapper = session.wrap(&encoded, 0).expect("wrap secure wrapper");
    wire::encode(&Frame::SecureWrapper(wrapper))
}

/// Reads one length-framed KNXnet/IP frame off `stream` (header, then
/// exactly `total_length - 6` more bytes) and unwraps it as a
/// `SecureWrapper`, the same split-read a real secure unicast peer does.
async fn read_secure_frame(stream: &mut TcpStream, session: &Session) -> Frame {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.expect("read frame header");
    let header = Header::decode(&header_buf).expect("decode frame header");
    let mut body = vec![0u8; header.total_length as usize - HEADER_LEN];
    stream.read_exact(&mut body).await.expect("read frame body");
    let mut buf = header_buf.to_vec();
    buf.extend_from_slice(&body);
    unwrap_secure(&buf, session)
}

/// A `new_tunneling` connection wraps every control frame in a
/// `SecureWrapper` under the already-established session, matching the
/// plain tunneling cycle in `connect_tunnel.rs` but with a secure peer on
/// both ends of the exchange, carried over TCP instead of UDP (§4.7/§8
/// "C3").
#[tokio::test]
async fn secure_tunneling_connects_and_disconnects() {
    let (listener, server_hpai) = bind_server_tcp().await;
    let server_session = Session::new(9, SESSION_KEY, SERIAL);

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept tcp connection");

        let inner = read_secure_frame(&mut stream, &server_session).await;
        assert_eq!(inner.service_type(), ServiceType::ConnectRequest);

        let response = Frame::ConnectResponse(knxnetip_core::wire::ConnectResponse {
            channel_id: 9,
            status: Status::NoError,
            data_endpoint: Some(server_hpai),
            crd: Some(Crd::Tunnel {
                individual_address: IndividualAddress::new(1, 1, 9).expect("valid address"),
            }),
        });
        let wire_bytes = wrap_secure(&response, &server_session);
        stream.write_all(&wire_bytes).await.expect("send connect response");

        let inner = read_secure_frame(&mut stream, &server_session).await;
        assert_eq!(inner.service_type(), ServiceType::DisconnectRequest);

        let response = Frame::DisconnectResponse(DisconnectResponse { channel_id: 9, status: Status::NoError });
        let wire_bytes = wrap_secure(&response, &server_session);
        stream.write_all(&wire_bytes).await.expect("send disconnect response");
    });

    let mut cfg = super::common::default_connection_config("ignored");
    cfg.ack_timeout = Duration::from_millis(500);
    cfg.heartbeat_interval = Duration::from_secs(60);

    let client_session = Session::new(9, SESSION_KEY, SERIAL);
    let conn = Connection::new_tunneling(cfg, TunnelLayer::Link, client_session, server_hpai)
        .await
        .expect("secure connect");
    assert_eq!(conn.state(), VisibleState::Ok);

    conn.close().await;
    assert_eq!(conn.state(), VisibleState::Closed);

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .expect("server task timed out")
        .expect("server task panicked");
}

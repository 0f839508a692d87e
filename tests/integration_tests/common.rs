// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, sync::OnceLock};

use knxnetip_core::wire::{HostProtocol, Hpai};
use tokio::net::{TcpListener, UdpSocket};

static LOGGING: OnceLock<()> = OnceLock::new();

/// Initializes the crate's JSON tracing subscriber once per test binary
/// (§10.3), so integration tests produce the same structured logs a real
/// deployment would get under `cargo test -- --nocapture`. The returned
/// `WorkerGuard` is intentionally leaked: dropping it would stop the
/// non-blocking writer thread for the rest of the process.
fn init_test_logging() {
    LOGGING.get_or_init(|| {
        if let Ok(guard) = knxnetip_core::cfg::logger::init_logger("tests/integration_tests/logger.yaml") {
            std::mem::forget(guard);
        }
    });
}

/// Binds a loopback UDP socket standing in for a KNXnet/IP server, and
/// returns it alongside the `Hpai` a client would dial.
pub async fn bind_server() -> (UdpSocket, Hpai) {
    init_test_logging();
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind server socket");
    let port = socket.local_addr().expect("local_addr").port();
    let hpai = Hpai { host_protocol: HostProtocol::Udp, addr: Ipv4Addr::LOCALHOST, port };
    (socket, hpai)
}

/// Binds a loopback TCP listener standing in for a KNX IP Secure unicast
/// server (§4.7/§8 "C3"), and returns it alongside the `Hpai` a secure
/// client would dial.
pub async fn bind_server_tcp() -> (TcpListener, Hpai) {
    init_test_logging();
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind tcp server socket");
    let port = listener.local_addr().expect("local_addr").port();
    let hpai = Hpai { host_protocol: HostProtocol::Tcp, addr: Ipv4Addr::LOCALHOST, port };
    (listener, hpai)
}

pub fn default_connection_config(remote: &str) -> knxnetip_core::cfg::config::ConnectionConfig {
    let mut cfg = knxnetip_core::cfg::config::ConnectionConfig::default();
    cfg.remote_control_endpoint = remote.to_string();
    cfg
}

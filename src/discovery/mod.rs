// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Discoverer (§4.6 "C7"): multicast search across NICs and one-shot
//! unicast description. A single future races a timeout; no state machine
//! is needed since neither exchange retransmits.

use std::{net::Ipv4Addr, time::Duration};

use tokio::{net::UdpSocket, time::timeout};

use crate::{
    cfg::config::{DiscoveryConfig, RoutingConfig},
    error::{ConnResult, ConnectionError},
    net::udp::MAX_DATAGRAM,
    wire::{
        self, DescriptionRequest, DescriptionResponse, Frame, HostProtocol, Hpai, RawDibs,
        SearchRequest, Srp,
    },
};

/// One `SearchResponse` collected during the discovery window, tagged with
/// which local NIC/address received it (§4.6 "{response, NIC, local IP}").
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub dibs: RawDibs,
    pub control_endpoint: Hpai,
    pub local_interface: Ipv4Addr,
}

/// Binds one socket per candidate local address, sends a `SearchRequest`
/// with the given SRPs on each, and collects `SearchResponse`s until
/// `cfg.search_timeout` elapses.
pub async fn search(
    cfg: &DiscoveryConfig,
    routing: &RoutingConfig,
    local_interfaces: &[Ipv4Addr],
    srps: Vec<Srp>,
) -> ConnResult<Vec<DiscoveryResult>> {
    let mut results = Vec::new();
    for &local_ip in local_interfaces {
        let socket = UdpSocket::bind((local_ip, 0)).await.map_err(ConnectionError::Io)?;
        if cfg.join_multicast_for_responses.as_bool() {
            socket
                .join_multicast_v4(routing.multicast_group, local_ip)
                .map_err(ConnectionError::Io)?;
        }

        let discovery_endpoint = Hpai::from_socket_addr(
            socket.local_addr().map_err(ConnectionError::Io)?.to_v4_checked()?,
            HostProtocol::Udp,
        );
        let request = Frame::SearchRequest(SearchRequest {
            discovery_endpoint,
            srps: srps.clone(),
        });
        let encoded = wire::encode(&request);
        socket
            .send_to(&encoded, (routing.multicast_group, routing.multicast_port))
            .await
            .map_err(ConnectionError::Io)?;

        collect_responses(&socket, cfg.search_timeout, local_ip, &mut results).await?;
    }
    Ok(results)
}

async fn collect_responses(
    socket: &UdpSocket,
    search_timeout: Duration,
    local_ip: Ipv4Addr,
    results: &mut Vec<DiscoveryResult>,
) -> ConnResult<()> {
    let deadline = tokio::time::Instant::now() + search_timeout;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        let Ok(received) = timeout(remaining, socket.recv(&mut buf)).await else {
            return Ok(());
        };
        let len = received.map_err(ConnectionError::Io)?;
        let Ok(frame) = wire::decode(&buf[..len]) else { continue };
        if let Frame::SearchResponse(response) = frame {
            results.push(DiscoveryResult {
                dibs: response.dibs,
                control_endpoint: response.control_endpoint,
                local_interface: local_ip,
            });
        }
    }
}

/// One-shot `DescriptionRequest` to a named control endpoint (§4.6).
pub async fn describe(
    cfg: &DiscoveryConfig,
    local_ip: Ipv4Addr,
    control_endpoint: Hpai,
) -> ConnResult<DescriptionResponse> {
    let socket = UdpSocket::bind((local_ip, 0)).await.map_err(ConnectionError::Io)?;
    let discovery_endpoint = Hpai::from_socket_addr(
        socket.local_addr().map_err(ConnectionError::Io)?.to_v4_checked()?,
        HostProtocol::Udp,
    );
    let request = Frame::DescriptionRequest(DescriptionRequest { control_endpoint: discovery_endpoint });
    let encoded = wire::encode(&request);
    socket
        .send_to(&encoded, control_endpoint.socket_addr())
        .await
        .map_err(ConnectionError::Io)?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let len = timeout(cfg.description_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| ConnectionError::Protocol("Description.res timed out".to_string()))?
        .map_err(ConnectionError::Io)?;
    match wire::decode(&buf[..len])? {
        Frame::DescriptionResponse(response) => Ok(response),
        other => Err(ConnectionError::Protocol(format!(
            "expected Description.res, got {:?}",
            other.service_type()
        ))),
    }
}

trait ToV4Checked {
    fn to_v4_checked(self) -> ConnResult<std::net::SocketAddrV4>;
}

impl ToV4Checked for std::net::SocketAddr {
    fn to_v4_checked(self) -> ConnResult<std::net::SocketAddrV4> {
        match self {
            std::net::SocketAddr::V4(v4) => Ok(v4),
            std::net::SocketAddr::V6(_) => {
                Err(ConnectionError::Protocol("expected an IPv4 local address".to_string()))
            },
        }
    }
}

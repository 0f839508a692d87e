// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use knxnetip_core::{
    cfg::config::{DiscoveryConfig, RoutingConfig},
    discovery,
    wire::{self, Frame, RawDibs, SearchResponse},
};
use tokio::net::UdpSocket;

/// A `SearchRequest` sent to the multicast group should be answered by a
/// fake server joined to that group, with the response delivered back
/// unicast to the requester's ephemeral discovery endpoint.
#[tokio::test]
async fn search_collects_a_response_from_the_multicast_group() {
    let group = Ipv4Addr::new(239, 40, 12, 7);

    let server = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.expect("bind fake server");
    let server_port = server.local_addr().expect("local_addr").port();
    server.join_multicast_v4(group, Ipv4Addr::LOCALHOST).expect("join multicast group");

    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        let (len, client_addr) = server.recv_from(&mut buf).await.expect("recv search request");
        let frame = wire::decode(&buf[..len]).expect("decode search request");
        assert_eq!(frame.service_type(), wire::ServiceType::SearchRequest);

        let response = Frame::SearchResponse(SearchResponse {
            control_endpoint: knxnetip_core::wire::Hpai {
                host_protocol: knxnetip_core::wire::HostProtocol::Udp,
                addr: Ipv4Addr::LOCALHOST,
                port: server_port,
            },
            dibs: RawDibs(bytes::Bytes::from_static(&[0x06, 0x01, 0x02, 0x00, 0xff, 0xff])),
        });
        server.send_to(&wire::encode(&response), client_addr).await.expect("send search response");
    });

    let discovery_cfg = DiscoveryConfig {
        search_timeout: std::time::Duration::from_millis(500),
        description_timeout: std::time::Duration::from_secs(1),
        join_multicast_for_responses: knxnetip_core::cfg::enums::YesNo::No,
    };
    let routing_cfg = RoutingConfig { multicast_group: group, multicast_port: server_port, ..Default::default() };

    let results = discovery::search(&discovery_cfg, &routing_cfg, &[Ipv4Addr::LOCALHOST], vec![])
        .await
        .expect("search should succeed");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].control_endpoint.port, server_port);
    assert_eq!(results[0].local_interface, Ipv4Addr::LOCALHOST);
}

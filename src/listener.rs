// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Listener fan-out for connections and routing instances (§4.3, §4.5, §9).
//!
//! Modeled as a tagged enum of events plus a single handler trait, per the
//! "dynamic dispatch" design note: both a tunneling/devmgmt connection and
//! a routing instance deliver through the same [`Listener`] trait, they
//! simply never produce the event variants that don't apply to them.

use std::{net::SocketAddrV4, time::Duration};

use crate::cemi::CemiFrame;

/// Who initiated a connection close (§4.3 `close()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// The local application called `close()`.
    User,
    /// The remote server sent `Disconnect.req`.
    Server,
    /// Internal failure: ack/confirmation timeout, protocol violation, I/O
    /// error.
    Internal,
}

#[derive(Debug, Clone)]
pub struct ConnectionClosedEvent {
    pub initiator: CloseInitiator,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostMessageEvent {
    pub device_state: u8,
    pub lost_message_count: u16,
    pub sender: SocketAddrV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingBusyEvent {
    pub device_state: u8,
    pub wait: Duration,
    pub routing_busy_control_field: u16,
    pub sender: SocketAddrV4,
}

/// One event a connection or routing instance can deliver to its
/// registered listeners, in wire order (§8 "cEMI frames delivered to
/// listeners preserve the order they appeared on the wire").
#[derive(Debug, Clone)]
pub enum Event {
    Frame(CemiFrame),
    Closed(ConnectionClosedEvent),
    LostMessage(LostMessageEvent),
    RoutingBusy(RoutingBusyEvent),
}

/// A registered observer. Default no-op methods let a listener interested
/// in only one event kind ignore the rest; `on_event` is the single
/// required entry point used by the fan-out loop.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where F: Fn(&Event) + Send + Sync
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::cemi::CemiFrame;

    #[test]
    fn closure_listener_receives_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let listener: Box<dyn Listener> = Box::new(move |event: &Event| {
            seen2.lock().expect("lock").push(format!("{event:?}"));
        });

        let frame = CemiFrame::from_bytes(Bytes::from_static(&[0x2B])).expect("valid frame");
        listener.on_event(&Event::Frame(frame));
        listener.on_event(&Event::Closed(ConnectionClosedEvent {
            initiator: CloseInitiator::User,
            reason: "closed by caller".to_string(),
        }));

        assert_eq!(seen.lock().expect("lock").len(), 2);
    }
}

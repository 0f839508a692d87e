// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection base (§4.3 "C4"): channel id, send/recv sequence counters,
//! the visible state machine, and the public `send`/`close` surface
//! shared by tunneling and device-management connections.
//!
//! A background receive loop fans incoming frames out to one `Mutex`-
//! guarded reply slot per exchange kind (connect, heartbeat, send,
//! disconnect), and a `CancellationToken` drives cooperative shutdown.
//! This crate has at most one blocking operation in flight at a time
//! (§4.3 "Blocking modes queue in arrival order"), so a small fixed set of
//! reply slots stands in for a full per-request dispatch table.

pub mod devmgmt;
pub mod tunnel;

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cemi::CemiFrame,
    cfg::config::ConnectionConfig,
    error::{ConnResult, ConnectionError},
    listener::{CloseInitiator, ConnectionClosedEvent, Event, Listener},
    net::{tcp, udp},
    secure::session::Session,
    state_machine::{
        common::StateMachineCtx,
        connect::{Connected, ConnectCtx},
        disconnect,
        heartbeat::{self, HeartbeatParams, HeartbeatReply},
        send::{SendCtx, SendMode, SendReply},
    },
    wire::{
        self, ConnectRequest, ConnectResponse, DataAck, DataRequest, Frame, Hpai, HostProtocol, ServiceType,
        Status,
    },
};

/// How this connection's control endpoint is reached: plain UDP (§4.2), or
/// a TCP byte stream carrying a KNX IP Secure unicast session (§4.7/§8
/// "C3" — secure unicast is required to run over TCP, never UDP). The
/// writer side of the TCP case hands frames to a dedicated task over a
/// channel so [`Connection::transmit`] can stay a synchronous, non-blocking
/// call regardless of which transport backs it.
enum Transport {
    Udp(Arc<tokio::net::UdpSocket>),
    Tcp(mpsc::Sender<Bytes>),
}

impl Transport {
    fn send(&self, bytes: Bytes, dest: std::net::SocketAddrV4) -> ConnResult<()> {
        match self {
            Self::Udp(socket) => {
                socket
                    .try_send_to(&bytes, std::net::SocketAddr::V4(dest))
                    .map_err(ConnectionError::Io)?;
                Ok(())
            },
            Self::Tcp(tx) => tx.try_send(bytes).map_err(|_| {
                ConnectionError::Io(std::io::Error::other("secure TCP writer queue full or closed"))
            }),
        }
    }
}

/// The visible connection state machine from §4.3: `Closed -> Connecting
/// -> Ok -> AckPending -> (Ok|AckError|CemiConPending) -> Ok`, plus
/// `* -> Closed` on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VisibleState {
    Closed = 0,
    Connecting = 1,
    Ok = 2,
    AckPending = 3,
    AckError = 4,
    CemiConPending = 5,
}

impl VisibleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Ok,
            3 => Self::AckPending,
            4 => Self::AckError,
            5 => Self::CemiConPending,
            _ => Self::Closed,
        }
    }
}

/// Connection-kind-specific behaviour plugged into the shared base
/// (§4.4): which cEMI message codes may be sent, the CRI to connect with,
/// and the per-request timeout/attempt budget.
pub trait ConnectionMode: Send + Sync {
    fn cri(&self) -> crate::wire::Cri;
    fn ack_timeout(&self) -> std::time::Duration;
    fn max_attempts(&self) -> u32;
    /// Rejects a cEMI message code that is not legal to *send* in this
    /// mode (§4.4: no sends at all in BusMonitor, only `M_*` in DevMgmt).
    fn validate_outgoing(&self, cemi: &CemiFrame) -> ConnResult<()>;
    /// Wraps a data request in the mode's service type
    /// (`Tunneling.req`/`DeviceConfiguration.req`).
    fn wrap_request(&self, request: DataRequest) -> Frame;
    /// Wraps an ack in the mode's service type
    /// (`Tunneling.ack`/`DeviceConfiguration.ack`).
    fn wrap_ack(&self, ack: DataAck) -> Frame;
}

struct Inner {
    transport: Transport,
    control_endpoint: Hpai,
    cfg: ConnectionConfig,
    mode: Box<dyn ConnectionMode>,
    /// An established KNX IP Secure unicast session (§4.7 "C8"). When set,
    /// every frame this connection sends or receives on its control
    /// endpoint is wrapped/unwrapped through it rather than sent in the
    /// clear (§6 "Secure-session builder").
    secure: Option<Arc<Session>>,
    state: AtomicU8,
    channel_id: Mutex<Option<u8>>,
    send_seq: AtomicU8,
    recv_seq: AtomicU8,
    send_gate: Mutex<()>,
    connect_replies: Mutex<Option<mpsc::Sender<ConnectResponse>>>,
    send_replies: Mutex<Option<mpsc::Sender<SendReply>>>,
    heartbeat_replies: Mutex<Option<mpsc::Sender<HeartbeatReply>>>,
    disconnect_reply: Mutex<Option<oneshot::Sender<Status>>>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    cancel: CancellationToken,
}

/// A Tunnel or DeviceManagement connection to a KNXnet/IP server.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub async fn connect(
        cfg: ConnectionConfig,
        mode: Box<dyn ConnectionMode>,
        control_endpoint: Hpai,
    ) -> ConnResult<Self> {
        Self::establish(cfg, mode, control_endpoint, None).await
    }

    /// Builds a Tunnel connection over an already-authenticated KNX IP
    /// Secure unicast `session` (§6 "Secure-session builder:
    /// `new_tunneling(layer, session, tunnel_addr)`"). `session` must have
    /// already completed the `SessionRequest`/`SessionAuthenticate`/
    /// `SessionStatus` handshake (`secure::session::Handshake` plus the
    /// caller's own exchange of those three frames); this constructor only
    /// runs the normal `Connect.req`/`.res` sequence and ongoing traffic
    /// through it, wrapped.
    pub async fn new_tunneling(
        cfg: ConnectionConfig,
        layer: crate::wire::TunnelLayer,
        session: Session,
        tunnel_addr: Hpai,
    ) -> ConnResult<Self> {
        let mode = Box::new(tunnel::TunnelMode { layer });
        Self::establish(cfg, mode, tunnel_addr, Some(Arc::new(session))).await
    }

    /// Builds a DeviceManagement connection over an already-authenticated
    /// KNX IP Secure unicast `session` (§6 "Secure-session builder:
    /// `new_device_management(session)`"). The control endpoint is the
    /// session's own peer, since device management always talks to the
    /// same server the session was negotiated with.
    pub async fn new_device_management(
        cfg: ConnectionConfig,
        session: Session,
        control_endpoint: Hpai,
    ) -> ConnResult<Self> {
        let mode = Box::new(devmgmt::DeviceManagementMode);
        Self::establish(cfg, mode, control_endpoint, Some(Arc::new(session))).await
    }

    async fn establish(
        cfg: ConnectionConfig,
        mode: Box<dyn ConnectionMode>,
        control_endpoint: Hpai,
        secure: Option<Arc<Session>>,
    ) -> ConnResult<Self> {
        let cancel = CancellationToken::new();

        let (transport, tcp_reader) = if secure.is_some() {
            let (tx, reader) = Self::connect_tcp(control_endpoint, cancel.clone()).await?;
            (Transport::Tcp(tx), Some(reader))
        } else {
            let local = std::net::SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            (Transport::Udp(udp::bind(local).await.map_err(ConnectionError::Io)?), None)
        };

        let inner = Arc::new(Inner {
            transport,
            control_endpoint,
            cfg,
            mode,
            secure,
            state: AtomicU8::new(VisibleState::Connecting as u8),
            channel_id: Mutex::new(None),
            send_seq: AtomicU8::new(0),
            recv_seq: AtomicU8::new(0),
            send_gate: Mutex::new(()),
            connect_replies: Mutex::new(None),
            send_replies: Mutex::new(None),
            heartbeat_replies: Mutex::new(None),
            disconnect_reply: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            cancel,
        });

        let conn = Self { inner: inner.clone() };
        if let Some(reader) = tcp_reader {
            let handler_conn = conn.clone();
            tokio::spawn(tcp::run_receiver(
                reader,
                Arc::new(move |received: tcp::ReceivedStream| {
                    handler_conn.dispatch_decoded(received.header.service_type, &received.body)
                }),
                inner.cancel.clone(),
            ));
        } else if let Transport::Udp(socket) = &inner.transport {
            let handler_conn = conn.clone();
            tokio::spawn(udp::run_receiver(
                socket.clone(),
                Arc::new(move |received: udp::Received| {
                    handler_conn.dispatch_decoded(received.header.service_type, &received.body)
                }),
                inner.cancel.clone(),
            ));
        }

        conn.run_connect_sequence().await?;
        conn.inner.state.store(VisibleState::Ok as u8, Ordering::SeqCst);
        conn.spawn_heartbeat();
        Ok(conn)
    }

    /// Opens the TCP byte stream a secure unicast session runs over (§4.7
    /// "C3"), and spawns the writer task that drains the returned channel
    /// so [`Connection::transmit`] can keep handing off frames
    /// synchronously instead of needing to become `async`.
    async fn connect_tcp(
        control_endpoint: Hpai,
        cancel: CancellationToken,
    ) -> ConnResult<(mpsc::Sender<Bytes>, tokio::io::ReadHalf<TcpStream>)> {
        let stream = TcpStream::connect(control_endpoint.socket_addr())
            .await
            .map_err(ConnectionError::Io)?;
        let (reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    frame = rx.recv() => match frame {
                        Some(bytes) => {
                            if writer.write_all(&bytes).await.is_err() {
                                return;
                            }
                        },
                        None => return,
                    },
                }
            }
        });
        Ok((tx, reader))
    }

    /// The connection's visible state (§4.3, §6 "state()").
    pub fn state(&self) -> VisibleState {
        VisibleState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        // tokio::sync::Mutex requires an async context; listener
        // registration happens from async call sites in practice, but a
        // blocking try_lock keeps the public surface synchronous.
        if let Ok(mut listeners) = self.inner.listeners.try_lock() {
            listeners.push(listener);
        }
    }

    fn fire(&self, event: Event) {
        if let Ok(listeners) = self.inner.listeners.try_lock() {
            for listener in listeners.iter() {
                listener.on_event(&event);
            }
        }
    }

    async fn run_connect_sequence(&self) -> ConnResult<()> {
        // A TCP-carried secure session has no separate data endpoint: the
        // server reaches the client back over the same connection (§4.7).
        let local_data_endpoint = match &self.inner.transport {
            Transport::Udp(socket) => Hpai {
                host_protocol: HostProtocol::Udp,
                addr: Ipv4Addr::UNSPECIFIED,
                port: socket.local_addr().map_err(ConnectionError::Io)?.port(),
            },
            Transport::Tcp(_) => Hpai::ZERO_UDP,
        };
        let (tx, rx) = mpsc::channel(4);
        *self.inner.connect_replies.lock().await = Some(tx);

        let control_endpoint = self.inner.control_endpoint;
        let cri = self.inner.mode.cri();
        let transmit: Box<dyn Fn() -> ConnResult<()> + Send> = {
            let conn = self.clone();
            Box::new(move || {
                conn.transmit(&Frame::ConnectRequest(ConnectRequest {
                    control_endpoint,
                    data_endpoint: local_data_endpoint,
                    cri,
                }))
            })
        };
        let mut ctx =
            ConnectCtx::new(transmit, self.inner.cfg.ack_timeout, self.inner.cfg.max_ack_attempts, rx);
        let Connected { channel_id, crd, .. } = ctx.execute(&self.inner.cancel).await?;
        *self.inner.connect_replies.lock().await = None;
        *self.inner.channel_id.lock().await = Some(channel_id);
        debug!(channel_id, crd = ?crd, "connected");
        Ok(())
    }

    fn spawn_heartbeat(&self) {
        let (tx, rx) = mpsc::channel(4);
        let conn = self.clone();
        tokio::spawn(async move {
            *conn.inner.heartbeat_replies.lock().await = Some(tx);
            let params = HeartbeatParams {
                interval: conn.inner.cfg.heartbeat_interval,
                wait: conn.inner.cfg.heartbeat_wait,
                retries: conn.inner.cfg.heartbeat_retries,
            };
            let send_request = {
                let conn = conn.clone();
                move || conn.send_heartbeat_request()
            };
            let result = heartbeat::run(params, send_request, rx, conn.inner.cancel.clone()).await;
            if result.is_err() {
                conn.close_with(CloseInitiator::Internal, "heartbeat".to_string()).await;
            }
        });
    }

    fn send_heartbeat_request(&self) -> ConnResult<()> {
        let Some(channel_id) = self.inner.channel_id.try_lock().ok().and_then(|g| *g) else {
            return Err(ConnectionError::Protocol("no channel id yet".to_string()));
        };
        let frame = Frame::ConnectionStateRequest(crate::wire::ConnectionStateRequest {
            channel_id,
            control_endpoint: self.inner.control_endpoint,
        });
        self.transmit(&frame)
    }

    /// Encodes and sends `frame` to the control endpoint, wrapping it in a
    /// `SecureWrapper` first when this connection was built over a secure
    /// session (§4.7). Every outgoing frame on this connection, including
    /// the `Connect.req`/heartbeat/disconnect control frames, passes
    /// through here, so secure mode needs no special-casing anywhere else.
    fn transmit(&self, frame: &Frame) -> ConnResult<()> {
        let encoded = wire::encode(frame);
        let wire_bytes = match &self.inner.secure {
            Some(session) => {
                let wrapper = session.wrap(&encoded, 0)?;
                wire::encode(&Frame::SecureWrapper(wrapper))
            },
            None => encoded,
        };
        let dest = self.inner.control_endpoint.socket_addr();
        self.inner.transport.send(wire_bytes, dest)
    }

    /// `send(frame, mode)` (§4.3).
    pub async fn send(&self, cemi: CemiFrame, mode: SendMode) -> ConnResult<()> {
        if self.state() == VisibleState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.inner.mode.validate_outgoing(&cemi)?;

        if mode == SendMode::NonBlocking {
            if self.inner.send_gate.try_lock().is_err() {
                return Err(ConnectionError::IllegalState(
                    "a blocking send is already in flight".to_string(),
                ));
            }
            return self.transmit_data_request(cemi.as_bytes().clone());
        }

        let _gate = self.inner.send_gate.lock().await;
        self.inner.state.store(VisibleState::AckPending as u8, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(8);
        *self.inner.send_replies.lock().await = Some(tx);

        let cemi_bytes = cemi.as_bytes().clone();
        let send_seq = self.inner.send_seq.load(Ordering::SeqCst);
        let transmit = {
            let conn = self.clone();
            let cemi_bytes = cemi_bytes.clone();
            move || conn.transmit_data_request_seq(cemi_bytes.clone(), send_seq)
        };

        let mut ctx = SendCtx::new(
            Box::new(transmit),
            cemi_bytes,
            mode,
            self.inner.mode.ack_timeout(),
            self.inner.cfg.confirmation_timeout,
            self.inner.mode.max_attempts(),
            rx,
        );
        let result = ctx.execute(&self.inner.cancel).await;
        *self.inner.send_replies.lock().await = None;

        match &result {
            Ok(()) => {
                self.inner.send_seq.fetch_add(1, Ordering::SeqCst);
                self.inner.state.store(VisibleState::Ok as u8, Ordering::SeqCst);
            },
            Err(ConnectionError::AckTimeout { .. }) => {
                self.close_with(CloseInitiator::Internal, "ack timeout".to_string()).await;
            },
            Err(_) => {
                self.inner.state.store(VisibleState::AckError as u8, Ordering::SeqCst);
            },
        }
        result
    }

    fn transmit_data_request(&self, cemi: Bytes) -> ConnResult<()> {
        let seq = self.inner.send_seq.load(Ordering::SeqCst);
        self.transmit_data_request_seq(cemi, seq)
    }

    fn transmit_data_request_seq(&self, cemi: Bytes, seq: u8) -> ConnResult<()> {
        let Some(channel_id) = self.inner.channel_id.try_lock().ok().and_then(|g| *g) else {
            return Err(ConnectionError::Protocol("no channel id yet".to_string()));
        };
        let request = DataRequest { channel_id, sequence: seq, cemi };
        let frame = self.inner.mode.wrap_request(request);
        self.transmit(&frame)
    }

    /// `close()` (§4.3).
    pub async fn close(&self) {
        self.close_with(CloseInitiator::User, "closed by caller".to_string()).await;
    }

    async fn close_with(&self, initiator: CloseInitiator, reason: String) {
        if self.state() == VisibleState::Closed {
            return;
        }
        if let Some(channel_id) = *self.inner.channel_id.lock().await {
            let (tx, rx) = oneshot::channel();
            *self.inner.disconnect_reply.lock().await = Some(tx);
            let send_request = {
                let conn = self.clone();
                move || {
                    conn.transmit(&Frame::DisconnectRequest(crate::wire::DisconnectRequest {
                        channel_id,
                        control_endpoint: conn.inner.control_endpoint,
                    }))
                }
            };
            disconnect::run(send_request, rx).await;
        }
        self.inner.state.store(VisibleState::Closed as u8, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.fire(Event::Closed(ConnectionClosedEvent { initiator, reason }));
    }

    /// Decodes a frame body already split from its header by whichever
    /// transport received it (UDP datagram or TCP byte stream) and acts on
    /// it. Malformed bodies are logged and dropped rather than closing the
    /// connection: one bad frame on a shared control endpoint shouldn't
    /// tear down an otherwise-healthy session.
    fn dispatch_decoded(&self, service_type: ServiceType, body: &Bytes) {
        let result: ConnResult<()> = (|| {
            let frame = wire::decode_body(service_type, body)?;
            self.dispatch_frame(frame)
        })();
        if let Err(err) = result {
            debug!(%err, "dropping malformed frame from control endpoint");
        }
    }

    /// Acts on one decoded frame. Split out from [`Self::dispatch_decoded`]
    /// so a `SecureWrapper`'s decrypted payload (itself a full inner frame)
    /// can be redispatched without re-decoding it from raw bytes twice.
    fn dispatch_frame(&self, frame: Frame) -> ConnResult<()> {
        match frame {
            Frame::ConnectResponse(response) => {
                if let Ok(guard) = self.inner.connect_replies.try_lock() {
                    if let Some(tx) = guard.as_ref() {
                        let _ = tx.try_send(response);
                    }
                }
            },
            Frame::ConnectionStateResponse(response) => {
                if let Ok(guard) = self.inner.heartbeat_replies.try_lock() {
                    if let Some(tx) = guard.as_ref() {
                        let reply =
                            if response.status.is_ok() { HeartbeatReply::Ok } else { HeartbeatReply::Error };
                        let _ = tx.try_send(reply);
                    }
                }
            },
            Frame::DisconnectResponse(response) => {
                if let Ok(mut guard) = self.inner.disconnect_reply.try_lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(response.status);
                    }
                }
            },
            Frame::DisconnectRequest(_) => {
                let conn = self.clone();
                tokio::spawn(async move {
                    conn.close_with(CloseInitiator::Server, "server requested disconnect".to_string())
                        .await;
                });
            },
            Frame::TunnelingAck(ack) | Frame::DeviceConfigurationAck(ack) => self.handle_ack(ack.status),
            Frame::TunnelingRequest(request) | Frame::DeviceConfigurationRequest(request) => {
                self.handle_incoming_data(request)
            },
            Frame::SecureWrapper(wrapper) => {
                let Some(session) = self.inner.secure.as_ref() else {
                    warn!("received SecureWrapper on a non-secure connection, dropping");
                    return Ok(());
                };
                let decrypted = session.unwrap(&wrapper, 0)?;
                let inner = wire::decode(&decrypted)?;
                return self.dispatch_frame(inner);
            },
            other => warn!(service_type = ?other.service_type(), "connection received unexpected frame"),
        }
        Ok(())
    }

    fn handle_ack(&self, status: Status) {
        if let Ok(guard) = self.inner.send_replies.try_lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(SendReply::Ack(status));
            }
        }
    }

    fn handle_incoming_data(&self, request: DataRequest) {
        let Some(channel_id) = self.inner.channel_id.try_lock().ok().and_then(|g| *g) else {
            return;
        };
        if request.channel_id != channel_id {
            return;
        }
        let expected = self.inner.recv_seq.load(Ordering::SeqCst);
        if request.sequence == expected.wrapping_sub(1) {
            // Duplicate: re-acknowledge and drop silently (§4.4).
            self.ack_data_request(request.channel_id, request.sequence);
            return;
        }
        self.inner.recv_seq.store(request.sequence.wrapping_add(1), Ordering::SeqCst);
        self.ack_data_request(request.channel_id, request.sequence);

        let Ok(cemi) = CemiFrame::from_bytes(request.cemi) else { return };
        if cemi.message_code() == crate::cemi::MessageCode::LDataCon {
            if let Ok(guard) = self.inner.send_replies.try_lock() {
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.try_send(SendReply::Confirmation(cemi.clone()));
                }
            }
        }
        self.fire(Event::Frame(cemi));
    }

    fn ack_data_request(&self, channel_id: u8, sequence: u8) {
        let ack = DataAck { channel_id, sequence, status: Status::NoError };
        let _ = self.transmit(&self.inner.mode.wrap_ack(ack));
    }
}

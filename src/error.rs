// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Crate-wide error kinds (see spec §7 "Error handling design").
//!
//! Leaf wire/codec errors are small `thiserror` types; connection- and
//! session-level operations surface one of the kinds below. Internal
//! plumbing (background task bodies, helper glue) is free to use
//! `anyhow::Result` and convert into [`ConnectionError`] at the public
//! boundary, mirroring how the rest of this codebase separates "leaf"
//! errors from "glue" errors.

use thiserror::Error;

/// Failure of a single wire-level decode (§4.1).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MalformedFrame {
    #[error("struct length {0} != 6")]
    BadStructLength(u8),
    #[error("protocol version 0x{0:02x} != 0x10")]
    BadProtocolVersion(u8),
    #[error("declared total length {declared} exceeds buffer length {available}")]
    TotalLengthExceedsBuffer { declared: u16, available: usize },
    #[error("buffer too short: need at least {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },
    #[error("fixed-size sub-structure '{what}' has unexpected length {got} (want {want})")]
    BadSubStructureLength {
        what: &'static str,
        want: usize,
        got: usize,
    },
    #[error("reserved field '{what}' has disallowed value 0x{value:02x}")]
    BadReservedField { what: &'static str, value: u8 },
    #[error("unknown service type 0x{0:04x}")]
    UnknownService(u16),
    #[error("unknown host protocol code 0x{0:02x}")]
    UnknownHostProtocol(u8),
}

/// Operation-level error kinds surfaced by connections and secure sessions.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Wire parse failure (§4.1). Receiver-level occurrences are logged and
    /// dropped; this variant is for failures the caller directly asked for
    /// (e.g. decoding a response they are blocked on).
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] MalformedFrame),

    /// Protocol-level violation: header version mismatch or wrong channel
    /// id. A version mismatch forces connection close (§7).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Retransmission attempts exhausted waiting for an ack (§4.3).
    #[error("ack timeout after {attempts} attempt(s)")]
    AckTimeout { attempts: u32 },

    /// A confirmation (.con) frame matching the sent request never arrived
    /// within the confirmation window (§4.3).
    #[error("confirmation timeout")]
    ConfirmationTimeout,

    /// The remote peer returned a non-zero status code.
    #[error("remote error: status=0x{status:02x} ({text})")]
    Remote { status: u8, text: String },

    /// Operation attempted on a connection that is already `Closed`.
    #[error("connection closed")]
    Closed,

    /// A blocking `send` was issued in `NonBlocking` mode while another
    /// blocking send was already in flight, or a cEMI message code is not
    /// legal for the connection's current mode (e.g. sending in BusMonitor
    /// mode).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// KNX IP Secure handshake/session failure (§4.7 rejection policies).
    #[error("secure: {0}")]
    Secure(String),

    /// A blocking wait was interrupted externally.
    #[error("cancelled")]
    Cancelled,

    /// Underlying socket I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConnResult<T> = Result<T, ConnectionError>;

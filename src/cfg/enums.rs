// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean enumeration with string serialization support.
///
/// Accepts "Yes"/"No", "true"/"false", and "1"/"0" on the way in; always
/// renders as "Yes"/"No".
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[default]
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Which of the three client-initiated connection kinds (§4.1/§4.3) to
/// establish. Routing is connectionless and does not go through
/// Connect.req/Connect.res, but is listed here since it shares the same
/// top-level "what am I doing on this bus" configuration slot.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    #[serde(rename = "Tunnel")]
    Tunnel,
    #[serde(rename = "DeviceManagement")]
    DeviceManagement,
    #[serde(rename = "Routing")]
    Routing,
}
impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionKind::Tunnel => "Tunnel",
            ConnectionKind::DeviceManagement => "DeviceManagement",
            ConnectionKind::Routing => "Routing",
        })
    }
}

/// KNX IP Secure mode to apply on top of the chosen connection kind (§4.7,
/// §4.9). `None` leaves the connection/routing channel in plaintext.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureMode {
    #[serde(rename = "None", alias = "none")]
    None,
    /// Unicast session (SecureSessionRequest/.../SecureWrapper), valid for
    /// Tunnel and DeviceManagement connections.
    #[serde(rename = "Unicast", alias = "unicast")]
    Unicast,
    /// Multicast group key + group timer sync, valid for Routing.
    #[serde(rename = "Routing", alias = "routing")]
    Routing,
}

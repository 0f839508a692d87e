// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! KNX IP Secure (§4.7, §4.8): password-derived keys, the unicast session
//! handshake and `SecureWrapper` codec, and the multicast group-timer sync
//! algorithm.

pub mod keyring;
pub mod routing;
pub mod session;

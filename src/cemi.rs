// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! cEMI (Common External Message Interface) frame access (§3, §4.4).
//!
//! cEMI payload is opaque to this crate: the application/transport layer
//! (APDU/TPDU contents) is never decoded. What connections and routing
//! need is the message code (to classify request/confirmation/indication
//! and allow/forbid it for the current mode), the additional-info block
//! length (to find where the fixed L_Data fields start), and, for
//! `L_Data`/`L_Raw` variants, the source/destination addresses and hop
//! count used for confirmation matching (§4.3) and loopback suppression.

use bytes::Bytes;

use crate::{
    address::{Address, GroupAddress, IndividualAddress},
    error::MalformedFrame,
};

/// cEMI message codes this crate distinguishes (§4.4). Device-management
/// variants are recognized only enough to route them; their body past the
/// message code is entirely opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    LDataReq,
    LDataCon,
    LDataInd,
    BusMonInd,
    /// Any `M_*` device-management service (`PropRead`/`PropWrite`/
    /// `FuncPropCommand`/`Reset`/...); this crate forwards the body
    /// without further interpretation.
    DeviceManagement(u8),
    Other(u8),
}

const MC_L_DATA_REQ: u8 = 0x11;
const MC_L_DATA_CON: u8 = 0x2E;
const MC_L_DATA_IND: u8 = 0x29;
const MC_BUSMON_IND: u8 = 0x2B;

/// Control field 1 bit 0: the confirm/error flag, set by the bus interface
/// on an `L_Data.con` (0 = sent successfully, 1 = error). It legitimately
/// differs between a `.req` and its `.con`, so confirmation matching masks
/// it out rather than requiring byte-exact equality (§4.3).
const CONTROL1_CONFIRM_BIT: u8 = 0x01;

impl MessageCode {
    fn from_u8(v: u8) -> Self {
        match v {
            MC_L_DATA_REQ => Self::LDataReq,
            MC_L_DATA_CON => Self::LDataCon,
            MC_L_DATA_IND => Self::LDataInd,
            MC_BUSMON_IND => Self::BusMonInd,
            0xF1..=0xFF => Self::DeviceManagement(v),
            other => Self::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::LDataReq => MC_L_DATA_REQ,
            Self::LDataCon => MC_L_DATA_CON,
            Self::LDataInd => MC_L_DATA_IND,
            Self::BusMonInd => MC_BUSMON_IND,
            Self::DeviceManagement(v) | Self::Other(v) => v,
        }
    }

    pub fn is_l_data(self) -> bool {
        matches!(self, Self::LDataReq | Self::LDataCon | Self::LDataInd)
    }
}

/// An opaque cEMI frame with accessors over its fixed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiFrame {
    raw: Bytes,
}

impl CemiFrame {
    pub fn from_bytes(raw: Bytes) -> Result<Self, MalformedFrame> {
        if raw.is_empty() {
            return Err(MalformedFrame::BufferTooShort { need: 1, got: 0 });
        }
        Ok(Self { raw })
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn message_code(&self) -> MessageCode {
        MessageCode::from_u8(self.raw[0])
    }

    fn additional_info_len(&self) -> usize {
        self.raw.get(1).copied().unwrap_or(0) as usize
    }

    pub fn additional_info(&self) -> &[u8] {
        let len = self.additional_info_len();
        &self.raw[2..2 + len.min(self.raw.len().saturating_sub(2))]
    }

    /// Offset of the L_Data control field(s), right after the
    /// additional-info block. Only meaningful when [`Self::message_code`]
    /// is an `L_Data`/`BusMon` variant.
    fn l_data_fields_offset(&self) -> usize {
        2 + self.additional_info_len()
    }

    fn control2(&self) -> Option<u8> {
        if !self.message_code().is_l_data() {
            return None;
        }
        self.raw.get(self.l_data_fields_offset() + 1).copied()
    }

    /// Hop count carried in control field 2, bits 4-6 (§4.4, default 6).
    pub fn hop_count(&self) -> Option<u8> {
        self.control2().map(|c2| (c2 >> 4) & 0x07)
    }

    /// True when the destination in control field 2 (bit 7) is a group
    /// address rather than an individual address.
    fn destination_is_group(&self) -> Option<bool> {
        self.control2().map(|c2| (c2 & 0x80) != 0)
    }

    pub fn source(&self) -> Option<IndividualAddress> {
        if !self.message_code().is_l_data() {
            return None;
        }
        let off = self.l_data_fields_offset() + 2;
        let hi = *self.raw.get(off)?;
        let lo = *self.raw.get(off + 1)?;
        Some(IndividualAddress::from_raw(u16::from_be_bytes([hi, lo])))
    }

    /// The transport/application PDU carried by an `L_Data` frame, i.e.
    /// everything from the APCI/TPCI control bytes onward (after the
    /// data-length byte). `None` for non-`L_Data` variants.
    pub fn tpdu(&self) -> Option<&[u8]> {
        if !self.message_code().is_l_data() {
            return None;
        }
        let data_len_off = self.l_data_fields_offset() + 6;
        self.raw.get(data_len_off..)
    }

    pub fn destination(&self) -> Option<Address> {
        if !self.message_code().is_l_data() {
            return None;
        }
        let off = self.l_data_fields_offset() + 4;
        let hi = *self.raw.get(off)?;
        let lo = *self.raw.get(off + 1)?;
        let raw = u16::from_be_bytes([hi, lo]);
        Some(if self.destination_is_group()? {
            Address::Group(GroupAddress::from(raw))
        } else {
            Address::Individual(IndividualAddress::from_raw(raw))
        })
    }

    /// Implements the confirmation-matching rule from §4.3: equal after
    /// normalizing message code (both treated as `L_Data`) and control
    /// field 1, zeroing source bytes on both sides when the sent request's
    /// source was `0.0.0` (the common "let the server fill it in" case),
    /// and tolerating a received hop count exactly one less than sent
    /// (logged by the caller, not here).
    pub fn matches_confirmation(&self, sent: &CemiFrame) -> bool {
        if self.raw.len() != sent.raw.len() {
            return false;
        }
        if self.additional_info() != sent.additional_info() {
            return false;
        }
        let sent_off = sent.l_data_fields_offset();
        let recv_off = self.l_data_fields_offset();
        if sent_off != recv_off {
            return false;
        }
        // control field 1 must match once the confirm/error bit, which
        // legitimately differs between a .req and its .con, is masked out.
        let control1_matches = match (self.raw.get(recv_off), sent.raw.get(sent_off)) {
            (Some(&recv), Some(&sent_c1)) => {
                (recv & !CONTROL1_CONFIRM_BIT) == (sent_c1 & !CONTROL1_CONFIRM_BIT)
            },
            _ => false,
        };
        if !control1_matches {
            return false;
        }
        let source_was_zero = sent.source() == Some(IndividualAddress::ZERO);
        let source_matches = source_was_zero || self.source() == sent.source();
        if !source_matches {
            return false;
        }
        if self.destination() != sent.destination() {
            return false;
        }
        let hop_matches = match (self.hop_count(), sent.hop_count()) {
            (Some(recv), Some(sent_hop)) => recv == sent_hop || recv + 1 == sent_hop,
            _ => false,
        };
        if !hop_matches {
            return false;
        }
        // TPDU payload (everything past the data-length byte) must match
        // byte-for-byte.
        let data_len_off = recv_off + 6;
        self.raw.get(data_len_off..) == sent.raw.get(data_len_off..)
    }
}

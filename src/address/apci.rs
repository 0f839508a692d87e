// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TPCI/APCI field extraction (§4.1, C10).
//!
//! The first two bytes of a TPDU (the payload that follows a cEMI frame's
//! address fields) encode the transport-layer control byte (TPCI) and the
//! application-layer service selector (APCI). This module only extracts and
//! classifies those control bits; it does not decode the ASDU that follows.

/// Transport-layer control information (first TPDU byte, high nibble plus
/// sequence/ack bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tpci {
    /// True for connection-oriented (numbered) transport, false for
    /// connectionless datagram transport.
    pub connection_oriented: bool,
    /// 4-bit send/receive sequence number, meaningful only when
    /// `connection_oriented` is true.
    pub sequence: u8,
    /// Control PDU subtype when `connection_oriented` and bit 1 of byte0 is
    /// set (Connect/Disconnect/Ack/Nak); `None` for ordinary numbered or
    /// unnumbered data.
    pub control: Option<TpciControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpciControl {
    Connect,
    Disconnect,
    Ack,
    Nak,
}

impl Tpci {
    /// Extracts TPCI from the first TPDU byte.
    pub fn from_byte0(byte0: u8) -> Self {
        let connection_oriented = (byte0 & 0x80) != 0;
        if !connection_oriented {
            return Self {
                connection_oriented: false,
                sequence: 0,
                control: None,
            };
        }
        let is_control = (byte0 & 0x40) != 0;
        let sequence = (byte0 >> 2) & 0x0F;
        let control = if is_control {
            match byte0 & 0x03 {
                0b00 => Some(TpciControl::Connect),
                0b01 => Some(TpciControl::Disconnect),
                0b10 => Some(TpciControl::Ack),
                _ => Some(TpciControl::Nak),
            }
        } else {
            None
        };
        Self {
            connection_oriented,
            sequence,
            control,
        }
    }
}

/// 10-bit application-layer service selector.
///
/// The raw value is `((byte0 & 0x03) << 8) | byte1`. A subset of codes
/// (the "short" group, e.g. `GroupValueWrite`) only use the upper 4 bits of
/// that 10-bit value to select the service; the lower 6 bits carry inline
/// data (masked with `0x3F`) instead of being part of the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    GroupValueRead,
    GroupValueResponse,
    GroupValueWrite,
    IndividualAddressWrite,
    IndividualAddressRead,
    IndividualAddressResponse,
    DomainAddressWrite,
    NetworkParameterRead,
    NetworkParameterResponse,
    NetworkParameterWrite,
    PropertyValueRead,
    PropertyValueWrite,
    PropertyValueResponse,
    PropertyExtWriteBroadcast,
    DeviceDescriptorRead,
    DeviceDescriptorResponse,
    Restart,
    Other(u16),
}

/// Mask selecting the 4-bit short-service code (bits 6-9 of the 10-bit
/// APCI value); the remaining low 6 bits are inline data for that group.
const SHORT_SELECTOR_MASK: u16 = 0b11_1100_0000;
const SHORT_DATA_MASK: u16 = 0b00_0011_1111;

impl Apci {
    /// Builds the 10-bit raw APCI value from the first two TPDU bytes.
    pub fn raw10(byte0: u8, byte1: u8) -> u16 {
        (((byte0 & 0x03) as u16) << 8) | byte1 as u16
    }

    /// Classifies a raw 10-bit APCI value, returning the service and, for
    /// short-form services, the inline 6-bit data.
    pub fn decode(raw10: u16) -> (Self, Option<u8>) {
        let short = raw10 & SHORT_SELECTOR_MASK;
        let short_data = (raw10 & SHORT_DATA_MASK) as u8;
        match short {
            0b00_0000_0000 if raw10 & !SHORT_DATA_MASK == 0b00_0000_0000 => {
                (Self::GroupValueRead, Some(short_data))
            },
            0b01_0000_0000 if raw10 & !SHORT_DATA_MASK == 0b01_0000_0000 => {
                (Self::GroupValueResponse, Some(short_data))
            },
            0b10_0000_0000 if raw10 & !SHORT_DATA_MASK == 0b10_0000_0000 => {
                (Self::GroupValueWrite, Some(short_data))
            },
            0b11_0000_0000 if raw10 & !SHORT_DATA_MASK == 0b11_0000_0000 => {
                (Self::IndividualAddressWrite, Some(short_data))
            },
            _ => (Self::decode_long(raw10), None),
        }
    }

    fn decode_long(raw10: u16) -> Self {
        match raw10 {
            0x100 => Self::IndividualAddressRead,
            0x140 => Self::IndividualAddressResponse,
            0x1E0 => Self::DomainAddressWrite,
            0x1C8 => Self::NetworkParameterRead,
            0x1C9 => Self::NetworkParameterResponse,
            0x1CA => Self::NetworkParameterWrite,
            0x300 => Self::DeviceDescriptorRead,
            0x340 => Self::DeviceDescriptorResponse,
            0x380 => Self::Restart,
            0x3D5 => Self::PropertyValueRead,
            0x3D6 => Self::PropertyValueResponse,
            0x3D7 => Self::PropertyValueWrite,
            0x3DB => Self::PropertyExtWriteBroadcast,
            other => Self::Other(other),
        }
    }

    /// True for the set of APCI services that §4.5 routes over the
    /// system-broadcast multicast group instead of the main routing channel
    /// (domain write, network-parameter read/write/response, property
    /// extended-write broadcast), always unencrypted.
    pub fn is_system_broadcast(self) -> bool {
        matches!(
            self,
            Self::DomainAddressWrite
                | Self::NetworkParameterRead
                | Self::NetworkParameterWrite
                | Self::NetworkParameterResponse
                | Self::PropertyExtWriteBroadcast
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_value_write_with_boolean_data() {
        // byte0 low 2 bits = 00, byte1 = 0x81 -> raw10 = 0x081, short group
        // selector = 0x080 (GroupValueWrite), data = 1.
        let raw10 = Apci::raw10(0x00, 0x81);
        assert_eq!(raw10, 0x081);
        let (apci, data) = Apci::decode(raw10);
        assert_eq!(apci, Apci::GroupValueWrite);
        assert_eq!(data, Some(1));
    }

    #[test]
    fn group_value_write_plain_0x80() {
        let raw10 = Apci::raw10(0x00, 0x80);
        let (apci, data) = Apci::decode(raw10);
        assert_eq!(apci, Apci::GroupValueWrite);
        assert_eq!(data, Some(0));
    }

    #[test]
    fn property_write_is_long_form_no_inline_data() {
        let (apci, data) = Apci::decode(0x3D7);
        assert_eq!(apci, Apci::PropertyValueWrite);
        assert_eq!(data, None);
    }

    #[test]
    fn system_broadcast_classification() {
        assert!(Apci::NetworkParameterWrite.is_system_broadcast());
        assert!(!Apci::GroupValueWrite.is_system_broadcast());
    }

    #[test]
    fn tpci_numbered_data_with_sequence() {
        // connection-oriented, data (not control), sequence = 3.
        let byte0 = 0b1000_1100;
        let tpci = Tpci::from_byte0(byte0);
        assert!(tpci.connection_oriented);
        assert_eq!(tpci.sequence, 3);
        assert_eq!(tpci.control, None);
    }

    #[test]
    fn tpci_control_disconnect() {
        let byte0 = 0b1100_0001;
        let tpci = Tpci::from_byte0(byte0);
        assert_eq!(tpci.control, Some(TpciControl::Disconnect));
    }
}

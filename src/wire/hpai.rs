// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{Ipv4Addr, SocketAddrV4};

use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::error::MalformedFrame;

pub const HPAI_LEN: usize = 8;
const STRUCT_LENGTH: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostProtocol {
    Udp,
    Tcp,
}

impl HostProtocol {
    fn from_u8(v: u8) -> Result<Self, MalformedFrame> {
        match v {
            0x01 => Ok(Self::Udp),
            0x02 => Ok(Self::Tcp),
            other => Err(MalformedFrame::UnknownHostProtocol(other)),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Udp => 0x01,
            Self::Tcp => 0x02,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHpai {
    structure_length: u8,
    host_protocol: u8,
    addr: [u8; 4],
    port: U16<BigEndian>,
}

/// Host Protocol Address Info (§3): endpoint descriptor. Zeroed for NAT or
/// for a TCP-carried secure session (the control channel has no separate
/// data HPAI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    pub host_protocol: HostProtocol,
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Hpai {
    pub const ZERO_UDP: Self = Self {
        host_protocol: HostProtocol::Udp,
        addr: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub fn from_socket_addr(sock: SocketAddrV4, protocol: HostProtocol) -> Self {
        Self {
            host_protocol: protocol,
            addr: *sock.ip(),
            port: sock.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }

    pub fn encode(&self) -> [u8; HPAI_LEN] {
        let raw = RawHpai {
            structure_length: STRUCT_LENGTH,
            host_protocol: self.host_protocol.to_u8(),
            addr: self.addr.octets(),
            port: self.port.into(),
        };
        let mut out = [0u8; HPAI_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MalformedFrame> {
        if buf.len() < HPAI_LEN {
            return Err(MalformedFrame::BufferTooShort {
                need: HPAI_LEN,
                got: buf.len(),
            });
        }
        let raw = RawHpai::ref_from_bytes(&buf[..HPAI_LEN]).map_err(|_| {
            MalformedFrame::BufferTooShort {
                need: HPAI_LEN,
                got: buf.len(),
            }
        })?;
        if raw.structure_length != STRUCT_LENGTH {
            return Err(MalformedFrame::BadSubStructureLength {
                what: "HPAI",
                want: STRUCT_LENGTH as usize,
                got: raw.structure_length as usize,
            });
        }
        let host_protocol = HostProtocol::from_u8(raw.host_protocol)?;
        Ok(Self {
            host_protocol,
            addr: Ipv4Addr::from(raw.addr),
            port: raw.port.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_udp() {
        let hpai = Hpai {
            host_protocol: HostProtocol::Udp,
            addr: Ipv4Addr::new(192, 168, 1, 10),
            port: 3671,
        };
        let bytes = hpai.encode();
        assert_eq!(Hpai::decode(&bytes).expect("decode"), hpai);
    }

    #[test]
    fn zero_hpai_for_nat() {
        let bytes = Hpai::ZERO_UDP.encode();
        assert_eq!(bytes, [0x08, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}

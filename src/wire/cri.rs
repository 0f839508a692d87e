// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{address::IndividualAddress, error::MalformedFrame};

pub const CONNECTION_TYPE_DEVMGMT: u8 = 0x03;
pub const CONNECTION_TYPE_TUNNEL: u8 = 0x04;

/// Tunnelling layer code carried in the tunnel CRI (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelLayer {
    Link,
    BusMonitor,
    /// Not accepted by clients per §4.1 ("raw not accepted by clients");
    /// still decoded for completeness since a server could echo it back.
    Raw,
}

impl TunnelLayer {
    fn from_u8(v: u8) -> Result<Self, MalformedFrame> {
        match v {
            0x02 => Ok(Self::Link),
            0x80 => Ok(Self::BusMonitor),
            0x04 => Ok(Self::Raw),
            other => Err(MalformedFrame::BadReservedField {
                what: "CRI tunnel layer",
                value: other,
            }),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Link => 0x02,
            Self::BusMonitor => 0x80,
            Self::Raw => 0x04,
        }
    }
}

/// Connection Request Information: connection-type-specific fields sent in
/// `Connect.req`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cri {
    Tunnel { layer: TunnelLayer },
    DeviceManagement,
}

impl Cri {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Tunnel { layer } => vec![4, CONNECTION_TYPE_TUNNEL, layer.to_u8(), 0],
            Self::DeviceManagement => vec![2, CONNECTION_TYPE_DEVMGMT],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), MalformedFrame> {
        if buf.len() < 2 {
            return Err(MalformedFrame::BufferTooShort { need: 2, got: buf.len() });
        }
        let structure_length = buf[0] as usize;
        if buf.len() < structure_length {
            return Err(MalformedFrame::BufferTooShort {
                need: structure_length,
                got: buf.len(),
            });
        }
        let connection_type = buf[1];
        match connection_type {
            CONNECTION_TYPE_TUNNEL => {
                if structure_length != 4 {
                    return Err(MalformedFrame::BadSubStructureLength {
                        what: "CRI tunnel",
                        want: 4,
                        got: structure_length,
                    });
                }
                let layer = TunnelLayer::from_u8(buf[2])?;
                Ok((Self::Tunnel { layer }, structure_length))
            },
            CONNECTION_TYPE_DEVMGMT => {
                if structure_length != 2 {
                    return Err(MalformedFrame::BadSubStructureLength {
                        what: "CRI devmgmt",
                        want: 2,
                        got: structure_length,
                    });
                }
                Ok((Self::DeviceManagement, structure_length))
            },
            other => Err(MalformedFrame::BadReservedField {
                what: "CRI connection type",
                value: other,
            }),
        }
    }
}

/// Connection Response Data: connection-type-specific fields returned in
/// `Connect.res`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crd {
    Tunnel {
        individual_address: IndividualAddress,
    },
    DeviceManagement,
}

impl Crd {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Tunnel { individual_address } => {
                let raw = individual_address.raw().to_be_bytes();
                vec![4, CONNECTION_TYPE_TUNNEL, raw[0], raw[1]]
            },
            Self::DeviceManagement => vec![2, CONNECTION_TYPE_DEVMGMT],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), MalformedFrame> {
        if buf.len() < 2 {
            return Err(MalformedFrame::BufferTooShort { need: 2, got: buf.len() });
        }
        let structure_length = buf[0] as usize;
        if buf.len() < structure_length {
            return Err(MalformedFrame::BufferTooShort {
                need: structure_length,
                got: buf.len(),
            });
        }
        let connection_type = buf[1];
        match connection_type {
            CONNECTION_TYPE_TUNNEL => {
                if structure_length != 4 {
                    return Err(MalformedFrame::BadSubStructureLength {
                        what: "CRD tunnel",
                        want: 4,
                        got: structure_length,
                    });
                }
                let raw = u16::from_be_bytes([buf[2], buf[3]]);
                Ok((
                    Self::Tunnel {
                        individual_address: IndividualAddress::from_raw(raw),
                    },
                    structure_length,
                ))
            },
            CONNECTION_TYPE_DEVMGMT => {
                if structure_length != 2 {
                    return Err(MalformedFrame::BadSubStructureLength {
                        what: "CRD devmgmt",
                        want: 2,
                        got: structure_length,
                    });
                }
                Ok((Self::DeviceManagement, structure_length))
            },
            other => Err(MalformedFrame::BadReservedField {
                what: "CRD connection type",
                value: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cri_tunnel_round_trips() {
        let cri = Cri::Tunnel { layer: TunnelLayer::Link };
        let bytes = cri.encode();
        let (decoded, len) = Cri::decode(&bytes).expect("decode");
        assert_eq!(decoded, cri);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn crd_tunnel_round_trips() {
        let crd = Crd::Tunnel {
            individual_address: IndividualAddress::new(1, 1, 5).expect("addr"),
        };
        let bytes = crd.encode();
        let (decoded, _) = Crd::decode(&bytes).expect("decode");
        assert_eq!(decoded, crd);
    }
}

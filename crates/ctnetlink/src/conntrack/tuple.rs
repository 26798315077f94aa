//! Conntrack tuples: the (addresses, protocol) pair identifying one
//! direction of a tracked connection.

use std::net::IpAddr;

use crate::netlink::attr::{Attribute, get};
use crate::netlink::error::{Error, Result};

// Tuple attributes
pub const CTA_TUPLE_IP: u16 = 1;
pub const CTA_TUPLE_PROTO: u16 = 2;
pub const CTA_TUPLE_ZONE: u16 = 3;

// IP sub-attributes
pub const CTA_IP_V4_SRC: u16 = 1;
pub const CTA_IP_V4_DST: u16 = 2;
pub const CTA_IP_V6_SRC: u16 = 3;
pub const CTA_IP_V6_DST: u16 = 4;

// Proto sub-attributes
pub const CTA_PROTO_NUM: u16 = 1;
pub const CTA_PROTO_SRC_PORT: u16 = 2;
pub const CTA_PROTO_DST_PORT: u16 = 3;
pub const CTA_PROTO_ICMP_ID: u16 = 4;
pub const CTA_PROTO_ICMP_TYPE: u16 = 5;
pub const CTA_PROTO_ICMP_CODE: u16 = 6;
pub const CTA_PROTO_ICMPV6_ID: u16 = 7;
pub const CTA_PROTO_ICMPV6_TYPE: u16 = 8;
pub const CTA_PROTO_ICMPV6_CODE: u16 = 9;

const IPPROTO_ICMP: u8 = libc::IPPROTO_ICMP as u8;
const IPPROTO_ICMPV6: u8 = libc::IPPROTO_ICMPV6 as u8;

/// One direction of a tracked connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tuple {
    /// Source and destination addresses.
    pub ip: IpTuple,
    /// Protocol number plus ports or ICMP identifiers.
    pub proto: ProtoTuple,
    /// Conntrack zone.
    pub zone: u16,
}

impl Tuple {
    /// A tuple takes part in an operation only when both its IP and
    /// protocol sub-parts are present.
    pub fn filled(&self) -> bool {
        self.ip.filled() && self.proto.protocol != 0
    }

    /// Whether the tuple addresses are IPv6.
    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip.src, Some(IpAddr::V6(_)))
    }

    /// Encode into a nested attribute of the given type.
    pub fn marshal(&self, attr_type: u16) -> Result<Attribute> {
        let mut children = vec![self.ip.marshal()?, self.proto.marshal()];
        if self.zone != 0 {
            children.push(Attribute::from_u16(CTA_TUPLE_ZONE, self.zone));
        }
        Ok(Attribute::nest(attr_type, children))
    }

    /// Decode from a nested tuple attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<Tuple> {
        if !attr.nested {
            return Err(Error::InvalidAttribute("tuple attribute is not nested".into()));
        }

        let mut tuple = Tuple::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_TUPLE_IP => tuple.ip = IpTuple::unmarshal(child)?,
                CTA_TUPLE_PROTO => tuple.proto = ProtoTuple::unmarshal(child)?,
                CTA_TUPLE_ZONE => tuple.zone = get::u16_be(&child.data)?,
                _ => {}
            }
        }
        Ok(tuple)
    }
}

/// Source and destination addresses of a tuple.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpTuple {
    /// Source address.
    pub src: Option<IpAddr>,
    /// Destination address.
    pub dst: Option<IpAddr>,
}

impl IpTuple {
    /// Both addresses are present.
    pub fn filled(&self) -> bool {
        self.src.is_some() && self.dst.is_some()
    }

    /// Encode into a nested CTA_TUPLE_IP attribute.
    ///
    /// Mixed address families are a hard error, never coerced.
    pub fn marshal(&self) -> Result<Attribute> {
        let (Some(src), Some(dst)) = (self.src, self.dst) else {
            return Err(Error::BadIpTuple);
        };

        let children = match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => vec![
                Attribute::new(CTA_IP_V4_SRC, s.octets().to_vec()),
                Attribute::new(CTA_IP_V4_DST, d.octets().to_vec()),
            ],
            (IpAddr::V6(s), IpAddr::V6(d)) => vec![
                Attribute::new(CTA_IP_V6_SRC, s.octets().to_vec()),
                Attribute::new(CTA_IP_V6_DST, d.octets().to_vec()),
            ],
            _ => return Err(Error::BadIpTuple),
        };
        Ok(Attribute::nest(CTA_TUPLE_IP, children))
    }

    /// Decode from a nested CTA_TUPLE_IP attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<IpTuple> {
        let mut ip = IpTuple::default();
        for child in &attr.children {
            let addr = decode_addr(&child.data)?;
            match child.attr_type {
                CTA_IP_V4_SRC | CTA_IP_V6_SRC => ip.src = Some(addr),
                CTA_IP_V4_DST | CTA_IP_V6_DST => ip.dst = Some(addr),
                _ => {}
            }
        }
        Ok(ip)
    }
}

fn decode_addr(data: &[u8]) -> Result<IpAddr> {
    match data.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(data);
            Ok(IpAddr::from(b))
        }
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(data);
            Ok(IpAddr::from(b))
        }
        n => Err(Error::InvalidAttribute(format!(
            "address attribute of {} bytes",
            n
        ))),
    }
}

/// Protocol number plus its per-protocol identifiers.
///
/// ICMP and ICMPv6 route to the ICMP id/type/code fields instead of the
/// ports, keyed by the protocol number rather than a separate attribute.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtoTuple {
    /// IP protocol number.
    pub protocol: u8,
    /// Source port (TCP/UDP/SCTP/DCCP).
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// ICMP echo identifier.
    pub icmp_id: u16,
    /// ICMP type.
    pub icmp_type: u8,
    /// ICMP code.
    pub icmp_code: u8,
}

impl ProtoTuple {
    /// Encode into a nested CTA_TUPLE_PROTO attribute.
    pub fn marshal(&self) -> Attribute {
        let mut children = vec![Attribute::from_u8(CTA_PROTO_NUM, self.protocol)];
        match self.protocol {
            IPPROTO_ICMP => {
                children.push(Attribute::from_u16(CTA_PROTO_ICMP_ID, self.icmp_id));
                children.push(Attribute::from_u8(CTA_PROTO_ICMP_TYPE, self.icmp_type));
                children.push(Attribute::from_u8(CTA_PROTO_ICMP_CODE, self.icmp_code));
            }
            IPPROTO_ICMPV6 => {
                children.push(Attribute::from_u16(CTA_PROTO_ICMPV6_ID, self.icmp_id));
                children.push(Attribute::from_u8(CTA_PROTO_ICMPV6_TYPE, self.icmp_type));
                children.push(Attribute::from_u8(CTA_PROTO_ICMPV6_CODE, self.icmp_code));
            }
            _ => {
                children.push(Attribute::from_u16(CTA_PROTO_SRC_PORT, self.src_port));
                children.push(Attribute::from_u16(CTA_PROTO_DST_PORT, self.dst_port));
            }
        }
        Attribute::nest(CTA_TUPLE_PROTO, children)
    }

    /// Decode from a nested CTA_TUPLE_PROTO attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<ProtoTuple> {
        let mut proto = ProtoTuple::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_PROTO_NUM => proto.protocol = get::u8(&child.data)?,
                CTA_PROTO_SRC_PORT => proto.src_port = get::u16_be(&child.data)?,
                CTA_PROTO_DST_PORT => proto.dst_port = get::u16_be(&child.data)?,
                CTA_PROTO_ICMP_ID | CTA_PROTO_ICMPV6_ID => {
                    proto.icmp_id = get::u16_be(&child.data)?
                }
                CTA_PROTO_ICMP_TYPE | CTA_PROTO_ICMPV6_TYPE => {
                    proto.icmp_type = get::u8(&child.data)?
                }
                CTA_PROTO_ICMP_CODE | CTA_PROTO_ICMPV6_CODE => {
                    proto.icmp_code = get::u8(&child.data)?
                }
                _ => {}
            }
        }
        Ok(proto)
    }
}

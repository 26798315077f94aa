//! Netfilter netlink dialect: message framing and subsystem constants.
//!
//! Netfilter packs a subsystem id and a per-subsystem message type into
//! the 16-bit netlink type field and prefixes every payload with a 4-byte
//! sub-header (family, version, big-endian resource id) ahead of the
//! attribute stream.

use winnow::binary;
use winnow::prelude::*;

use crate::netlink::attr::Attribute;
use crate::netlink::error::{Error, Result};
use crate::netlink::message::Message;

/// Netfilter sub-header version, always zero.
pub const NFNETLINK_V0: u8 = 0;

/// Size of the netfilter sub-header (struct nfgenmsg).
pub const NFGENMSG_LEN: usize = 4;

/// Netfilter subsystem ids (high byte of the netlink type field).
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubsystemId {
    #[default]
    None = 0,
    CTNetlink = 1,
    CTNetlinkExp = 2,
    Queue = 3,
    ULog = 4,
    OSF = 5,
    IPSet = 6,
    AcctQuota = 7,
    NFTables = 10,
    NFTCompat = 11,
}

impl TryFrom<u8> for SubsystemId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::CTNetlink,
            2 => Self::CTNetlinkExp,
            3 => Self::Queue,
            4 => Self::ULog,
            5 => Self::OSF,
            6 => Self::IPSet,
            7 => Self::AcctQuota,
            10 => Self::NFTables,
            11 => Self::NFTCompat,
            other => {
                return Err(Error::InvalidMessage(format!(
                    "unknown netfilter subsystem {}",
                    other
                )));
            }
        })
    }
}

/// Netfilter protocol families (nfgenmsg family field).
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtoFamily {
    #[default]
    Unspec = 0,
    Inet = 1,
    IPv4 = 2,
    ARP = 3,
    NetDev = 5,
    Bridge = 7,
    IPv6 = 10,
    DECnet = 12,
}

impl TryFrom<u8> for ProtoFamily {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Unspec,
            1 => Self::Inet,
            2 => Self::IPv4,
            3 => Self::ARP,
            5 => Self::NetDev,
            7 => Self::Bridge,
            10 => Self::IPv6,
            12 => Self::DECnet,
            other => {
                return Err(Error::InvalidMessage(format!(
                    "unknown netfilter protocol family {}",
                    other
                )));
            }
        })
    }
}

/// Netfilter multicast groups (NFNLGRP).
pub mod groups {
    pub const CT_NEW: u32 = 1;
    pub const CT_UPDATE: u32 = 2;
    pub const CT_DESTROY: u32 = 3;
    pub const CT_EXP_NEW: u32 = 4;
    pub const CT_EXP_UPDATE: u32 = 5;
    pub const CT_EXP_DESTROY: u32 = 6;

    /// All conntrack flow event groups.
    pub const CT: [u32; 3] = [CT_NEW, CT_UPDATE, CT_DESTROY];
    /// All conntrack expectation event groups.
    pub const CT_EXP: [u32; 3] = [CT_EXP_NEW, CT_EXP_UPDATE, CT_EXP_DESTROY];
}

/// Decomposed netfilter message header.
///
/// Combines the fields netfilter splits out of the netlink type field with
/// the 4-byte sub-header that precedes the attribute stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Subsystem id (high byte of the netlink type field).
    pub subsystem: SubsystemId,
    /// Per-subsystem message type (low byte of the netlink type field).
    pub message_type: u8,
    /// Netlink header flags.
    pub flags: u16,
    /// Protocol family.
    pub family: ProtoFamily,
    /// Sub-header version, always [`NFNETLINK_V0`].
    pub version: u8,
    /// Resource id, big-endian on the wire. Conntrack statistics replies
    /// carry the CPU number here.
    pub resource_id: u16,
}

impl Header {
    /// Create a request header.
    pub fn request(
        subsystem: SubsystemId,
        message_type: u8,
        family: ProtoFamily,
        flags: u16,
    ) -> Self {
        Self {
            subsystem,
            message_type,
            flags,
            family,
            version: NFNETLINK_V0,
            resource_id: 0,
        }
    }

    /// The combined netlink type field.
    pub fn nlmsg_type(&self) -> u16 {
        (self.subsystem as u16) << 8 | self.message_type as u16
    }

    /// Frame an attribute tree into a sendable netlink message.
    pub fn into_message(self, attrs: &[Attribute]) -> Result<Message> {
        let mut payload = Vec::with_capacity(NFGENMSG_LEN);
        payload.push(self.family as u8);
        payload.push(self.version);
        payload.extend_from_slice(&self.resource_id.to_be_bytes());
        payload.extend_from_slice(&Attribute::marshal(attrs)?);
        Ok(Message::new(self.nlmsg_type(), self.flags, payload))
    }

    /// Decompose a received message into its netfilter header and
    /// attribute tree.
    pub fn from_message(msg: &Message) -> Result<(Header, Vec<Attribute>)> {
        if msg.payload.len() < NFGENMSG_LEN {
            return Err(Error::Truncated {
                expected: NFGENMSG_LEN,
                actual: msg.payload.len(),
            });
        }

        let mut input = msg.payload.as_slice();
        let (family, version, resource_id) = nfgenmsg(&mut input)
            .map_err(|_| Error::InvalidMessage("bad netfilter sub-header".into()))?;

        let header = Header {
            subsystem: SubsystemId::try_from((msg.header.nlmsg_type >> 8) as u8)?,
            message_type: msg.header.nlmsg_type as u8,
            flags: msg.header.nlmsg_flags,
            family: ProtoFamily::try_from(family)?,
            version,
            resource_id,
        };
        let attrs = Attribute::unmarshal(input)?;
        Ok((header, attrs))
    }
}

/// Parse the fixed nfgenmsg prefix, leaving the input at the attributes.
fn nfgenmsg(input: &mut &[u8]) -> winnow::Result<(u8, u8, u16)> {
    let family = binary::u8.parse_next(input)?;
    let version = binary::u8.parse_next(input)?;
    let res_id = binary::be_u16.parse_next(input)?;
    Ok((family, version, res_id))
}

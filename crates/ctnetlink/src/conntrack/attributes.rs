//! Flow sub-structure mappers: helper, protocol info, counters,
//! timestamps, security context, sequence adjustments and SYN proxy
//! state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::netlink::attr::{Attribute, get};
use crate::netlink::error::{Error, Result};

// Helper sub-attributes (CTA_HELP)
pub const CTA_HELP_NAME: u16 = 1;
pub const CTA_HELP_INFO: u16 = 2;

// Protocol info sub-attributes (CTA_PROTOINFO)
pub const CTA_PROTOINFO_TCP: u16 = 1;
pub const CTA_PROTOINFO_DCCP: u16 = 2;
pub const CTA_PROTOINFO_SCTP: u16 = 3;

pub const CTA_PROTOINFO_TCP_STATE: u16 = 1;
pub const CTA_PROTOINFO_TCP_WSCALE_ORIGINAL: u16 = 2;
pub const CTA_PROTOINFO_TCP_WSCALE_REPLY: u16 = 3;
pub const CTA_PROTOINFO_TCP_FLAGS_ORIGINAL: u16 = 4;
pub const CTA_PROTOINFO_TCP_FLAGS_REPLY: u16 = 5;

pub const CTA_PROTOINFO_DCCP_STATE: u16 = 1;
pub const CTA_PROTOINFO_DCCP_ROLE: u16 = 2;
pub const CTA_PROTOINFO_DCCP_HANDSHAKE_SEQ: u16 = 3;

pub const CTA_PROTOINFO_SCTP_STATE: u16 = 1;
pub const CTA_PROTOINFO_SCTP_VTAG_ORIGINAL: u16 = 2;
pub const CTA_PROTOINFO_SCTP_VTAG_REPLY: u16 = 3;

// Counter sub-attributes (CTA_COUNTERS_*)
pub const CTA_COUNTERS_PACKETS: u16 = 1;
pub const CTA_COUNTERS_BYTES: u16 = 2;

// Timestamp sub-attributes (CTA_TIMESTAMP)
pub const CTA_TIMESTAMP_START: u16 = 1;
pub const CTA_TIMESTAMP_STOP: u16 = 2;

// Security context sub-attributes (CTA_SECCTX)
pub const CTA_SECCTX_NAME: u16 = 1;

// Sequence adjustment sub-attributes (CTA_SEQ_ADJ_*)
pub const CTA_SEQADJ_CORRECTION_POS: u16 = 1;
pub const CTA_SEQADJ_OFFSET_BEFORE: u16 = 2;
pub const CTA_SEQADJ_OFFSET_AFTER: u16 = 3;

// SYN proxy sub-attributes (CTA_SYNPROXY)
pub const CTA_SYNPROXY_ISN: u16 = 1;
pub const CTA_SYNPROXY_ITS: u16 = 2;
pub const CTA_SYNPROXY_TSOFF: u16 = 3;

/// Conntrack helper attached to a flow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Helper {
    /// Helper name (e.g. "ftp").
    pub name: String,
    /// Opaque per-helper data.
    pub info: Vec<u8>,
}

impl Helper {
    /// Encode into a nested attribute of the given type.
    pub fn marshal(&self, attr_type: u16) -> Attribute {
        let mut children = vec![Attribute::from_str_nul(CTA_HELP_NAME, &self.name)];
        if !self.info.is_empty() {
            children.push(Attribute::new(CTA_HELP_INFO, self.info.clone()));
        }
        Attribute::nest(attr_type, children)
    }

    /// Decode from a nested helper attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<Helper> {
        let mut helper = Helper::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_HELP_NAME => helper.name = child.string()?.to_string(),
                CTA_HELP_INFO => helper.info = child.data.clone(),
                _ => {}
            }
        }
        Ok(helper)
    }
}

/// Per-protocol connection state.
///
/// At most one sub-protocol exists per flow; the enum makes two populated
/// variants unrepresentable.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtoInfo {
    /// No protocol info present.
    #[default]
    None,
    /// TCP connection state.
    Tcp(ProtoInfoTcp),
    /// DCCP connection state.
    Dccp(ProtoInfoDccp),
    /// SCTP connection state.
    Sctp(ProtoInfoSctp),
}

impl ProtoInfo {
    /// Whether any sub-protocol is populated.
    pub fn is_some(&self) -> bool {
        !matches!(self, ProtoInfo::None)
    }

    /// Encode into a nested attribute of the given type.
    pub fn marshal(&self, attr_type: u16) -> Result<Attribute> {
        let child = match self {
            ProtoInfo::None => {
                return Err(Error::InvalidAttribute(
                    "cannot marshal empty protocol info".into(),
                ));
            }
            ProtoInfo::Tcp(tcp) => tcp.marshal(),
            ProtoInfo::Dccp(dccp) => dccp.marshal(),
            ProtoInfo::Sctp(sctp) => sctp.marshal(),
        };
        Ok(Attribute::nest(attr_type, vec![child]))
    }

    /// Decode from a nested protocol info attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<ProtoInfo> {
        // The kernel sends exactly one sub-protocol.
        let Some(child) = attr.children.first() else {
            return Ok(ProtoInfo::None);
        };
        Ok(match child.attr_type {
            CTA_PROTOINFO_TCP => ProtoInfo::Tcp(ProtoInfoTcp::unmarshal(child)?),
            CTA_PROTOINFO_DCCP => ProtoInfo::Dccp(ProtoInfoDccp::unmarshal(child)?),
            CTA_PROTOINFO_SCTP => ProtoInfo::Sctp(ProtoInfoSctp::unmarshal(child)?),
            _ => ProtoInfo::None,
        })
    }
}

/// TCP state of a flow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtoInfoTcp {
    /// TCP conntrack state machine value.
    pub state: u8,
    /// Window scale in the original direction.
    pub orig_window_scale: u8,
    /// Window scale in the reply direction.
    pub reply_window_scale: u8,
    /// Connection flags in the original direction.
    pub orig_flags: u16,
    /// Connection flags in the reply direction.
    pub reply_flags: u16,
}

impl ProtoInfoTcp {
    fn marshal(&self) -> Attribute {
        Attribute::nest(
            CTA_PROTOINFO_TCP,
            vec![
                Attribute::from_u8(CTA_PROTOINFO_TCP_STATE, self.state),
                Attribute::from_u8(CTA_PROTOINFO_TCP_WSCALE_ORIGINAL, self.orig_window_scale),
                Attribute::from_u8(CTA_PROTOINFO_TCP_WSCALE_REPLY, self.reply_window_scale),
                Attribute::from_u16(CTA_PROTOINFO_TCP_FLAGS_ORIGINAL, self.orig_flags),
                Attribute::from_u16(CTA_PROTOINFO_TCP_FLAGS_REPLY, self.reply_flags),
            ],
        )
    }

    fn unmarshal(attr: &Attribute) -> Result<ProtoInfoTcp> {
        let mut tcp = ProtoInfoTcp::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_PROTOINFO_TCP_STATE => tcp.state = get::u8(&child.data)?,
                CTA_PROTOINFO_TCP_WSCALE_ORIGINAL => {
                    tcp.orig_window_scale = get::u8(&child.data)?
                }
                CTA_PROTOINFO_TCP_WSCALE_REPLY => {
                    tcp.reply_window_scale = get::u8(&child.data)?
                }
                CTA_PROTOINFO_TCP_FLAGS_ORIGINAL => tcp.orig_flags = get::u16_be(&child.data)?,
                CTA_PROTOINFO_TCP_FLAGS_REPLY => tcp.reply_flags = get::u16_be(&child.data)?,
                _ => {}
            }
        }
        Ok(tcp)
    }
}

/// DCCP state of a flow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtoInfoDccp {
    /// DCCP state machine value.
    pub state: u8,
    /// Connection role.
    pub role: u8,
    /// Handshake sequence number.
    pub handshake_seq: u64,
}

impl ProtoInfoDccp {
    fn marshal(&self) -> Attribute {
        Attribute::nest(
            CTA_PROTOINFO_DCCP,
            vec![
                Attribute::from_u8(CTA_PROTOINFO_DCCP_STATE, self.state),
                Attribute::from_u8(CTA_PROTOINFO_DCCP_ROLE, self.role),
                Attribute::from_u64(CTA_PROTOINFO_DCCP_HANDSHAKE_SEQ, self.handshake_seq),
            ],
        )
    }

    fn unmarshal(attr: &Attribute) -> Result<ProtoInfoDccp> {
        let mut dccp = ProtoInfoDccp::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_PROTOINFO_DCCP_STATE => dccp.state = get::u8(&child.data)?,
                CTA_PROTOINFO_DCCP_ROLE => dccp.role = get::u8(&child.data)?,
                CTA_PROTOINFO_DCCP_HANDSHAKE_SEQ => {
                    dccp.handshake_seq = get_u64_be(&child.data)?
                }
                _ => {}
            }
        }
        Ok(dccp)
    }
}

/// SCTP state of a flow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtoInfoSctp {
    /// SCTP state machine value.
    pub state: u8,
    /// Verification tag in the original direction.
    pub vtag_original: u32,
    /// Verification tag in the reply direction.
    pub vtag_reply: u32,
}

impl ProtoInfoSctp {
    fn marshal(&self) -> Attribute {
        Attribute::nest(
            CTA_PROTOINFO_SCTP,
            vec![
                Attribute::from_u8(CTA_PROTOINFO_SCTP_STATE, self.state),
                Attribute::from_u32(CTA_PROTOINFO_SCTP_VTAG_ORIGINAL, self.vtag_original),
                Attribute::from_u32(CTA_PROTOINFO_SCTP_VTAG_REPLY, self.vtag_reply),
            ],
        )
    }

    fn unmarshal(attr: &Attribute) -> Result<ProtoInfoSctp> {
        let mut sctp = ProtoInfoSctp::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_PROTOINFO_SCTP_STATE => sctp.state = get::u8(&child.data)?,
                CTA_PROTOINFO_SCTP_VTAG_ORIGINAL => {
                    sctp.vtag_original = get::u32_be(&child.data)?
                }
                CTA_PROTOINFO_SCTP_VTAG_REPLY => sctp.vtag_reply = get::u32_be(&child.data)?,
                _ => {}
            }
        }
        Ok(sctp)
    }
}

/// Packet and byte counters for one direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Counter {
    /// Packets seen.
    pub packets: u64,
    /// Bytes seen.
    pub bytes: u64,
}

impl Counter {
    /// Decode from a nested counters attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<Counter> {
        let mut counter = Counter::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_COUNTERS_PACKETS => counter.packets = get_u64_be(&child.data)?,
                CTA_COUNTERS_BYTES => counter.bytes = get_u64_be(&child.data)?,
                _ => {}
            }
        }
        Ok(counter)
    }
}

/// Flow start and stop instants.
///
/// The kernel reports nanoseconds since the epoch; an absent stop time
/// means the flow is still open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp {
    /// When the flow was first seen.
    pub start: Option<SystemTime>,
    /// When the flow was torn down, if it has been.
    pub stop: Option<SystemTime>,
}

impl Timestamp {
    /// Decode from a nested timestamp attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<Timestamp> {
        let mut ts = Timestamp::default();
        for child in &attr.children {
            let instant = UNIX_EPOCH + Duration::from_nanos(get_u64_be(&child.data)?);
            match child.attr_type {
                CTA_TIMESTAMP_START => ts.start = Some(instant),
                CTA_TIMESTAMP_STOP => ts.stop = Some(instant),
                _ => {}
            }
        }
        Ok(ts)
    }
}

/// TCP sequence adjustment for one direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SequenceAdjust {
    /// Sequence number of the last adjustment.
    pub position: u32,
    /// Offset applied before the position.
    pub offset_before: u32,
    /// Offset applied after the position.
    pub offset_after: u32,
}

impl SequenceAdjust {
    /// Any field is set.
    pub fn is_some(&self) -> bool {
        *self != SequenceAdjust::default()
    }

    /// Encode into a nested attribute of the given type.
    pub fn marshal(&self, attr_type: u16) -> Attribute {
        Attribute::nest(
            attr_type,
            vec![
                Attribute::from_u32(CTA_SEQADJ_CORRECTION_POS, self.position),
                Attribute::from_u32(CTA_SEQADJ_OFFSET_BEFORE, self.offset_before),
                Attribute::from_u32(CTA_SEQADJ_OFFSET_AFTER, self.offset_after),
            ],
        )
    }

    /// Decode from a nested sequence adjustment attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<SequenceAdjust> {
        let mut adj = SequenceAdjust::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_SEQADJ_CORRECTION_POS => adj.position = get::u32_be(&child.data)?,
                CTA_SEQADJ_OFFSET_BEFORE => adj.offset_before = get::u32_be(&child.data)?,
                CTA_SEQADJ_OFFSET_AFTER => adj.offset_after = get::u32_be(&child.data)?,
                _ => {}
            }
        }
        Ok(adj)
    }
}

/// SYN proxy state of a flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SynProxy {
    /// Initial sequence number.
    pub isn: u32,
    /// Initial timestamp.
    pub its: u32,
    /// Timestamp offset.
    pub ts_off: u32,
}

impl SynProxy {
    /// Any field is set.
    pub fn is_some(&self) -> bool {
        *self != SynProxy::default()
    }

    /// Encode into a nested attribute of the given type.
    pub fn marshal(&self, attr_type: u16) -> Attribute {
        Attribute::nest(
            attr_type,
            vec![
                Attribute::from_u32(CTA_SYNPROXY_ISN, self.isn),
                Attribute::from_u32(CTA_SYNPROXY_ITS, self.its),
                Attribute::from_u32(CTA_SYNPROXY_TSOFF, self.ts_off),
            ],
        )
    }

    /// Decode from a nested SYN proxy attribute.
    pub fn unmarshal(attr: &Attribute) -> Result<SynProxy> {
        let mut sp = SynProxy::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_SYNPROXY_ISN => sp.isn = get::u32_be(&child.data)?,
                CTA_SYNPROXY_ITS => sp.its = get::u32_be(&child.data)?,
                CTA_SYNPROXY_TSOFF => sp.ts_off = get::u32_be(&child.data)?,
                _ => {}
            }
        }
        Ok(sp)
    }
}

/// Decode the security context name from a nested CTA_SECCTX attribute.
pub fn unmarshal_secctx(attr: &Attribute) -> Result<Option<String>> {
    for child in &attr.children {
        if child.attr_type == CTA_SECCTX_NAME {
            return Ok(Some(child.string()?.to_string()));
        }
    }
    Ok(None)
}

/// Big-endian u64 with bounds checking, for kernel counter payloads.
fn get_u64_be(data: &[u8]) -> Result<u64> {
    if data.len() < 8 {
        return Err(Error::InvalidAttribute("truncated u64 attribute".into()));
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[..8]);
    Ok(u64::from_be_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protoinfo_tcp_roundtrip() {
        let info = ProtoInfo::Tcp(ProtoInfoTcp {
            state: 3,
            orig_window_scale: 7,
            reply_window_scale: 8,
            orig_flags: 0x0102,
            reply_flags: 0x0304,
        });

        let attr = info.marshal(4).unwrap();
        assert!(attr.nested);
        let decoded = ProtoInfo::unmarshal(&attr).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_protoinfo_sctp_roundtrip() {
        let info = ProtoInfo::Sctp(ProtoInfoSctp {
            state: 2,
            vtag_original: 0xaabbccdd,
            vtag_reply: 0x11223344,
        });
        let attr = info.marshal(4).unwrap();
        assert_eq!(ProtoInfo::unmarshal(&attr).unwrap(), info);
    }

    #[test]
    fn test_protoinfo_none_does_not_marshal() {
        assert!(ProtoInfo::None.marshal(4).is_err());
        assert!(!ProtoInfo::None.is_some());
    }

    #[test]
    fn test_helper_roundtrip() {
        let helper = Helper {
            name: "ftp".into(),
            info: vec![1, 2, 3],
        };
        let attr = helper.marshal(5);
        assert_eq!(Helper::unmarshal(&attr).unwrap(), helper);
    }

    #[test]
    fn test_counter_unmarshal() {
        let attr = Attribute::nest(
            9,
            vec![
                Attribute::from_u64(CTA_COUNTERS_PACKETS, 12),
                Attribute::from_u64(CTA_COUNTERS_BYTES, 3400),
            ],
        );
        let counter = Counter::unmarshal(&attr).unwrap();
        assert_eq!(counter.packets, 12);
        assert_eq!(counter.bytes, 3400);
    }

    #[test]
    fn test_timestamp_open_flow() {
        let attr = Attribute::nest(
            20,
            vec![Attribute::from_u64(CTA_TIMESTAMP_START, 1_700_000_000_000_000_000)],
        );
        let ts = Timestamp::unmarshal(&attr).unwrap();
        assert!(ts.start.is_some());
        assert!(ts.stop.is_none());
    }

    #[test]
    fn test_seqadj_roundtrip() {
        let adj = SequenceAdjust {
            position: 100,
            offset_before: 5,
            offset_after: 10,
        };
        assert!(adj.is_some());
        let attr = adj.marshal(15);
        assert_eq!(SequenceAdjust::unmarshal(&attr).unwrap(), adj);
    }

    #[test]
    fn test_synproxy_roundtrip() {
        let sp = SynProxy {
            isn: 1,
            its: 2,
            ts_off: 3,
        };
        let attr = sp.marshal(24);
        assert_eq!(SynProxy::unmarshal(&attr).unwrap(), sp);
    }

    #[test]
    fn test_secctx() {
        let attr = Attribute::nest(
            19,
            vec![Attribute::from_str_nul(CTA_SECCTX_NAME, "system_u:object_r:t")],
        );
        assert_eq!(
            unmarshal_secctx(&attr).unwrap().as_deref(),
            Some("system_u:object_r:t")
        );
    }
}

//! Flow: one tracked connection and its attribute mapping.

use std::net::IpAddr;

use crate::netlink::attr::{Attribute, get};
use crate::netlink::error::{Error, Result};

use super::attributes::{
    Counter, Helper, ProtoInfo, SequenceAdjust, SynProxy, Timestamp, unmarshal_secctx,
};
use super::status::Status;
use super::tuple::{IpTuple, ProtoTuple, Tuple};

// Root conntrack attributes
pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_TUPLE_REPLY: u16 = 2;
pub const CTA_STATUS: u16 = 3;
pub const CTA_PROTOINFO: u16 = 4;
pub const CTA_HELP: u16 = 5;
pub const CTA_NAT_SRC: u16 = 6;
pub const CTA_TIMEOUT: u16 = 7;
pub const CTA_MARK: u16 = 8;
pub const CTA_COUNTERS_ORIG: u16 = 9;
pub const CTA_COUNTERS_REPLY: u16 = 10;
pub const CTA_USE: u16 = 11;
pub const CTA_ID: u16 = 12;
pub const CTA_NAT_DST: u16 = 13;
pub const CTA_TUPLE_MASTER: u16 = 14;
pub const CTA_SEQ_ADJ_ORIG: u16 = 15;
pub const CTA_SEQ_ADJ_REPLY: u16 = 16;
pub const CTA_SECMARK: u16 = 17;
pub const CTA_ZONE: u16 = 18;
pub const CTA_SECCTX: u16 = 19;
pub const CTA_TIMESTAMP: u16 = 20;
pub const CTA_MARK_MASK: u16 = 21;
pub const CTA_LABELS: u16 = 22;
pub const CTA_LABELS_MASK: u16 = 23;
pub const CTA_SYNPROXY: u16 = 24;

/// A tracked connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Flow {
    /// Tuple in the original direction.
    pub tuple_orig: Tuple,
    /// Tuple in the reply direction.
    pub tuple_reply: Tuple,
    /// Master tuple, set on related flows.
    pub tuple_master: Tuple,

    /// Status flags.
    pub status: Status,
    /// Remaining lifetime in seconds.
    pub timeout: u32,
    /// Packet mark.
    pub mark: u32,
    /// Conntrack zone.
    pub zone: u16,
    /// Reference count.
    pub use_count: u32,
    /// Kernel flow id.
    pub id: u32,

    /// Per-protocol state.
    pub proto_info: ProtoInfo,
    /// Attached helper.
    pub helper: Option<Helper>,
    /// Counters in the original direction.
    pub counters_orig: Counter,
    /// Counters in the reply direction.
    pub counters_reply: Counter,
    /// Start/stop instants.
    pub timestamp: Timestamp,
    /// Security context name.
    pub security_context: Option<String>,
    /// Sequence adjustment, original direction.
    pub seq_adj_orig: SequenceAdjust,
    /// Sequence adjustment, reply direction.
    pub seq_adj_reply: SequenceAdjust,
    /// SYN proxy state.
    pub synproxy: SynProxy,
    /// Connection label bitmap.
    pub labels: Option<Vec<u8>>,
    /// Label mask bitmap.
    pub labels_mask: Option<Vec<u8>>,
}

impl Flow {
    /// Build a flow for the common case: one protocol, source and
    /// destination endpoints, a timeout.
    pub fn new(
        protocol: u8,
        src: IpAddr,
        src_port: u16,
        dst: IpAddr,
        dst_port: u16,
        timeout: u32,
        mark: u32,
    ) -> Self {
        let tuple = Tuple {
            ip: IpTuple {
                src: Some(src),
                dst: Some(dst),
            },
            proto: ProtoTuple {
                protocol,
                src_port,
                dst_port,
                ..Default::default()
            },
            zone: 0,
        };
        let reply = Tuple {
            ip: IpTuple {
                src: Some(dst),
                dst: Some(src),
            },
            proto: ProtoTuple {
                protocol,
                src_port: dst_port,
                dst_port: src_port,
                ..Default::default()
            },
            zone: 0,
        };

        Flow {
            tuple_orig: tuple,
            tuple_reply: reply,
            timeout,
            mark,
            ..Default::default()
        }
    }

    /// Encode the flow for a mutation request.
    ///
    /// At least one of the original or reply tuples must be filled.
    pub fn marshal(&self) -> Result<Vec<Attribute>> {
        if !self.tuple_orig.filled() && !self.tuple_reply.filled() {
            return Err(Error::NeedTuple);
        }

        let mut attrs = Vec::new();

        if self.tuple_orig.filled() {
            attrs.push(self.tuple_orig.marshal(CTA_TUPLE_ORIG)?);
        }
        if self.tuple_reply.filled() {
            attrs.push(self.tuple_reply.marshal(CTA_TUPLE_REPLY)?);
        }
        if self.tuple_master.filled() {
            attrs.push(self.tuple_master.marshal(CTA_TUPLE_MASTER)?);
        }

        if self.timeout != 0 {
            attrs.push(Attribute::from_u32(CTA_TIMEOUT, self.timeout));
        }
        if self.status.value != 0 {
            attrs.push(Attribute::from_u32(CTA_STATUS, self.status.value));
        }
        if self.mark != 0 {
            attrs.push(Attribute::from_u32(CTA_MARK, self.mark));
        }
        if self.zone != 0 {
            attrs.push(Attribute::from_u16(CTA_ZONE, self.zone));
        }
        if let Some(helper) = &self.helper {
            attrs.push(helper.marshal(CTA_HELP));
        }
        if self.proto_info.is_some() {
            attrs.push(self.proto_info.marshal(CTA_PROTOINFO)?);
        }
        if self.seq_adj_orig.is_some() {
            attrs.push(self.seq_adj_orig.marshal(CTA_SEQ_ADJ_ORIG));
        }
        if self.seq_adj_reply.is_some() {
            attrs.push(self.seq_adj_reply.marshal(CTA_SEQ_ADJ_REPLY));
        }
        if self.synproxy.is_some() {
            attrs.push(self.synproxy.marshal(CTA_SYNPROXY));
        }

        Ok(attrs)
    }

    /// Decode a flow from a reply's attribute tree.
    pub fn unmarshal(attrs: &[Attribute]) -> Result<Flow> {
        let mut flow = Flow::default();

        for attr in attrs {
            match attr.attr_type {
                CTA_TUPLE_ORIG => flow.tuple_orig = Tuple::unmarshal(attr)?,
                CTA_TUPLE_REPLY => flow.tuple_reply = Tuple::unmarshal(attr)?,
                CTA_TUPLE_MASTER => flow.tuple_master = Tuple::unmarshal(attr)?,
                CTA_STATUS => flow.status = Status::new(get::u32_be(&attr.data)?),
                CTA_PROTOINFO => {
                    // Decoding over already-populated protocol info is a
                    // caller bug, not an overwrite.
                    if flow.proto_info.is_some() {
                        return Err(Error::ReusedProtoInfo);
                    }
                    flow.proto_info = ProtoInfo::unmarshal(attr)?;
                }
                CTA_HELP => flow.helper = Some(Helper::unmarshal(attr)?),
                CTA_TIMEOUT => flow.timeout = get::u32_be(&attr.data)?,
                CTA_MARK => flow.mark = get::u32_be(&attr.data)?,
                CTA_ZONE => flow.zone = get::u16_be(&attr.data)?,
                CTA_COUNTERS_ORIG => flow.counters_orig = Counter::unmarshal(attr)?,
                CTA_COUNTERS_REPLY => flow.counters_reply = Counter::unmarshal(attr)?,
                CTA_USE => flow.use_count = get::u32_be(&attr.data)?,
                CTA_ID => flow.id = get::u32_be(&attr.data)?,
                CTA_SEQ_ADJ_ORIG => flow.seq_adj_orig = SequenceAdjust::unmarshal(attr)?,
                CTA_SEQ_ADJ_REPLY => flow.seq_adj_reply = SequenceAdjust::unmarshal(attr)?,
                CTA_SECCTX => flow.security_context = unmarshal_secctx(attr)?,
                CTA_TIMESTAMP => flow.timestamp = Timestamp::unmarshal(attr)?,
                CTA_LABELS => flow.labels = Some(attr.data.clone()),
                CTA_LABELS_MASK => flow.labels_mask = Some(attr.data.clone()),
                CTA_SYNPROXY => flow.synproxy = SynProxy::unmarshal(attr)?,
                _ => {}
            }
        }

        Ok(flow)
    }
}

/// Narrows dumps and flushes to flows whose mark matches under the mask.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Filter {
    /// Mark to match.
    pub mark: u32,
    /// Mask applied to both sides before comparing.
    pub mask: u32,
}

impl Filter {
    /// Encode the filter attributes.
    pub fn marshal(&self) -> Vec<Attribute> {
        vec![
            Attribute::from_u32(CTA_MARK, self.mark),
            Attribute::from_u32(CTA_MARK_MASK, self.mask),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::attributes::ProtoInfoTcp;

    #[test]
    fn test_flow_roundtrip() {
        let flow = Flow::new(
            libc::IPPROTO_TCP as u8,
            "10.0.0.1".parse().unwrap(),
            1234,
            "10.0.0.2".parse().unwrap(),
            80,
            120,
            0,
        );

        let attrs = flow.marshal().unwrap();
        let decoded = Flow::unmarshal(&attrs).unwrap();

        assert_eq!(decoded.tuple_orig, flow.tuple_orig);
        assert_eq!(decoded.tuple_reply, flow.tuple_reply);
        assert_eq!(decoded.timeout, 120);
        // Unset status bit stays unset through the roundtrip.
        assert!(!decoded.status.confirmed());
    }

    #[test]
    fn test_marshal_needs_a_tuple() {
        let flow = Flow {
            timeout: 120,
            ..Default::default()
        };
        assert!(matches!(flow.marshal(), Err(Error::NeedTuple)));
    }

    #[test]
    fn test_reused_proto_info_rejected() {
        let tcp = ProtoInfo::Tcp(ProtoInfoTcp {
            state: 3,
            ..Default::default()
        });
        let attr = tcp.marshal(CTA_PROTOINFO).unwrap();

        // Two protocol info attributes in one tree: the second decode
        // would land on a populated field.
        let err = Flow::unmarshal(&[attr.clone(), attr]).unwrap_err();
        assert!(matches!(err, Error::ReusedProtoInfo));
    }

    #[test]
    fn test_unmarshal_metadata() {
        let attrs = vec![
            Attribute::from_u32(CTA_STATUS, crate::conntrack::status::CONFIRMED),
            Attribute::from_u32(CTA_ID, 0xdead),
            Attribute::from_u32(CTA_USE, 2),
            Attribute::from_u16(CTA_ZONE, 5),
            Attribute::new(CTA_LABELS, vec![0xff; 16]),
        ];
        let flow = Flow::unmarshal(&attrs).unwrap();
        assert!(flow.status.confirmed());
        assert_eq!(flow.id, 0xdead);
        assert_eq!(flow.use_count, 2);
        assert_eq!(flow.zone, 5);
        assert_eq!(flow.labels.as_deref(), Some(&[0xff; 16][..]));
    }

    #[test]
    fn test_filter_marshal() {
        let filter = Filter {
            mark: 0x10,
            mask: 0xf0,
        };
        let attrs = filter.marshal();
        assert_eq!(attrs[0].attr_type, CTA_MARK);
        assert_eq!(attrs[0].u32(), 0x10);
        assert_eq!(attrs[1].attr_type, CTA_MARK_MASK);
        assert_eq!(attrs[1].u32(), 0xf0);
    }
}

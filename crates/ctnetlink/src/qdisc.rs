//! Qdisc statistics over route netlink.
//!
//! A qdisc dump (RTM_GETQDISC) uses the 20-byte tcmsg sub-header instead
//! of nfgenmsg, and the kernel pads its attribute payloads itself, so
//! decoding here walks [`AttrIter`] directly rather than building an
//! owned attribute tree.

use tracing::trace;

use crate::netlink::attr::{AttrIter, get};
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{Message, NLM_F_DUMP, NLM_F_REQUEST, NlMsgType};
use crate::netlink::{Conn, Transport};

/// Size of the route traffic-control sub-header (struct tcmsg).
pub const TCMSG_LEN: usize = 20;

// Qdisc attributes (TCA_*)
pub const TCA_KIND: u16 = 1;
pub const TCA_STATS: u16 = 3;
pub const TCA_STATS2: u16 = 7;

// Children of TCA_STATS2
pub const TCA_STATS_BASIC: u16 = 1;
pub const TCA_STATS_APP: u16 = 2;
pub const TCA_STATS_QUEUE: u16 = 3;

/// fq-specific counters from the TCA_STATS_APP payload, a prefix of
/// struct tc_fq_qd_stats. Older kernels ship shorter payloads, so each
/// field beyond the available bytes stays zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FqStats {
    pub gc_flows: u64,
    pub highprio_packets: u64,
    pub tcp_retrans: u64,
    pub throttled: u64,
    pub flows_plimit: u64,
    pub pkts_too_long: u64,
    pub allocation_errors: u64,
}

impl FqStats {
    fn unmarshal(data: &[u8]) -> FqStats {
        let mut fields = data
            .chunks_exact(8)
            .map(|chunk| u64::from_ne_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]));
        FqStats {
            gc_flows: fields.next().unwrap_or(0),
            highprio_packets: fields.next().unwrap_or(0),
            tcp_retrans: fields.next().unwrap_or(0),
            throttled: fields.next().unwrap_or(0),
            flows_plimit: fields.next().unwrap_or(0),
            pkts_too_long: fields.next().unwrap_or(0),
            allocation_errors: fields.next().unwrap_or(0),
        }
    }
}

/// One qdisc's identity and counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QdiscStats {
    /// Interface the qdisc is attached to.
    pub ifindex: u32,
    /// Qdisc handle.
    pub handle: u32,
    /// Parent handle; zero for root qdiscs.
    pub parent: u32,
    /// Qdisc kind, e.g. "fq" or "pfifo_fast".
    pub kind: String,

    pub bytes: u64,
    pub packets: u32,
    pub qlen: u32,
    pub backlog: u32,
    pub drops: u32,
    pub requeues: u32,
    pub overlimits: u32,

    /// Present when the qdisc is an fq instance with app statistics.
    pub fq: Option<FqStats>,
}

/// Dump every qdisc with its statistics.
///
/// The connection must use [`Protocol::Route`](crate::netlink::Protocol).
pub async fn dump<T: Transport>(conn: &Conn<T>) -> Result<Vec<QdiscStats>> {
    let msg = Message::new(
        NlMsgType::RTM_GETQDISC,
        NLM_F_REQUEST | NLM_F_DUMP,
        vec![0u8; TCMSG_LEN],
    );
    let replies = conn.query(msg).await?;
    trace!(count = replies.len(), "qdisc dump");

    replies
        .iter()
        .filter(|m| m.header.nlmsg_type == NlMsgType::RTM_NEWQDISC)
        .map(parse_qdisc)
        .collect()
}

fn parse_qdisc(msg: &Message) -> Result<QdiscStats> {
    if msg.payload.len() < TCMSG_LEN {
        return Err(Error::Truncated {
            expected: TCMSG_LEN,
            actual: msg.payload.len(),
        });
    }

    let mut qdisc = QdiscStats {
        ifindex: get::u32_ne(&msg.payload[4..8])?,
        handle: get::u32_ne(&msg.payload[8..12])?,
        parent: get::u32_ne(&msg.payload[12..16])?,
        ..Default::default()
    };
    // The kernel reports a root qdisc's parent as TC_H_ROOT.
    if qdisc.parent == u32::MAX {
        qdisc.parent = 0;
    }

    let mut has_stats2 = false;
    for (kind, payload) in AttrIter::new(&msg.payload[TCMSG_LEN..]) {
        match kind {
            TCA_KIND => qdisc.kind = get::string(payload)?.to_string(),
            TCA_STATS2 => {
                has_stats2 = true;
                parse_stats2(&mut qdisc, payload)?;
            }
            // Legacy struct tc_stats, sent alongside TCA_STATS2 on
            // newer kernels; only used when STATS2 is absent.
            TCA_STATS if !has_stats2 => parse_legacy_stats(&mut qdisc, payload)?,
            _ => {}
        }
    }

    Ok(qdisc)
}

fn parse_stats2(qdisc: &mut QdiscStats, payload: &[u8]) -> Result<()> {
    for (kind, data) in AttrIter::new(payload) {
        match kind {
            // struct gnet_stats_basic: bytes u64, packets u32
            TCA_STATS_BASIC => {
                if data.len() < 12 {
                    return Err(Error::Truncated {
                        expected: 12,
                        actual: data.len(),
                    });
                }
                qdisc.bytes = get::u64_ne(&data[0..8])?;
                qdisc.packets = get::u32_ne(&data[8..12])?;
            }
            // struct gnet_stats_queue: qlen, backlog, drops, requeues,
            // overlimits
            TCA_STATS_QUEUE => {
                if data.len() < 20 {
                    return Err(Error::Truncated {
                        expected: 20,
                        actual: data.len(),
                    });
                }
                qdisc.qlen = get::u32_ne(&data[0..4])?;
                qdisc.backlog = get::u32_ne(&data[4..8])?;
                qdisc.drops = get::u32_ne(&data[8..12])?;
                qdisc.requeues = get::u32_ne(&data[12..16])?;
                qdisc.overlimits = get::u32_ne(&data[16..20])?;
            }
            TCA_STATS_APP if qdisc.kind == "fq" => {
                qdisc.fq = Some(FqStats::unmarshal(data));
            }
            _ => {}
        }
    }
    Ok(())
}

/// struct tc_stats: bytes u64 then packets, drops, overlimits, bps, pps,
/// qlen, backlog as u32.
fn parse_legacy_stats(qdisc: &mut QdiscStats, payload: &[u8]) -> Result<()> {
    if payload.len() < 36 {
        return Err(Error::Truncated {
            expected: 36,
            actual: payload.len(),
        });
    }
    qdisc.bytes = get::u64_ne(&payload[0..8])?;
    qdisc.packets = get::u32_ne(&payload[8..12])?;
    qdisc.drops = get::u32_ne(&payload[12..16])?;
    qdisc.overlimits = get::u32_ne(&payload[16..20])?;
    qdisc.qlen = get::u32_ne(&payload[28..32])?;
    qdisc.backlog = get::u32_ne(&payload[32..36])?;
    Ok(())
}

//! Generic Netlink (GENL) family resolution.
//!
//! Resolves a family name to its numeric protocol id, version and
//! multicast group ids by querying the kernel's netlink controller
//! family. Results are not cached here; callers may cache externally.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::attr::{AttrIter, Attribute, get};
use super::conn::{Conn, Transport};
use super::error::{Error, Result};
use super::message::{Message, NLM_F_DUMP, NLM_F_REQUEST};

/// Controller family id (fixed, not dynamically assigned).
pub const GENL_ID_CTRL: u16 = 0x10;

/// Size of the generic netlink header.
pub const GENL_HDRLEN: usize = 4;

/// Generic netlink message header (mirrors struct genlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GenlMsgHdr {
    /// Command.
    pub cmd: u8,
    /// Family version.
    pub version: u8,
    /// Reserved, must be zero.
    pub reserved: u16,
}

impl GenlMsgHdr {
    /// Create a new header.
    pub fn new(cmd: u8, version: u8) -> Self {
        Self {
            cmd,
            version,
            reserved: 0,
        }
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

/// Control family commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCmd {
    Unspec = 0,
    NewFamily = 1,
    DelFamily = 2,
    GetFamily = 3,
    NewOps = 4,
    DelOps = 5,
    GetOps = 6,
    NewMcastGrp = 7,
    DelMcastGrp = 8,
    GetMcastGrp = 9,
}

/// Control family attributes.
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_VERSION: u16 = 3;
pub const CTRL_ATTR_HDRSIZE: u16 = 4;
pub const CTRL_ATTR_MAXATTR: u16 = 5;
pub const CTRL_ATTR_OPS: u16 = 6;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;

/// Multicast group sub-attributes.
pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// A multicast group registered by a family.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MulticastGroup {
    /// Group id used for membership subscription.
    pub id: u32,
    /// Group name.
    pub name: String,
}

/// A generic netlink family.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Family {
    /// Dynamically assigned family id (used as the message type).
    pub id: u16,
    /// Family name.
    pub name: String,
    /// Family version.
    pub version: u8,
    /// Multicast groups, in kernel order.
    pub groups: Vec<MulticastGroup>,
}

fn get_family_request(name: Option<&str>, flags: u16) -> Result<Message> {
    let mut payload = GenlMsgHdr::new(CtrlCmd::GetFamily as u8, 1).as_bytes().to_vec();
    if let Some(name) = name {
        let attrs = [Attribute::from_str_nul(CTRL_ATTR_FAMILY_NAME, name)];
        payload.extend_from_slice(&Attribute::marshal(&attrs)?);
    }
    Ok(Message::new(GENL_ID_CTRL, flags, payload))
}

/// Resolve a family by name.
///
/// # Panics
///
/// The kernel contract guarantees exactly one reply for a name-qualified
/// lookup. Receiving any other count means the channel is desynchronized
/// beyond recovery and panics rather than returning an error.
pub async fn resolve<T: Transport>(conn: &Conn<T>, name: &str) -> Result<Family> {
    let replies = conn
        .query(get_family_request(Some(name), NLM_F_REQUEST)?)
        .await?;

    if replies.len() != 1 {
        panic!(
            "generic netlink controller returned {} replies for family {:?}, expected exactly 1",
            replies.len(),
            name
        );
    }

    parse_family(&replies[0])
}

/// List every registered family via a dump request.
pub async fn list<T: Transport>(conn: &Conn<T>) -> Result<Vec<Family>> {
    let replies = conn
        .query(get_family_request(None, NLM_F_REQUEST | NLM_F_DUMP)?)
        .await?;
    replies.iter().map(parse_family).collect()
}

fn parse_family(msg: &Message) -> Result<Family> {
    if msg.payload.len() < GENL_HDRLEN {
        return Err(Error::Truncated {
            expected: GENL_HDRLEN,
            actual: msg.payload.len(),
        });
    }

    let mut id = 0u16;
    let mut name = String::new();
    let mut version = 0u8;
    let mut groups = Vec::new();

    for (kind, payload) in AttrIter::new(&msg.payload[GENL_HDRLEN..]) {
        match kind {
            CTRL_ATTR_FAMILY_ID => id = get::u16_ne(payload)?,
            CTRL_ATTR_FAMILY_NAME => name = get::string(payload)?.to_string(),
            CTRL_ATTR_VERSION => {
                let v = get::u32_ne(payload)?;
                version = u8::try_from(v).map_err(|_| {
                    Error::InvalidAttribute(format!("family version {} does not fit u8", v))
                })?;
            }
            CTRL_ATTR_MCAST_GROUPS => groups = parse_mcast_groups(payload)?,
            _ => {}
        }
    }

    Ok(Family {
        id,
        name,
        version,
        groups,
    })
}

/// Decode the attribute-indexed multicast group array.
///
/// Each group wrapper's attribute type must equal its 1-based position;
/// a gap means a truncated or reordered array and fails decoding.
fn parse_mcast_groups(data: &[u8]) -> Result<Vec<MulticastGroup>> {
    let mut groups = Vec::new();

    for (index, (kind, payload)) in AttrIter::new(data).enumerate() {
        if kind as usize != index + 1 {
            return Err(Error::InvalidAttribute(format!(
                "multicast group at position {} carries index {}",
                index + 1,
                kind
            )));
        }

        let mut id = 0u32;
        let mut name = String::new();
        for (kind, payload) in AttrIter::new(payload) {
            match kind {
                CTRL_ATTR_MCAST_GRP_ID => id = get::u32_ne(payload)?,
                CTRL_ATTR_MCAST_GRP_NAME => name = get::string(payload)?.to_string(),
                _ => {}
            }
        }
        groups.push(MulticastGroup { id, name });
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::conn::tests::FakeTransport;
    use crate::netlink::message::NlMsgHdr;

    // The kernel emits plain wrapper attrs, not NESTED-flagged ones.
    fn group_attr(index: u16, id: u32, name: &str) -> Attribute {
        let children = vec![
            Attribute::from_str_nul(CTRL_ATTR_MCAST_GRP_NAME, name),
            Attribute::new(CTRL_ATTR_MCAST_GRP_ID, id.to_ne_bytes().to_vec()),
        ];
        Attribute::new(index, Attribute::marshal(&children).unwrap())
    }

    fn family_reply(seq: u32, pid: u32, id: u16, name: &str, groups: &[Attribute]) -> Vec<u8> {
        let mut payload = GenlMsgHdr::new(CtrlCmd::NewFamily as u8, 2).as_bytes().to_vec();
        let mut attrs = vec![
            Attribute::new(CTRL_ATTR_FAMILY_ID, id.to_ne_bytes().to_vec()),
            Attribute::from_str_nul(CTRL_ATTR_FAMILY_NAME, name),
            Attribute::new(CTRL_ATTR_VERSION, 1u32.to_ne_bytes().to_vec()),
        ];
        if !groups.is_empty() {
            attrs.push(Attribute::new(
                CTRL_ATTR_MCAST_GROUPS,
                Attribute::marshal(groups).unwrap(),
            ));
        }
        payload.extend_from_slice(&Attribute::marshal(&attrs).unwrap());

        let mut msg = Message::new(GENL_ID_CTRL, 0, payload);
        msg.header = NlMsgHdr {
            nlmsg_len: 0,
            nlmsg_type: GENL_ID_CTRL,
            nlmsg_flags: 0,
            nlmsg_seq: seq,
            nlmsg_pid: pid,
        };
        msg.encode()
    }

    #[tokio::test]
    async fn test_resolve_family_with_groups() {
        let conn = Conn::from_transport(FakeTransport::new(10));
        conn.transport().queue(family_reply(
            1,
            10,
            0x1c,
            "nfnl",
            &[group_attr(1, 101, "events"), group_attr(2, 102, "expect")],
        ));

        let family = resolve(&conn, "nfnl").await.unwrap();
        assert_eq!(family.id, 0x1c);
        assert_eq!(family.name, "nfnl");
        assert_eq!(family.version, 1);
        assert_eq!(
            family.groups,
            vec![
                MulticastGroup {
                    id: 101,
                    name: "events".into()
                },
                MulticastGroup {
                    id: 102,
                    name: "expect".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_group_index_gap_fails() {
        let conn = Conn::from_transport(FakeTransport::new(10));
        conn.transport().queue(family_reply(
            1,
            10,
            0x1c,
            "nfnl",
            &[group_attr(1, 101, "events"), group_attr(3, 103, "expect")],
        ));

        let err = resolve(&conn, "nfnl").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute(_)));
    }

    #[tokio::test]
    async fn test_version_must_fit_u8() {
        let conn = Conn::from_transport(FakeTransport::new(10));

        let mut payload = GenlMsgHdr::new(CtrlCmd::NewFamily as u8, 2).as_bytes().to_vec();
        payload.extend_from_slice(
            &Attribute::marshal(&[Attribute::new(
                CTRL_ATTR_VERSION,
                0x1_0000u32.to_ne_bytes().to_vec(),
            )])
            .unwrap(),
        );
        let mut msg = Message::new(GENL_ID_CTRL, 0, payload);
        msg.header.nlmsg_seq = 1;
        msg.header.nlmsg_pid = 10;
        conn.transport().queue(msg.encode());

        let err = resolve(&conn, "oversized").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute(_)));
    }

    #[tokio::test]
    #[should_panic(expected = "expected exactly 1")]
    async fn test_resolve_requires_single_reply() {
        let conn = Conn::from_transport(FakeTransport::new(10));
        let mut datagram = family_reply(1, 10, 1, "a", &[]);
        datagram.extend_from_slice(&family_reply(1, 10, 2, "b", &[]));
        conn.transport().queue(datagram);

        let _ = resolve(&conn, "a").await;
    }

    #[tokio::test]
    async fn test_list_families() {
        use crate::netlink::message::NLM_F_MULTI;

        let conn = Conn::from_transport(FakeTransport::new(10));
        // Dump reply: two families then the done sentinel.
        let mut datagram = Vec::new();
        for wire in [
            family_reply(1, 10, 0x11, "one", &[]),
            family_reply(1, 10, 0x12, "two", &[]),
        ] {
            let mut msgs = Message::decode_all(&wire).unwrap();
            let mut msg = msgs.remove(0);
            msg.header.nlmsg_flags = NLM_F_MULTI;
            datagram.extend_from_slice(&msg.encode());
        }
        datagram.extend_from_slice(&super::super::conn::tests::reply(
            crate::netlink::message::NlMsgType::DONE,
            NLM_F_MULTI,
            1,
            10,
            &0i32.to_ne_bytes(),
        ));
        conn.transport().queue(datagram);

        let families = list(&conn).await.unwrap();
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].name, "one");
        assert_eq!(families[1].id, 0x12);
    }
}

//! Core netlink protocol support: attributes, message framing, the async
//! socket and the validated request/reply connection.

pub mod attr;
pub mod conn;
pub mod error;
pub mod genl;
pub mod message;
pub mod socket;

pub use attr::{AttrIter, Attribute, NLA_F_NESTED, NLA_F_NET_BYTEORDER, NlAttr};
pub use conn::{Conn, MAX_PAYLOAD, Transport, validate};
pub use error::{Error, Result};
pub use genl::{Family, MulticastGroup};
pub use message::{Message, MessageIter, NlMsgError, NlMsgHdr, NlMsgType};
pub use socket::{NetlinkSocket, Protocol};

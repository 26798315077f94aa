//! Multicast event decoding.

use crate::netfilter::{Header, SubsystemId};
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{Message, NLM_F_CREATE, NLM_F_EXCL};

use super::expect::Expect;
use super::flow::Flow;
use super::{CT_DELETE, CT_NEW, EXP_DELETE, EXP_NEW};

/// A conntrack multicast event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Event {
    /// A flow was created.
    New(Flow),
    /// A flow changed state.
    Update(Flow),
    /// A flow was removed.
    Destroy(Flow),
    /// An expectation was created.
    ExpectNew(Expect),
    /// An expectation was removed.
    ExpectDestroy(Expect),
}

impl Event {
    /// Decode one multicast message into an event.
    ///
    /// The kernel reuses the query message types for events: the
    /// subsystem picks flow vs expectation, and for flows the header
    /// flags distinguish creation from update.
    pub fn from_message(msg: Message) -> Result<Event> {
        let (header, attrs) = Header::from_message(&msg)?;

        match (header.subsystem, header.message_type) {
            (SubsystemId::CTNetlink, CT_DELETE) => Ok(Event::Destroy(Flow::unmarshal(&attrs)?)),
            (SubsystemId::CTNetlink, CT_NEW) => {
                let flow = Flow::unmarshal(&attrs)?;
                if header.flags & (NLM_F_EXCL | NLM_F_CREATE) == (NLM_F_EXCL | NLM_F_CREATE) {
                    Ok(Event::New(flow))
                } else {
                    Ok(Event::Update(flow))
                }
            }
            (SubsystemId::CTNetlinkExp, EXP_DELETE) => {
                Ok(Event::ExpectDestroy(Expect::unmarshal(&attrs)?))
            }
            (SubsystemId::CTNetlinkExp, EXP_NEW) => Ok(Event::ExpectNew(Expect::unmarshal(&attrs)?)),
            _ => Err(Error::UnknownEventType(msg.header.nlmsg_type)),
        }
    }
}

//! Connection tracking over netfilter netlink: queries, mutations and
//! multicast events.
//!
//! [`Conn`] is the entry point. It owns a netfilter netlink connection
//! and maps the conntrack and expectation subsystems onto typed
//! [`Flow`]/[`Expect`] operations. [`Conn::listen`] converts the
//! connection into a multicast event listener.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::netfilter::{Header, ProtoFamily, SubsystemId};
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{
    Message, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
};
use crate::netlink::socket::{NetlinkSocket, Protocol};
use crate::netlink::{self, Transport};

pub mod attributes;
pub mod event;
pub mod expect;
pub mod flow;
pub mod stats;
pub mod status;
pub mod tuple;

pub use event::Event;
pub use expect::{Expect, ExpectNat};
pub use flow::{Filter, Flow};
pub use stats::{Stats, StatsExpect};
pub use status::Status;
pub use tuple::{IpTuple, ProtoTuple, Tuple};

// Conntrack subsystem message types (IPCTNL_MSG_CT_*)
pub const CT_NEW: u8 = 0;
pub const CT_GET: u8 = 1;
pub const CT_DELETE: u8 = 2;
pub const CT_GET_CTRZERO: u8 = 3;
pub const CT_GET_STATS_CPU: u8 = 4;
pub const CT_GET_STATS: u8 = 5;

// Expectation subsystem message types (IPCTNL_MSG_EXP_*)
pub const EXP_NEW: u8 = 0;
pub const EXP_GET: u8 = 1;
pub const EXP_DELETE: u8 = 2;
pub const EXP_GET_STATS_CPU: u8 = 3;

/// Options for [`Conn::dump`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpOptions {
    /// Atomically zero each flow's counters as it is dumped.
    pub zero_counters: bool,
}

/// The address family a flow's request should be scoped to.
fn family_of(flow: &Flow) -> ProtoFamily {
    let tuple = if flow.tuple_orig.filled() {
        &flow.tuple_orig
    } else {
        &flow.tuple_reply
    };
    if tuple.is_ipv6() {
        ProtoFamily::IPv6
    } else {
        ProtoFamily::IPv4
    }
}

/// A conntrack connection.
pub struct Conn<T: Transport = NetlinkSocket> {
    conn: netlink::Conn<T>,
}

impl Conn<NetlinkSocket> {
    /// Dial a new netfilter netlink connection.
    pub fn dial() -> Result<Self> {
        Ok(Self {
            conn: netlink::Conn::new(Protocol::Netfilter)?,
        })
    }
}

impl<T: Transport> Conn<T> {
    /// Wrap an existing transport.
    pub fn from_transport(transport: T) -> Self {
        Self {
            conn: netlink::Conn::from_transport(transport),
        }
    }

    /// Send one netfilter request and return the decoded data replies,
    /// skipping acks.
    async fn request(
        &self,
        subsystem: SubsystemId,
        msg_type: u8,
        family: ProtoFamily,
        flags: u16,
        attrs: &[crate::netlink::Attribute],
    ) -> Result<Vec<Message>> {
        let msg = Header::request(subsystem, msg_type, family, flags).into_message(attrs)?;
        let mut replies = self.conn.query(msg).await?;
        replies.retain(|m| !m.is_error());
        Ok(replies)
    }

    /// Dump the whole flow table.
    pub async fn dump(&self, options: DumpOptions) -> Result<Vec<Flow>> {
        let msg_type = if options.zero_counters {
            CT_GET_CTRZERO
        } else {
            CT_GET
        };
        let replies = self
            .request(
                SubsystemId::CTNetlink,
                msg_type,
                ProtoFamily::Unspec,
                NLM_F_REQUEST | NLM_F_DUMP,
                &[],
            )
            .await?;
        replies.iter().map(unmarshal_flow).collect()
    }

    /// Dump the flows whose mark matches the filter.
    pub async fn dump_filter(&self, filter: Filter) -> Result<Vec<Flow>> {
        let replies = self
            .request(
                SubsystemId::CTNetlink,
                CT_GET,
                ProtoFamily::Unspec,
                NLM_F_REQUEST | NLM_F_DUMP,
                &filter.marshal(),
            )
            .await?;
        replies.iter().map(unmarshal_flow).collect()
    }

    /// Dump the expectation table.
    pub async fn dump_expect(&self) -> Result<Vec<Expect>> {
        let replies = self
            .request(
                SubsystemId::CTNetlinkExp,
                EXP_GET,
                ProtoFamily::Unspec,
                NLM_F_REQUEST | NLM_F_DUMP,
                &[],
            )
            .await?;
        replies.iter().map(unmarshal_expect).collect()
    }

    /// Look up the flow matching the query's tuples.
    pub async fn get(&self, query: Flow) -> Result<Flow> {
        if !query.tuple_orig.filled() && !query.tuple_reply.filled() {
            return Err(Error::NeedTuple);
        }
        let family = family_of(&query);
        let attrs = query.marshal()?;
        let replies = self
            .request(
                SubsystemId::CTNetlink,
                CT_GET,
                family,
                NLM_F_REQUEST | NLM_F_ACK,
                &attrs,
            )
            .await?;
        match replies.first() {
            Some(reply) => unmarshal_flow(reply),
            None => Err(Error::InvalidMessage("empty reply to flow lookup".into())),
        }
    }

    /// Create a new flow. The flow must carry a timeout or the kernel
    /// would destroy it immediately.
    pub async fn create(&self, flow: Flow) -> Result<()> {
        if flow.timeout == 0 {
            return Err(Error::NeedTimeout);
        }
        let family = family_of(&flow);
        let attrs = flow.marshal()?;
        self.request(
            SubsystemId::CTNetlink,
            CT_NEW,
            family,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &attrs,
        )
        .await?;
        Ok(())
    }

    /// Update an existing flow. The master tuple identifies a flow's
    /// parent and cannot be changed after creation.
    pub async fn update(&self, flow: Flow) -> Result<()> {
        if flow.tuple_master.filled() {
            return Err(Error::UpdateMaster);
        }
        let family = family_of(&flow);
        let attrs = flow.marshal()?;
        self.request(
            SubsystemId::CTNetlink,
            CT_NEW,
            family,
            NLM_F_REQUEST | NLM_F_ACK,
            &attrs,
        )
        .await?;
        Ok(())
    }

    /// Remove the flow matching the given tuples.
    pub async fn delete(&self, flow: Flow) -> Result<()> {
        let family = family_of(&flow);
        let attrs = flow.marshal()?;
        self.request(
            SubsystemId::CTNetlink,
            CT_DELETE,
            family,
            NLM_F_REQUEST | NLM_F_ACK,
            &attrs,
        )
        .await?;
        Ok(())
    }

    /// Register an expectation for a related connection.
    pub async fn create_expect(&self, expect: Expect) -> Result<()> {
        let family = if expect.tuple.is_ipv6() {
            ProtoFamily::IPv6
        } else {
            ProtoFamily::IPv4
        };
        let attrs = expect.marshal()?;
        self.request(
            SubsystemId::CTNetlinkExp,
            EXP_NEW,
            family,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            &attrs,
        )
        .await?;
        Ok(())
    }

    /// Empty the flow table.
    pub async fn flush(&self) -> Result<()> {
        self.request(
            SubsystemId::CTNetlink,
            CT_DELETE,
            ProtoFamily::Unspec,
            NLM_F_REQUEST | NLM_F_ACK,
            &[],
        )
        .await?;
        Ok(())
    }

    /// Remove the flows whose mark matches the filter.
    pub async fn flush_filter(&self, filter: Filter) -> Result<()> {
        self.request(
            SubsystemId::CTNetlink,
            CT_DELETE,
            ProtoFamily::Unspec,
            NLM_F_REQUEST | NLM_F_ACK,
            &filter.marshal(),
        )
        .await?;
        Ok(())
    }

    /// Fetch per-CPU flow tracking statistics.
    pub async fn stats(&self) -> Result<Vec<Stats>> {
        let replies = self
            .request(
                SubsystemId::CTNetlink,
                CT_GET_STATS_CPU,
                ProtoFamily::Unspec,
                NLM_F_REQUEST | NLM_F_DUMP,
                &[],
            )
            .await?;
        replies
            .iter()
            .map(|msg| {
                let (header, attrs) = Header::from_message(msg)?;
                Stats::unmarshal(header.resource_id, &attrs)
            })
            .collect()
    }

    /// Fetch per-CPU expectation statistics.
    pub async fn stats_expect(&self) -> Result<Vec<StatsExpect>> {
        let replies = self
            .request(
                SubsystemId::CTNetlinkExp,
                EXP_GET_STATS_CPU,
                ProtoFamily::Unspec,
                NLM_F_REQUEST | NLM_F_DUMP,
                &[],
            )
            .await?;
        replies
            .iter()
            .map(|msg| {
                let (header, attrs) = Header::from_message(msg)?;
                StatsExpect::unmarshal(header.resource_id, &attrs)
            })
            .collect()
    }

    /// Count the entries in the flow table.
    pub async fn count(&self) -> Result<u32> {
        let replies = self
            .request(
                SubsystemId::CTNetlink,
                CT_GET_STATS,
                ProtoFamily::Unspec,
                NLM_F_REQUEST | NLM_F_DUMP,
                &[],
            )
            .await?;
        match replies.first() {
            Some(reply) => {
                let (_, attrs) = Header::from_message(reply)?;
                stats::unmarshal_count(&attrs)
            }
            None => Ok(0),
        }
    }
}

impl<T: Transport + Send + Sync + 'static> Conn<T> {
    /// Convert the connection into a multicast event listener.
    ///
    /// Joins the given groups (see [`crate::netfilter::groups`]) and
    /// spawns `workers` tasks that decode events into `events`. Decode
    /// failures go to the returned listener's error channel. Both
    /// channels apply backpressure: a full channel stalls its worker
    /// until the consumer catches up.
    pub fn listen(
        mut self,
        events: mpsc::Sender<Event>,
        workers: usize,
        groups: &[u32],
    ) -> Result<Listener> {
        if self.conn.is_multicast() {
            return Err(Error::AlreadyListening);
        }
        self.conn.join_groups(groups)?;
        debug!(workers, ?groups, "listening for conntrack events");

        let conn = Arc::new(self.conn);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (error_tx, error_rx) = mpsc::channel(workers.max(1));

        let handles = (0..workers)
            .map(|_| {
                let conn = Arc::clone(&conn);
                let events = events.clone();
                let errors = error_tx.clone();
                let mut stop = stop_rx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = stop.changed() => break,
                            received = conn.receive() => {
                                let outcome = received.and_then(decode_event);
                                match outcome {
                                    Ok(event) => {
                                        if events.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    // An undecodable event means this
                                    // worker's view of the stream is gone;
                                    // report once and exit.
                                    Err(err) => {
                                        let _ = errors.send(err).await;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        Ok(Listener {
            errors: error_rx,
            stop: stop_tx,
            handles,
        })
    }
}

/// An event message is always a single message; multipart framing here
/// means the kernel and this library disagree about the protocol.
fn decode_event(mut msgs: Vec<Message>) -> Result<Event> {
    if msgs.len() != 1 {
        return Err(Error::MultipartEvent);
    }
    match msgs.pop() {
        Some(msg) => Event::from_message(msg),
        None => Err(Error::MultipartEvent),
    }
}

fn unmarshal_flow(msg: &Message) -> Result<Flow> {
    let (_, attrs) = Header::from_message(msg)?;
    Flow::unmarshal(&attrs)
}

fn unmarshal_expect(msg: &Message) -> Result<Expect> {
    let (_, attrs) = Header::from_message(msg)?;
    Expect::unmarshal(&attrs)
}

/// Handle on a running set of event workers.
#[derive(Debug)]
pub struct Listener {
    errors: mpsc::Receiver<Error>,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Decode errors from the workers.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<Error> {
        &mut self.errors
    }

    /// Signal the workers to stop and wait for them to finish.
    pub async fn stop(self) {
        // Workers holding a receive also observe the change through the
        // select arm.
        let _ = self.stop.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// [`tokio_stream::Stream`] adapter over an event channel.
pub struct EventStream {
    inner: ReceiverStream<Event>,
}

impl EventStream {
    /// Wrap the receiving half of the channel passed to [`Conn::listen`].
    pub fn new(events: mpsc::Receiver<Event>) -> Self {
        Self {
            inner: ReceiverStream::new(events),
        }
    }
}

impl tokio_stream::Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::conn::tests::{FakeTransport, reply};
    use crate::netlink::message::{NLM_F_MULTI, NlMsgType};
    use std::time::Duration;

    fn encode(
        subsystem: SubsystemId,
        msg_type: u8,
        flags: u16,
        resource_id: u16,
        attrs: &[crate::netlink::Attribute],
        seq: u32,
        pid: u32,
    ) -> Vec<u8> {
        let mut header = Header::request(subsystem, msg_type, ProtoFamily::IPv4, flags);
        header.resource_id = resource_id;
        let mut msg = header.into_message(attrs).unwrap();
        msg.header.nlmsg_seq = seq;
        msg.header.nlmsg_pid = pid;
        msg.encode()
    }

    fn done(seq: u32, pid: u32) -> Vec<u8> {
        reply(NlMsgType::DONE, NLM_F_MULTI, seq, pid, &0i32.to_ne_bytes())
    }

    fn sample_flow() -> Flow {
        Flow::new(
            libc::IPPROTO_TCP as u8,
            "10.0.0.1".parse().unwrap(),
            1234,
            "10.0.0.2".parse().unwrap(),
            80,
            120,
            0,
        )
    }

    #[tokio::test]
    async fn test_dump() {
        let conn = Conn::from_transport(FakeTransport::new(7));
        let flow = sample_flow();
        let attrs = flow.marshal().unwrap();

        let mut datagram = encode(
            SubsystemId::CTNetlink,
            CT_NEW,
            NLM_F_MULTI,
            0,
            &attrs,
            1,
            7,
        );
        datagram.extend_from_slice(&encode(
            SubsystemId::CTNetlink,
            CT_NEW,
            NLM_F_MULTI,
            0,
            &attrs,
            1,
            7,
        ));
        datagram.extend_from_slice(&done(1, 7));
        conn.conn_transport().queue(datagram);

        let flows = conn.dump(DumpOptions::default()).await.unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].tuple_orig, flow.tuple_orig);
        assert_eq!(flows[0].timeout, 120);
    }

    #[tokio::test]
    async fn test_get_requires_tuple() {
        let conn = Conn::from_transport(FakeTransport::new(1));
        let err = conn.get(Flow::default()).await.unwrap_err();
        assert!(matches!(err, Error::NeedTuple));
    }

    #[tokio::test]
    async fn test_create_requires_timeout() {
        let conn = Conn::from_transport(FakeTransport::new(1));
        let mut flow = sample_flow();
        flow.timeout = 0;
        let err = conn.create(flow).await.unwrap_err();
        assert!(matches!(err, Error::NeedTimeout));
    }

    #[tokio::test]
    async fn test_update_rejects_master() {
        let conn = Conn::from_transport(FakeTransport::new(1));
        let mut flow = sample_flow();
        flow.tuple_master = flow.tuple_orig.clone();
        let err = conn.update(flow).await.unwrap_err();
        assert!(matches!(err, Error::UpdateMaster));
    }

    #[tokio::test]
    async fn test_stats_cpu_ids_from_resource_id() {
        let conn = Conn::from_transport(FakeTransport::new(3));
        let attrs = vec![crate::netlink::Attribute::from_u32(
            stats::CTA_STATS_FOUND,
            11,
        )];

        let mut datagram = encode(
            SubsystemId::CTNetlink,
            CT_GET_STATS_CPU,
            NLM_F_MULTI,
            0,
            &attrs,
            1,
            3,
        );
        datagram.extend_from_slice(&encode(
            SubsystemId::CTNetlink,
            CT_GET_STATS_CPU,
            NLM_F_MULTI,
            1,
            &attrs,
            1,
            3,
        ));
        datagram.extend_from_slice(&done(1, 3));
        conn.conn_transport().queue(datagram);

        let stats = conn.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].cpu_id, 0);
        assert_eq!(stats[1].cpu_id, 1);
        assert_eq!(stats[1].found, 11);
    }

    #[tokio::test]
    async fn test_count() {
        let conn = Conn::from_transport(FakeTransport::new(9));
        let attrs = vec![crate::netlink::Attribute::from_u32(
            stats::CTA_STATS_GLOBAL_ENTRIES,
            4096,
        )];
        let mut datagram = encode(
            SubsystemId::CTNetlink,
            CT_GET_STATS,
            NLM_F_MULTI,
            0,
            &attrs,
            1,
            9,
        );
        datagram.extend_from_slice(&done(1, 9));
        conn.conn_transport().queue(datagram);

        assert_eq!(conn.count().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_listen_delivers_events_and_stops() {
        let transport = FakeTransport::new(0);
        let attrs = sample_flow().marshal().unwrap();
        // Event messages carry the sender's pid/seq; validation does not
        // apply on the multicast path.
        transport.queue(encode(
            SubsystemId::CTNetlink,
            CT_DELETE,
            0,
            0,
            &attrs,
            0,
            0,
        ));

        let conn = Conn::from_transport(transport);
        let (tx, rx) = mpsc::channel(8);
        let listener = conn
            .listen(tx, 1, &crate::netfilter::groups::CT)
            .unwrap();

        let mut events = EventStream::new(rx);
        let event = tokio_stream::StreamExt::next(&mut events).await.unwrap();
        assert!(matches!(event, Event::Destroy(_)));

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_listen_reports_multipart_event() {
        let transport = FakeTransport::new(0);
        let attrs = sample_flow().marshal().unwrap();
        // Two messages in one datagram: not a valid event.
        let mut datagram = encode(SubsystemId::CTNetlink, CT_DELETE, 0, 0, &attrs, 0, 0);
        datagram.extend_from_slice(&encode(
            SubsystemId::CTNetlink,
            CT_DELETE,
            0,
            0,
            &attrs,
            0,
            0,
        ));
        transport.queue(datagram);

        let conn = Conn::from_transport(transport);
        let (tx, _rx) = mpsc::channel(8);
        let mut listener = conn
            .listen(tx, 1, &crate::netfilter::groups::CT)
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), listener.errors().recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::MultipartEvent));

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_query_after_listen_construction_is_rejected() {
        let mut inner = netlink::Conn::from_transport(FakeTransport::new(1));
        inner.join_groups(&[1]).unwrap();
        let conn = Conn { conn: inner };

        let err = conn.dump(DumpOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Multicast));

        let (tx, _rx) = mpsc::channel(1);
        let err = conn.listen(tx, 1, &[1]).unwrap_err();
        assert!(matches!(err, Error::AlreadyListening));
    }

    impl Conn<FakeTransport> {
        fn conn_transport(&self) -> &FakeTransport {
            self.conn.transport()
        }
    }
}

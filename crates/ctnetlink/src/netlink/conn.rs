//! Validated request/reply connection on top of a netlink socket.
//!
//! [`Conn`] stamps outgoing requests with length, sequence number and port
//! ID, drains multipart replies, surfaces kernel-embedded error codes and
//! validates reply correlation. It is generic over [`Transport`] so the
//! draining and validation logic runs against a scripted transport in
//! tests; production code uses [`NetlinkSocket`].

use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use super::error::{Error, Result};
use super::message::{Message, NLMSG_HDRLEN, NlMsgError, nlmsg_align};
use super::socket::{NetlinkSocket, Protocol};

/// Hard cap on a single outgoing payload. Bounds one pathological
/// allocation, not a protocol limit.
pub const MAX_PAYLOAD: usize = 32 * 1024;

/// Raw datagram transport under a [`Conn`].
pub trait Transport {
    /// Send one encoded datagram.
    fn send(&self, buf: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Receive one datagram.
    fn recv(&self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Subscribe to a multicast group.
    fn join_group(&mut self, group: u32) -> Result<()>;

    /// Unsubscribe from a multicast group.
    fn leave_group(&mut self, group: u32) -> Result<()>;

    /// Local port ID.
    fn pid(&self) -> u32;
}

impl Transport for NetlinkSocket {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        NetlinkSocket::send(self, buf).await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.recv_msg().await
    }

    fn join_group(&mut self, group: u32) -> Result<()> {
        self.add_membership(group)
    }

    fn leave_group(&mut self, group: u32) -> Result<()> {
        self.drop_membership(group)
    }

    fn pid(&self) -> u32 {
        NetlinkSocket::pid(self)
    }
}

/// A netlink connection: one socket, one sequence counter, one multicast
/// flag.
///
/// Once any multicast group is joined the connection is receive-only;
/// [`query`](Conn::query) fails fast from then on. Closing happens on
/// drop; pending receives on other tasks return an error at that point.
pub struct Conn<T: Transport = NetlinkSocket> {
    transport: T,
    /// Sequence number counter, connection-scoped.
    seq: AtomicU32,
    /// Set once by joining a group, read by every query.
    multicast: RwLock<bool>,
}

impl Conn<NetlinkSocket> {
    /// Dial a new connection for the given protocol.
    pub fn new(protocol: Protocol) -> Result<Self> {
        Ok(Self::from_transport(NetlinkSocket::new(protocol)?))
    }
}

impl<T: Transport> Conn<T> {
    /// Wrap an existing transport.
    pub fn from_transport(transport: T) -> Self {
        Self {
            transport,
            seq: AtomicU32::new(1),
            multicast: RwLock::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the next sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Local port ID.
    pub fn pid(&self) -> u32 {
        self.transport.pid()
    }

    /// Whether this connection has joined any multicast group.
    pub fn is_multicast(&self) -> bool {
        *self.multicast.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Join multicast groups, flipping the connection to receive-only for
    /// the rest of its lifetime.
    pub fn join_groups(&mut self, groups: &[u32]) -> Result<()> {
        {
            let mut flag = self.multicast.write().unwrap_or_else(|e| e.into_inner());
            *flag = true;
        }
        for &group in groups {
            self.transport.join_group(group)?;
        }
        Ok(())
    }

    /// Leave multicast groups. The connection stays receive-only.
    pub fn leave_groups(&mut self, groups: &[u32]) -> Result<()> {
        for &group in groups {
            self.transport.leave_group(group)?;
        }
        Ok(())
    }

    /// Stamp and send a request, returning the stamped copy so replies can
    /// be validated against it.
    ///
    /// Zero fields are filled in: length from the payload (4-byte
    /// aligned), sequence from the connection counter, port ID from the
    /// socket. Payloads over [`MAX_PAYLOAD`] are rejected.
    pub async fn send(&self, mut msg: Message) -> Result<Message> {
        if msg.payload.len() > MAX_PAYLOAD {
            return Err(Error::TooLarge {
                size: msg.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        if msg.header.nlmsg_len == 0 {
            msg.header.nlmsg_len = nlmsg_align(NLMSG_HDRLEN + msg.payload.len()) as u32;
        }
        if msg.header.nlmsg_seq == 0 {
            msg.header.nlmsg_seq = self.next_seq();
        }
        if msg.header.nlmsg_pid == 0 {
            msg.header.nlmsg_pid = self.transport.pid();
        }

        let wire = msg.encode();
        trace!(
            len = wire.len(),
            msg_type = msg.header.nlmsg_type,
            seq = msg.header.nlmsg_seq,
            "send"
        );
        self.transport.send(&wire).await?;
        Ok(msg)
    }

    /// Receive a full reply set.
    ///
    /// Keeps reading while the final message of a datagram carries the
    /// multipart flag without being the done sentinel; trailing done
    /// sentinels are trimmed from the result. Any embedded error message
    /// with a non-zero code aborts the whole receive with a kernel error.
    pub async fn receive(&self) -> Result<Vec<Message>> {
        let mut all: Vec<Message> = Vec::new();

        loop {
            let raw = self.transport.recv().await?;
            let msgs = Message::decode_all(&raw)?;
            trace!(count = msgs.len(), bytes = raw.len(), "receive");

            for msg in &msgs {
                if msg.is_error() {
                    let err = NlMsgError::from_bytes(&msg.payload)?;
                    if !err.is_ack() {
                        return Err(Error::from_errno(err.error));
                    }
                }
            }

            let more = msgs
                .last()
                .is_some_and(|last| last.is_multi() && !last.is_done());
            all.extend(msgs);
            if !more {
                break;
            }
        }

        while all.last().is_some_and(|m| m.is_done()) {
            all.pop();
        }

        Ok(all)
    }

    /// Send a request and return its validated reply set.
    pub async fn execute(&self, msg: Message) -> Result<Vec<Message>> {
        let req = self.send(msg).await?;
        let replies = self.receive().await?;
        validate(&req, &replies)?;
        Ok(replies)
    }

    /// [`execute`](Conn::execute), rejected up front on a multicast
    /// connection.
    pub async fn query(&self, msg: Message) -> Result<Vec<Message>> {
        if self.is_multicast() {
            return Err(Error::Multicast);
        }
        self.execute(msg).await
    }
}

/// Check that every reply's sequence and port ID match the request's.
///
/// A single mismatch anywhere in the set means the channel is in an
/// indeterminate state; the caller must not retry on this connection.
pub fn validate(request: &Message, replies: &[Message]) -> Result<()> {
    for reply in replies {
        if reply.header.nlmsg_seq != request.header.nlmsg_seq {
            return Err(Error::SequenceMismatch {
                expected: request.header.nlmsg_seq,
                actual: reply.header.nlmsg_seq,
            });
        }
        if reply.header.nlmsg_pid != request.header.nlmsg_pid {
            return Err(Error::PidMismatch {
                expected: request.header.nlmsg_pid,
                actual: reply.header.nlmsg_pid,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::netlink::message::{
        NLM_F_MULTI, NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgHdr, NlMsgType,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted transport: records sends, replays queued datagrams, and
    /// pends forever once the queue is empty.
    pub(crate) struct FakeTransport {
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub replies: Mutex<VecDeque<Vec<u8>>>,
        pub joined: Mutex<Vec<u32>>,
        pub pid: u32,
    }

    impl FakeTransport {
        pub fn new(pid: u32) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                replies: Mutex::new(VecDeque::new()),
                joined: Mutex::new(Vec::new()),
                pid,
            }
        }

        pub fn queue(&self, datagram: Vec<u8>) {
            self.replies.lock().unwrap().push_back(datagram);
        }
    }

    impl Transport for FakeTransport {
        async fn send(&self, buf: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        async fn recv(&self) -> Result<Vec<u8>> {
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(datagram) => Ok(datagram),
                // Nothing queued: behave like a socket with no traffic.
                None => std::future::pending().await,
            }
        }

        fn join_group(&mut self, group: u32) -> Result<()> {
            self.joined.lock().unwrap().push(group);
            Ok(())
        }

        fn leave_group(&mut self, group: u32) -> Result<()> {
            self.joined.lock().unwrap().retain(|&g| g != group);
            Ok(())
        }

        fn pid(&self) -> u32 {
            self.pid
        }
    }

    pub(crate) fn reply(msg_type: u16, flags: u16, seq: u32, pid: u32, payload: &[u8]) -> Vec<u8> {
        let mut msg = Message::new(msg_type, flags, payload.to_vec());
        msg.header.nlmsg_seq = seq;
        msg.header.nlmsg_pid = pid;
        msg.encode()
    }

    fn done(seq: u32, pid: u32) -> Vec<u8> {
        reply(NlMsgType::DONE, NLM_F_MULTI, seq, pid, &0i32.to_ne_bytes())
    }

    #[tokio::test]
    async fn test_send_stamps_zero_fields() {
        let conn = Conn::from_transport(FakeTransport::new(777));
        let stamped = conn
            .send(Message::new(20, NLM_F_REQUEST, vec![1, 2, 3, 4]))
            .await
            .unwrap();

        assert_eq!(stamped.header.nlmsg_len as usize, NLMSG_HDRLEN + 4);
        assert_eq!(stamped.header.nlmsg_seq, 1);
        assert_eq!(stamped.header.nlmsg_pid, 777);

        // Pre-stamped fields are left alone.
        let mut msg = Message::new(20, NLM_F_REQUEST, Vec::new());
        msg.header.nlmsg_seq = 99;
        let stamped = conn.send(msg).await.unwrap();
        assert_eq!(stamped.header.nlmsg_seq, 99);

        // The counter still advanced once per send.
        let wire = &conn.transport.sent.lock().unwrap()[0];
        let header = NlMsgHdr::from_bytes(wire).unwrap();
        assert_eq!(header.nlmsg_seq, 1);
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_payload() {
        let conn = Conn::from_transport(FakeTransport::new(1));
        let msg = Message::new(20, NLM_F_REQUEST, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(
            conn.send(msg).await,
            Err(Error::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_drains_multipart() {
        let conn = Conn::from_transport(FakeTransport::new(1));

        // Two datagrams: 2 multipart messages, then 1 more plus the
        // sentinel. Receive must keep reading across the boundary.
        let mut first = reply(20, NLM_F_MULTI, 5, 1, &[1, 1, 1, 1]);
        first.extend_from_slice(&reply(20, NLM_F_MULTI, 5, 1, &[2, 2, 2, 2]));
        conn.transport.queue(first);

        let mut second = reply(20, NLM_F_MULTI, 5, 1, &[3, 3, 3, 3]);
        second.extend_from_slice(&done(5, 1));
        conn.transport.queue(second);

        let msgs = conn.receive().await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(msgs.iter().all(|m| !m.is_done()));
        assert_eq!(msgs[2].payload, [3, 3, 3, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_blocks_without_sentinel() {
        let conn = Conn::from_transport(FakeTransport::new(1));
        conn.transport
            .queue(reply(20, NLM_F_MULTI, 5, 1, &[1, 1, 1, 1]));

        // Multipart stream with no terminal sentinel and no more data:
        // receive must stay blocked, not return a short result.
        let res = tokio::time::timeout(Duration::from_millis(50), conn.receive()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_receive_surfaces_embedded_error() {
        let conn = Conn::from_transport(FakeTransport::new(1));

        let mut payload = (-2i32).to_ne_bytes().to_vec(); // ENOENT
        payload.extend_from_slice(NlMsgHdr::new(0, 0).as_bytes());
        conn.transport
            .queue(reply(NlMsgType::ERROR, 0, 5, 1, &payload));

        let err = conn.receive().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_receive_passes_ack() {
        let conn = Conn::from_transport(FakeTransport::new(1));

        let mut payload = 0i32.to_ne_bytes().to_vec();
        payload.extend_from_slice(NlMsgHdr::new(0, 0).as_bytes());
        conn.transport
            .queue(reply(NlMsgType::ERROR, 0, 5, 1, &payload));

        let msgs = conn.receive().await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_error());
    }

    #[test]
    fn test_validate_correlation() {
        let mut req = Message::new(20, NLM_F_REQUEST, Vec::new());
        req.header.nlmsg_seq = 7;
        req.header.nlmsg_pid = 42;

        let ok = Message {
            header: NlMsgHdr {
                nlmsg_seq: 7,
                nlmsg_pid: 42,
                ..Default::default()
            },
            payload: Vec::new(),
        };
        assert!(validate(&req, &[ok.clone(), ok.clone()]).is_ok());

        let mut bad_seq = ok.clone();
        bad_seq.header.nlmsg_seq = 8;
        assert!(matches!(
            validate(&req, &[ok.clone(), bad_seq]),
            Err(Error::SequenceMismatch {
                expected: 7,
                actual: 8
            })
        ));

        let mut bad_pid = ok.clone();
        bad_pid.header.nlmsg_pid = 1;
        assert!(matches!(
            validate(&req, &[bad_pid, ok]),
            Err(Error::PidMismatch {
                expected: 42,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_execute_validates_replies() {
        let conn = Conn::from_transport(FakeTransport::new(42));
        // Reply with the wrong sequence for the stamped request (seq 1).
        conn.transport.queue(reply(20, 0, 9, 42, &[0, 0, 0, 0]));

        let err = conn
            .execute(Message::new(20, NLM_F_REQUEST, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SequenceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_query_rejected_after_join() {
        let mut conn = Conn::from_transport(FakeTransport::new(1));
        conn.join_groups(&[1, 2]).unwrap();
        assert!(conn.is_multicast());
        assert_eq!(*conn.transport.joined.lock().unwrap(), vec![1, 2]);

        let err = conn
            .query(Message::new(20, NLM_F_REQUEST, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Multicast));

        // Leaving the groups does not restore query capability.
        conn.leave_groups(&[1, 2]).unwrap();
        assert!(conn.is_multicast());
    }
}

//! Netlink message header, framing and parsing.

use super::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink message header alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Check if this is an error message.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NlMsgType::ERROR
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NlMsgType::DONE
    }

    /// Check if this message has the multi flag.
    pub fn is_multi(&self) -> bool {
        self.nlmsg_flags & NLM_F_MULTI != 0
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Standard netlink message types.
pub struct NlMsgType;

impl NlMsgType {
    /// No operation, message must be discarded.
    pub const NOOP: u16 = 1;
    /// Error message or ACK.
    pub const ERROR: u16 = 2;
    /// End of multipart message.
    pub const DONE: u16 = 3;
    /// Data lost, request resend.
    pub const OVERRUN: u16 = 4;

    // Traffic control qdisc messages (NETLINK_ROUTE)
    pub const RTM_NEWQDISC: u16 = 36;
    pub const RTM_DELQDISC: u16 = 37;
    pub const RTM_GETQDISC: u16 = 38;
}

/// Netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ECHO: u16 = 0x08;
pub const NLM_F_DUMP_INTR: u16 = 0x10;
pub const NLM_F_DUMP_FILTERED: u16 = 0x20;

// Modifiers to GET request
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_ATOMIC: u16 = 0x400;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Modifiers to NEW request
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

/// An owned netlink message: header plus payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    /// Transport-level header.
    pub header: NlMsgHdr,
    /// Payload bytes (everything after the 16-byte header).
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with the given type, flags and payload.
    ///
    /// The header length is left at zero so the transport stamps it on
    /// send; callers producing wire bytes directly should use [`encode`],
    /// which always writes the real length.
    ///
    /// [`encode`]: Message::encode
    pub fn new(msg_type: u16, flags: u16, payload: Vec<u8>) -> Self {
        let mut header = NlMsgHdr::new(msg_type, flags);
        header.nlmsg_len = 0;
        Self { header, payload }
    }

    /// Total encoded length, 4-byte aligned.
    pub fn encoded_len(&self) -> usize {
        nlmsg_align(NLMSG_HDRLEN + self.payload.len())
    }

    /// Encode the message to wire bytes, patching the header length.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.nlmsg_len = (NLMSG_HDRLEN + self.payload.len()) as u32;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf.resize(nlmsg_align(buf.len()), 0);
        buf
    }

    /// Decode every message in a receive buffer.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Message>> {
        let mut msgs = Vec::new();
        for result in MessageIter::new(data) {
            let (header, payload) = result?;
            msgs.push(Message {
                header: *header,
                payload: payload.to_vec(),
            });
        }
        Ok(msgs)
    }

    /// Check if this is an error message.
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.header.is_done()
    }

    /// Check if this message has the multi flag.
    pub fn is_multi(&self) -> bool {
        self.header.is_multi()
    }
}

/// Iterator over netlink messages in a buffer.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Create a new message iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(&'a NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            return Some(Err(Error::InvalidMessage(format!(
                "invalid message length: {}",
                msg_len
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..msg_len];
        let aligned_len = nlmsg_align(msg_len);

        // Move to next message
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some(Ok((header, payload)))
    }
}

/// Netlink error message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno or 0 for ACK).
    pub error: i32,
    /// Original message header that caused the error.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse error message from payload.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }

    /// Check if this is an ACK (no error).
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_stamps_length() {
        let msg = Message::new(NlMsgType::RTM_GETQDISC, NLM_F_REQUEST, vec![0u8; 5]);
        let wire = msg.encode();
        assert_eq!(wire.len(), nlmsg_align(NLMSG_HDRLEN + 5));

        let header = NlMsgHdr::from_bytes(&wire).unwrap();
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDRLEN + 5);
        assert_eq!(header.nlmsg_type, NlMsgType::RTM_GETQDISC);
    }

    #[test]
    fn test_decode_all_roundtrip() {
        let mut wire = Message::new(20, NLM_F_REQUEST, vec![1, 2, 3, 4]).encode();
        wire.extend_from_slice(&Message::new(21, 0, Vec::new()).encode());

        let msgs = Message::decode_all(&wire).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].header.nlmsg_type, 20);
        assert_eq!(msgs[0].payload, [1, 2, 3, 4]);
        assert_eq!(msgs[1].header.nlmsg_type, 21);
        assert!(msgs[1].payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut wire = Message::new(20, 0, Vec::new()).encode();
        // Shrink the declared length under the header size.
        wire[0] = 4;
        assert!(matches!(
            Message::decode_all(&wire),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_error_payload() {
        let mut payload = (-2i32).to_ne_bytes().to_vec(); // ENOENT
        payload.extend_from_slice(NlMsgHdr::new(0, 0).as_bytes());

        let err = NlMsgError::from_bytes(&payload).unwrap();
        assert!(!err.is_ack());
        assert_eq!(err.error, -2);
    }
}

//! Error types for netlink operations.

use std::io;

/// Result type for netlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during netlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message or attribute was truncated.
    #[error("truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// An attribute carries both the nested and the net-byte-order flag.
    #[error("attribute flags nested and net-byte-order are mutually exclusive")]
    FlagConflict,

    /// Attribute nesting exceeds the decoder's depth bound.
    #[error("attribute nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Outgoing payload exceeds the single-message cap.
    #[error("message payload of {size} bytes exceeds the {max}-byte cap")]
    TooLarge {
        /// Payload size.
        size: usize,
        /// Hard cap.
        max: usize,
    },

    /// Reply sequence number does not match the request.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Expected sequence number.
        expected: u32,
        /// Actual sequence number received.
        actual: u32,
    },

    /// Reply port ID does not match the request.
    #[error("pid mismatch: expected {expected}, got {actual}")]
    PidMismatch {
        /// Expected port ID.
        expected: u32,
        /// Actual port ID received.
        actual: u32,
    },

    /// Queries are rejected once a connection joined a multicast group.
    #[error("connection is receive-only after joining multicast groups")]
    Multicast,

    /// Listen was already called on this connection.
    #[error("connection already has event listeners attached")]
    AlreadyListening,

    /// A multicast event unexpectedly spanned multiple netlink messages.
    #[error("multicast event spans multiple netlink messages")]
    MultipartEvent,

    /// Decoding protocol info into a flow that already carries some.
    #[error("flow already carries protocol info")]
    ReusedProtoInfo,

    /// IP tuple addresses do not share one address family.
    #[error("tuple source and destination must share one address family")]
    BadIpTuple,

    /// Flow creation requires a timeout.
    #[error("creating a flow requires a timeout")]
    NeedTimeout,

    /// The operation requires at least one filled tuple.
    #[error("operation requires a filled tuple")]
    NeedTuple,

    /// Flow updates must not carry a master tuple.
    #[error("updating a flow must not carry a master tuple")]
    UpdateMaster,

    /// Expectation creation requires tuple, mask and master all filled.
    #[error("creating an expectation requires tuple, mask and master tuples")]
    ExpectNeedTuples,

    /// An event message carried an unrecognized subsystem or type.
    #[error("unknown event type {0}")]
    UnknownEventType(u16),
}

impl Error {
    /// Create a kernel error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kernel { errno, .. } if matches!(*errno, 2 | 19))
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Kernel { errno, .. } if matches!(*errno, 1 | 13))
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kernel { errno, .. } if *errno == 17)
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno() {
        let err = Error::from_errno(-1); // EPERM
        assert!(err.is_permission_denied());
        assert_eq!(err.errno(), Some(1));
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::from_errno(-2).is_not_found()); // ENOENT
        assert!(Error::from_errno(-19).is_not_found()); // ENODEV
        assert!(!Error::from_errno(-17).is_not_found());
        assert!(Error::from_errno(-17).is_already_exists());
    }

    #[test]
    fn test_sentinels_are_distinguishable() {
        assert!(matches!(Error::Multicast, Error::Multicast));
        assert!(Error::Multicast.errno().is_none());
        let msg = Error::SequenceMismatch {
            expected: 7,
            actual: 9,
        }
        .to_string();
        assert!(msg.contains("expected 7"));
    }
}

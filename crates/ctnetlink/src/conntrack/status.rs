//! Connection tracking status bitmask.

/// Status bits (ip_conntrack_status).
pub const EXPECTED: u32 = 1;
pub const SEEN_REPLY: u32 = 1 << 1;
pub const ASSURED: u32 = 1 << 2;
pub const CONFIRMED: u32 = 1 << 3;
pub const SRC_NAT: u32 = 1 << 4;
pub const DST_NAT: u32 = 1 << 5;
pub const SEQ_ADJUST: u32 = 1 << 6;
pub const SRC_NAT_DONE: u32 = 1 << 7;
pub const DST_NAT_DONE: u32 = 1 << 8;
pub const DYING: u32 = 1 << 9;
pub const FIXED_TIMEOUT: u32 = 1 << 10;
pub const TEMPLATE: u32 = 1 << 11;
pub const UNTRACKED: u32 = 1 << 12;
pub const HELPER: u32 = 1 << 13;
pub const OFFLOAD: u32 = 1 << 14;

/// A flow's status flags.
///
/// The predicates are pure reads over the raw bitmask; the mask itself
/// stays accessible for callers that need bits this type does not name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Status {
    /// Raw kernel bitmask.
    pub value: u32,
}

impl Status {
    /// Wrap a raw bitmask.
    pub fn new(value: u32) -> Self {
        Self { value }
    }

    /// The flow is expected (created by a helper based on another flow).
    pub fn expected(&self) -> bool {
        self.value & EXPECTED != 0
    }

    /// Packets were seen in both directions.
    pub fn seen_reply(&self) -> bool {
        self.value & SEEN_REPLY != 0
    }

    /// The flow will not be evicted early.
    pub fn assured(&self) -> bool {
        self.value & ASSURED != 0
    }

    /// The flow is confirmed (its original packet left the box).
    pub fn confirmed(&self) -> bool {
        self.value & CONFIRMED != 0
    }

    /// Source NAT is applied.
    pub fn src_nat(&self) -> bool {
        self.value & SRC_NAT != 0
    }

    /// Destination NAT is applied.
    pub fn dst_nat(&self) -> bool {
        self.value & DST_NAT != 0
    }

    /// Sequence numbers are adjusted.
    pub fn seq_adjust(&self) -> bool {
        self.value & SEQ_ADJUST != 0
    }

    /// Source NAT initialization is complete.
    pub fn src_nat_done(&self) -> bool {
        self.value & SRC_NAT_DONE != 0
    }

    /// Destination NAT initialization is complete.
    pub fn dst_nat_done(&self) -> bool {
        self.value & DST_NAT_DONE != 0
    }

    /// The flow is being removed.
    pub fn dying(&self) -> bool {
        self.value & DYING != 0
    }

    /// The timeout does not reset on packets.
    pub fn fixed_timeout(&self) -> bool {
        self.value & FIXED_TIMEOUT != 0
    }

    /// This is a conntrack template, not a tracked connection.
    pub fn template(&self) -> bool {
        self.value & TEMPLATE != 0
    }

    /// The flow carries a helper.
    pub fn helper(&self) -> bool {
        self.value & HELPER != 0
    }

    /// The flow is handled by hardware offload.
    pub fn offload(&self) -> bool {
        self.value & OFFLOAD != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let status = Status::new(EXPECTED | ASSURED | DYING);
        assert!(status.expected());
        assert!(status.assured());
        assert!(status.dying());
        assert!(!status.confirmed());
        assert!(!status.seen_reply());
        assert!(!status.offload());
    }

    #[test]
    fn test_default_is_empty() {
        let status = Status::default();
        assert_eq!(status.value, 0);
        assert!(!status.confirmed());
    }
}

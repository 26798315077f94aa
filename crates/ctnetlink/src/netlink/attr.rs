//! Netlink attribute (nlattr) handling.
//!
//! Two layers live here. The wire layer ([`NlAttr`], [`AttrIter`], [`get`])
//! works on borrowed buffers and is what flat, read-only walks use. The
//! owned layer ([`Attribute`]) is a recursive tree with full marshal and
//! unmarshal support, used wherever attributes are built or rewritten.

use super::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4; // nla_align(size_of::<NlAttr>())

/// Maximum nesting depth the decoder will follow. The wire format has no
/// limit of its own; a deeper tree fails cleanly instead of exhausting the
/// call stack.
pub const NLA_MAX_DEPTH: usize = 16;

/// Netlink attribute header (mirrors struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Check if this is a nested attribute.
    pub fn is_nested(&self) -> bool {
        self.nla_type & NLA_F_NESTED != 0
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nla_len as usize).saturating_sub(NLA_HDRLEN)
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::read_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Iterator over netlink attributes in a buffer.
///
/// Yields `(type-with-flags-stripped, payload)` pairs and stops at the
/// first malformed entry. Use [`Attribute::unmarshal`] when flags, nesting
/// or error reporting matter.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Check if there are no more attributes.
    pub fn is_empty(&self) -> bool {
        self.data.len() < NLA_HDRLEN
    }
}

impl<'a> Iterator for AttrIter<'a> {
    /// Returns (attribute type, payload data).
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let attr = match NlAttr::from_bytes(self.data) {
            Ok(a) => a,
            Err(_) => return None,
        };

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned_len = nla_align(len);

        // Move to next attribute
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some((attr.kind(), payload))
    }
}

/// An owned netlink attribute, possibly carrying a nested sub-tree.
///
/// When `nested` is set, `data` is empty and `children` holds the decoded
/// sub-tree; otherwise `children` is empty. `nested` and `net_byte_order`
/// occupy the two high bits of the wire type field and are mutually
/// exclusive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Attribute {
    /// Attribute type (14-bit, without flag bits).
    pub attr_type: u16,
    /// Payload carries a nested attribute tree.
    pub nested: bool,
    /// Payload is flagged as network byte order on the wire.
    pub net_byte_order: bool,
    /// Raw payload (empty for nested attributes).
    pub data: Vec<u8>,
    /// Decoded sub-tree (empty for non-nested attributes).
    pub children: Vec<Attribute>,
}

impl Attribute {
    /// Create a plain attribute with raw payload.
    pub fn new(attr_type: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            attr_type,
            data: data.into(),
            ..Default::default()
        }
    }

    /// Create a nested attribute from its children.
    pub fn nest(attr_type: u16, children: Vec<Attribute>) -> Self {
        Self {
            attr_type,
            nested: true,
            children,
            ..Default::default()
        }
    }

    /// Create an attribute holding a big-endian u8.
    pub fn from_u8(attr_type: u16, value: u8) -> Self {
        Self::new(attr_type, vec![value])
    }

    /// Create an attribute holding a big-endian u16.
    pub fn from_u16(attr_type: u16, value: u16) -> Self {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    /// Create an attribute holding a big-endian u32.
    pub fn from_u32(attr_type: u16, value: u32) -> Self {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    /// Create an attribute holding a big-endian u64.
    pub fn from_u64(attr_type: u16, value: u64) -> Self {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    /// Create an attribute holding a NUL-terminated string.
    pub fn from_str_nul(attr_type: u16, value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self::new(attr_type, data)
    }

    /// Read the payload as a big-endian u16.
    ///
    /// # Panics
    ///
    /// Panics on a nested attribute or a payload that is not exactly 2
    /// bytes. Both indicate a bug in the calling code, not bad input.
    pub fn u16(&self) -> u16 {
        assert!(!self.nested, "u16 read on nested attribute");
        assert_eq!(self.data.len(), 2, "u16 read on {}-byte payload", self.data.len());
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    /// Read the payload as a big-endian u32.
    ///
    /// # Panics
    ///
    /// Panics on a nested attribute or a payload that is not exactly 4
    /// bytes.
    pub fn u32(&self) -> u32 {
        assert!(!self.nested, "u32 read on nested attribute");
        assert_eq!(self.data.len(), 4, "u32 read on {}-byte payload", self.data.len());
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Read the payload as a big-endian u64.
    ///
    /// # Panics
    ///
    /// Panics on a nested attribute or a payload that is not exactly 8
    /// bytes.
    pub fn u64(&self) -> u64 {
        assert!(!self.nested, "u64 read on nested attribute");
        assert_eq!(self.data.len(), 8, "u64 read on {}-byte payload", self.data.len());
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data);
        u64::from_be_bytes(b)
    }

    /// Set the payload to a big-endian u16.
    ///
    /// # Panics
    ///
    /// Panics on a nested attribute.
    pub fn put_u16(&mut self, value: u16) {
        assert!(!self.nested, "u16 write on nested attribute");
        self.data = value.to_be_bytes().to_vec();
    }

    /// Set the payload to a big-endian u32.
    ///
    /// # Panics
    ///
    /// Panics on a nested attribute.
    pub fn put_u32(&mut self, value: u32) {
        assert!(!self.nested, "u32 write on nested attribute");
        self.data = value.to_be_bytes().to_vec();
    }

    /// Set the payload to a big-endian u64.
    ///
    /// # Panics
    ///
    /// Panics on a nested attribute.
    pub fn put_u64(&mut self, value: u64) {
        assert!(!self.nested, "u64 write on nested attribute");
        self.data = value.to_be_bytes().to_vec();
    }

    /// Read the payload as a NUL-terminated string.
    pub fn string(&self) -> Result<&str> {
        get::string(&self.data)
    }

    /// Find the first child with the given type.
    pub fn child(&self, attr_type: u16) -> Option<&Attribute> {
        self.children.iter().find(|a| a.attr_type == attr_type)
    }

    /// Encode a sequence of attributes to wire format.
    ///
    /// Lengths are computed as header plus payload; every attribute is
    /// padded to the 4-byte boundary with zero bytes that are not counted
    /// in its length field.
    pub fn marshal(attrs: &[Attribute]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        Self::marshal_into(attrs, &mut buf, 0)?;
        Ok(buf)
    }

    fn marshal_into(attrs: &[Attribute], buf: &mut Vec<u8>, depth: usize) -> Result<()> {
        if depth >= NLA_MAX_DEPTH {
            return Err(Error::NestingTooDeep(NLA_MAX_DEPTH));
        }

        for attr in attrs {
            if attr.nested && attr.net_byte_order {
                return Err(Error::FlagConflict);
            }

            let mut wire_type = attr.attr_type & NLA_TYPE_MASK;
            if attr.nested {
                wire_type |= NLA_F_NESTED;
            }
            if attr.net_byte_order {
                wire_type |= NLA_F_NET_BYTEORDER;
            }

            let header_at = buf.len();
            buf.extend_from_slice(NlAttr::new(wire_type, 0).as_bytes());

            if attr.nested {
                Self::marshal_into(&attr.children, buf, depth + 1)?;
            } else {
                buf.extend_from_slice(&attr.data);
            }

            // Patch the length, then pad. Padding is excluded from nla_len.
            let len = (buf.len() - header_at) as u16;
            buf[header_at..header_at + 2].copy_from_slice(&len.to_ne_bytes());
            buf.resize(nla_align(buf.len()), 0);
        }

        Ok(())
    }

    /// Decode a wire buffer into a sequence of attributes.
    ///
    /// Entries with the nested flag set recurse into their payload; a
    /// declared length past the end of the buffer or under the header size
    /// fails with [`Error::Truncated`]. A zero-length payload is a valid
    /// marker attribute.
    pub fn unmarshal(data: &[u8]) -> Result<Vec<Attribute>> {
        Self::unmarshal_at(data, 0)
    }

    fn unmarshal_at(mut data: &[u8], depth: usize) -> Result<Vec<Attribute>> {
        if depth >= NLA_MAX_DEPTH {
            return Err(Error::NestingTooDeep(NLA_MAX_DEPTH));
        }

        let mut attrs = Vec::new();

        while !data.is_empty() {
            let header = NlAttr::from_bytes(data)?;
            let len = header.nla_len as usize;
            if len < NLA_HDRLEN || len > data.len() {
                return Err(Error::Truncated {
                    expected: len.max(NLA_HDRLEN),
                    actual: data.len(),
                });
            }

            let nested = header.nla_type & NLA_F_NESTED != 0;
            let net_byte_order = header.nla_type & NLA_F_NET_BYTEORDER != 0;
            if nested && net_byte_order {
                return Err(Error::FlagConflict);
            }

            let payload = &data[NLA_HDRLEN..len];
            let mut attr = Attribute {
                attr_type: header.kind(),
                nested,
                net_byte_order,
                ..Default::default()
            };
            if nested {
                attr.children = Self::unmarshal_at(payload, depth + 1)?;
            } else {
                attr.data = payload.to_vec();
            }
            attrs.push(attr);

            let aligned = nla_align(len);
            if aligned >= data.len() {
                data = &[];
            } else {
                data = &data[aligned..];
            }
        }

        Ok(attrs)
    }
}

/// Helper functions for extracting typed values from attribute payloads.
pub mod get {
    use super::*;

    /// Extract a u8 value.
    pub fn u8(data: &[u8]) -> Result<u8> {
        if data.is_empty() {
            return Err(Error::InvalidAttribute("empty u8 attribute".into()));
        }
        Ok(data[0])
    }

    /// Extract a u16 value (native endian).
    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_ne_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (native endian).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a u64 value (native endian).
    pub fn u64_ne(data: &[u8]) -> Result<u64> {
        if data.len() < 8 {
            return Err(Error::InvalidAttribute("truncated u64 attribute".into()));
        }
        Ok(u64::from_ne_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]))
    }

    /// Extract a u16 value (big endian / network order).
    pub fn u16_be(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (big endian / network order).
    pub fn u32_be(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a null-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {}", e)))
    }
}

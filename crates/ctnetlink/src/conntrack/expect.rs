//! Expect: a kernel expectation for a related connection.

use crate::netlink::attr::{Attribute, get};
use crate::netlink::error::{Error, Result};

use super::tuple::Tuple;

// Expectation attributes (CTA_EXPECT_*)
pub const CTA_EXPECT_MASTER: u16 = 1;
pub const CTA_EXPECT_TUPLE: u16 = 2;
pub const CTA_EXPECT_MASK: u16 = 3;
pub const CTA_EXPECT_TIMEOUT: u16 = 4;
pub const CTA_EXPECT_ID: u16 = 5;
pub const CTA_EXPECT_HELP_NAME: u16 = 6;
pub const CTA_EXPECT_ZONE: u16 = 7;
pub const CTA_EXPECT_FLAGS: u16 = 8;
pub const CTA_EXPECT_CLASS: u16 = 9;
pub const CTA_EXPECT_NAT: u16 = 10;
pub const CTA_EXPECT_FN: u16 = 11;

// Children of CTA_EXPECT_NAT
pub const CTA_EXPECT_NAT_DIR: u16 = 1;
pub const CTA_EXPECT_NAT_TUPLE: u16 = 2;

/// NAT information attached to an expectation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExpectNat {
    /// True when NAT applies in the reply direction.
    pub direction: bool,
    /// The translated tuple.
    pub tuple: Tuple,
}

impl ExpectNat {
    fn marshal(&self, attr_type: u16) -> Result<Attribute> {
        Ok(Attribute::nest(
            attr_type,
            vec![
                Attribute::from_u32(CTA_EXPECT_NAT_DIR, self.direction as u32),
                self.tuple.marshal(CTA_EXPECT_NAT_TUPLE)?,
            ],
        ))
    }

    fn unmarshal(attr: &Attribute) -> Result<ExpectNat> {
        if !attr.nested {
            return Err(Error::InvalidAttribute(
                "expect NAT attribute is not nested".into(),
            ));
        }
        let mut nat = ExpectNat::default();
        for child in &attr.children {
            match child.attr_type {
                CTA_EXPECT_NAT_DIR => nat.direction = get::u32_be(&child.data)? != 0,
                CTA_EXPECT_NAT_TUPLE => nat.tuple = Tuple::unmarshal(child)?,
                _ => {}
            }
        }
        Ok(nat)
    }
}

/// An expectation: the kernel will mark a future connection matching
/// `tuple`/`mask` as related to the `tuple_master` flow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Expect {
    /// Kernel expectation id.
    pub id: u32,
    /// Lifetime in seconds.
    pub timeout: u32,
    /// Tuple of the flow that created the expectation.
    pub tuple_master: Tuple,
    /// Tuple the expected connection must match.
    pub tuple: Tuple,
    /// Mask applied to the expected tuple before matching.
    pub mask: Tuple,
    /// Conntrack zone.
    pub zone: u16,
    /// Expectation flags (NF_CT_EXPECT_*).
    pub flags: u32,
    /// Expectation class.
    pub class: u32,
    /// Name of the helper that will attach to the expected flow.
    pub helper_name: Option<String>,
    /// Expectation function name.
    pub function: Option<String>,
    /// NAT to apply to the expected flow.
    pub nat: Option<ExpectNat>,
}

impl Expect {
    /// Encode the expectation for a creation request.
    ///
    /// The kernel requires the expected tuple, the mask, and the master
    /// tuple.
    pub fn marshal(&self) -> Result<Vec<Attribute>> {
        if !self.tuple.filled() || !self.mask.filled() || !self.tuple_master.filled() {
            return Err(Error::ExpectNeedTuples);
        }

        let mut attrs = vec![
            self.tuple_master.marshal(CTA_EXPECT_MASTER)?,
            self.tuple.marshal(CTA_EXPECT_TUPLE)?,
            self.mask.marshal(CTA_EXPECT_MASK)?,
        ];

        if self.timeout != 0 {
            attrs.push(Attribute::from_u32(CTA_EXPECT_TIMEOUT, self.timeout));
        }
        if self.zone != 0 {
            attrs.push(Attribute::from_u16(CTA_EXPECT_ZONE, self.zone));
        }
        if self.flags != 0 {
            attrs.push(Attribute::from_u32(CTA_EXPECT_FLAGS, self.flags));
        }
        if self.class != 0 {
            attrs.push(Attribute::from_u32(CTA_EXPECT_CLASS, self.class));
        }
        if let Some(name) = &self.helper_name {
            attrs.push(Attribute::from_str_nul(CTA_EXPECT_HELP_NAME, name));
        }
        if let Some(function) = &self.function {
            attrs.push(Attribute::from_str_nul(CTA_EXPECT_FN, function));
        }
        if let Some(nat) = &self.nat {
            attrs.push(nat.marshal(CTA_EXPECT_NAT)?);
        }

        Ok(attrs)
    }

    /// Decode an expectation from a reply's attribute tree.
    pub fn unmarshal(attrs: &[Attribute]) -> Result<Expect> {
        let mut expect = Expect::default();

        for attr in attrs {
            match attr.attr_type {
                CTA_EXPECT_MASTER => expect.tuple_master = Tuple::unmarshal(attr)?,
                CTA_EXPECT_TUPLE => expect.tuple = Tuple::unmarshal(attr)?,
                CTA_EXPECT_MASK => expect.mask = Tuple::unmarshal(attr)?,
                CTA_EXPECT_TIMEOUT => expect.timeout = get::u32_be(&attr.data)?,
                CTA_EXPECT_ID => expect.id = get::u32_be(&attr.data)?,
                CTA_EXPECT_ZONE => expect.zone = get::u16_be(&attr.data)?,
                CTA_EXPECT_FLAGS => expect.flags = get::u32_be(&attr.data)?,
                CTA_EXPECT_CLASS => expect.class = get::u32_be(&attr.data)?,
                CTA_EXPECT_HELP_NAME => {
                    expect.helper_name = Some(get::string(&attr.data)?.to_string())
                }
                CTA_EXPECT_FN => expect.function = Some(get::string(&attr.data)?.to_string()),
                CTA_EXPECT_NAT => expect.nat = Some(ExpectNat::unmarshal(attr)?),
                _ => {}
            }
        }

        Ok(expect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::tuple::{IpTuple, ProtoTuple};

    fn tuple(src: &str, src_port: u16, dst: &str, dst_port: u16) -> Tuple {
        Tuple {
            ip: IpTuple {
                src: Some(src.parse().unwrap()),
                dst: Some(dst.parse().unwrap()),
            },
            proto: ProtoTuple {
                protocol: libc::IPPROTO_TCP as u8,
                src_port,
                dst_port,
                ..Default::default()
            },
            zone: 0,
        }
    }

    #[test]
    fn test_roundtrip() {
        let expect = Expect {
            timeout: 300,
            tuple_master: tuple("10.0.0.1", 21, "10.0.0.2", 41000),
            tuple: tuple("10.0.0.2", 0, "10.0.0.1", 20),
            mask: tuple("255.255.255.255", 0, "255.255.255.255", 65535),
            helper_name: Some("ftp".to_string()),
            ..Default::default()
        };

        let attrs = expect.marshal().unwrap();
        let decoded = Expect::unmarshal(&attrs).unwrap();
        assert_eq!(decoded.tuple_master, expect.tuple_master);
        assert_eq!(decoded.tuple, expect.tuple);
        assert_eq!(decoded.mask, expect.mask);
        assert_eq!(decoded.timeout, 300);
        assert_eq!(decoded.helper_name.as_deref(), Some("ftp"));
    }

    #[test]
    fn test_marshal_requires_three_tuples() {
        let expect = Expect {
            timeout: 300,
            tuple: tuple("10.0.0.2", 0, "10.0.0.1", 20),
            mask: tuple("255.255.255.255", 0, "255.255.255.255", 65535),
            ..Default::default()
        };
        assert!(matches!(expect.marshal(), Err(Error::ExpectNeedTuples)));
    }

    #[test]
    fn test_nat_roundtrip() {
        let nat = ExpectNat {
            direction: true,
            tuple: tuple("192.168.0.1", 20, "10.0.0.1", 20),
        };
        let attr = nat.marshal(CTA_EXPECT_NAT).unwrap();
        let decoded = ExpectNat::unmarshal(&attr).unwrap();
        assert_eq!(decoded, nat);
    }

    #[test]
    fn test_nat_requires_nesting() {
        let attr = Attribute::from_u32(CTA_EXPECT_NAT, 1);
        assert!(matches!(
            ExpectNat::unmarshal(&attr),
            Err(Error::InvalidAttribute(_))
        ));
    }
}

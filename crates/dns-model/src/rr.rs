//! Record types, classes, response codes, and record sets.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::name::DomainName;

/// Record types used by resource records and queries.
///
/// The meta types (`OPT`, the transfer types, and `ANY`) only make
/// sense inside the protocol machinery; a stub resolver refuses to
/// query for them directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    OPT,
    TKEY,
    TSIG,
    IXFR,
    AXFR,
    MAILB,
    MAILA,
    ANY,
    Unknown(RecordTypeUnknown),
}

/// A struct with a private constructor, to ensure invalid
/// `RecordType`s cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordTypeUnknown(u16);

impl RecordType {
    pub fn is_unknown(&self) -> bool {
        matches!(self, RecordType::Unknown(_))
    }

    /// True for types which describe queries or protocol extensions
    /// rather than data that can be the answer to a question.
    pub fn is_metatype(&self) -> bool {
        matches!(
            self,
            RecordType::OPT
                | RecordType::TKEY
                | RecordType::TSIG
                | RecordType::IXFR
                | RecordType::AXFR
                | RecordType::MAILB
                | RecordType::MAILA
                | RecordType::ANY
        )
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::MX => write!(f, "MX"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::OPT => write!(f, "OPT"),
            RecordType::TKEY => write!(f, "TKEY"),
            RecordType::TSIG => write!(f, "TSIG"),
            RecordType::IXFR => write!(f, "IXFR"),
            RecordType::AXFR => write!(f, "AXFR"),
            RecordType::MAILB => write!(f, "MAILB"),
            RecordType::MAILA => write!(f, "MAILA"),
            RecordType::ANY => write!(f, "ANY"),
            RecordType::Unknown(RecordTypeUnknown(n)) => write!(f, "TYPE{n}"),
        }
    }
}

impl FromStr for RecordType {
    type Err = RecordTypeFromStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::NS),
            "CNAME" => Ok(RecordType::CNAME),
            "SOA" => Ok(RecordType::SOA),
            "PTR" => Ok(RecordType::PTR),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "AAAA" => Ok(RecordType::AAAA),
            "SRV" => Ok(RecordType::SRV),
            "OPT" => Ok(RecordType::OPT),
            "TKEY" => Ok(RecordType::TKEY),
            "TSIG" => Ok(RecordType::TSIG),
            "IXFR" => Ok(RecordType::IXFR),
            "AXFR" => Ok(RecordType::AXFR),
            "MAILB" => Ok(RecordType::MAILB),
            "MAILA" => Ok(RecordType::MAILA),
            "ANY" => Ok(RecordType::ANY),
            _ => {
                if let Some(number) = s.strip_prefix("TYPE") {
                    if let Ok(value) = u16::from_str(number) {
                        return Ok(RecordType::from(value));
                    }
                }
                Err(RecordTypeFromStr::NoParse)
            }
        }
    }
}

/// Errors that can arise when converting a `&str` into a `RecordType`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecordTypeFromStr {
    NoParse,
}

impl fmt::Display for RecordTypeFromStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not parse string to record type")
    }
}

impl std::error::Error for RecordTypeFromStr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            12 => RecordType::PTR,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            41 => RecordType::OPT,
            249 => RecordType::TKEY,
            250 => RecordType::TSIG,
            251 => RecordType::IXFR,
            252 => RecordType::AXFR,
            253 => RecordType::MAILB,
            254 => RecordType::MAILA,
            255 => RecordType::ANY,
            _ => RecordType::Unknown(RecordTypeUnknown(value)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::PTR => 12,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::OPT => 41,
            RecordType::TKEY => 249,
            RecordType::TSIG => 250,
            RecordType::IXFR => 251,
            RecordType::AXFR => 252,
            RecordType::MAILB => 253,
            RecordType::MAILA => 254,
            RecordType::ANY => 255,
            RecordType::Unknown(RecordTypeUnknown(value)) => value,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordType {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Record classes used by resource records and queries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordClass {
    IN,
    CH,
    HS,
    NONE,
    ANY,
    Unknown(RecordClassUnknown),
}

/// A struct with a private constructor, to ensure invalid
/// `RecordClass`es cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordClassUnknown(u16);

impl RecordClass {
    pub fn is_unknown(&self) -> bool {
        matches!(self, RecordClass::Unknown(_))
    }

    /// True for classes which only make sense in queries or updates.
    pub fn is_metaclass(&self) -> bool {
        matches!(self, RecordClass::NONE | RecordClass::ANY)
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
            RecordClass::CH => write!(f, "CH"),
            RecordClass::HS => write!(f, "HS"),
            RecordClass::NONE => write!(f, "NONE"),
            RecordClass::ANY => write!(f, "ANY"),
            RecordClass::Unknown(RecordClassUnknown(n)) => write!(f, "CLASS{n}"),
        }
    }
}

impl FromStr for RecordClass {
    type Err = RecordClassFromStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(RecordClass::IN),
            "CH" => Ok(RecordClass::CH),
            "HS" => Ok(RecordClass::HS),
            "NONE" => Ok(RecordClass::NONE),
            "ANY" => Ok(RecordClass::ANY),
            _ => {
                if let Some(number) = s.strip_prefix("CLASS") {
                    if let Ok(value) = u16::from_str(number) {
                        return Ok(RecordClass::from(value));
                    }
                }
                Err(RecordClassFromStr::NoParse)
            }
        }
    }
}

/// Errors that can arise when converting a `&str` into a `RecordClass`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecordClassFromStr {
    NoParse,
}

impl fmt::Display for RecordClassFromStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not parse string to record class")
    }
}

impl std::error::Error for RecordClassFromStr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::IN,
            3 => RecordClass::CH,
            4 => RecordClass::HS,
            254 => RecordClass::NONE,
            255 => RecordClass::ANY,
            _ => RecordClass::Unknown(RecordClassUnknown(value)),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
            RecordClass::CH => 3,
            RecordClass::HS => 4,
            RecordClass::NONE => 254,
            RecordClass::ANY => 255,
            RecordClass::Unknown(RecordClassUnknown(value)) => value,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordClass {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// What sort of query this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Opcode {
    Standard,
    Inverse,
    Status,
    Reserved(OpcodeReserved),
}

/// A struct with a private constructor, to ensure invalid `Opcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpcodeReserved(u8);

impl From<u8> for Opcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Opcode::Standard,
            1 => Opcode::Inverse,
            2 => Opcode::Status,
            other => Opcode::Reserved(OpcodeReserved(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Standard => 0,
            Opcode::Inverse => 1,
            Opcode::Status => 2,
            Opcode::Reserved(OpcodeReserved(octet)) => octet,
        }
    }
}

/// What sort of response this is.  Values above 15 can only be carried
/// in an EDNS OPT record (the extended rcode).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    YxDomain,
    YxRrset,
    NxRrset,
    NotAuth,
    NotZone,
    Unknown(RcodeUnknown),
}

/// A struct with a private constructor, to ensure invalid `Rcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RcodeUnknown(u16);

impl From<u16> for Rcode {
    fn from(value: u16) -> Self {
        match value {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            6 => Rcode::YxDomain,
            7 => Rcode::YxRrset,
            8 => Rcode::NxRrset,
            9 => Rcode::NotAuth,
            10 => Rcode::NotZone,
            _ => Rcode::Unknown(RcodeUnknown(value)),
        }
    }
}

impl From<Rcode> for u16 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::YxDomain => 6,
            Rcode::YxRrset => 7,
            Rcode::NxRrset => 8,
            Rcode::NotAuth => 9,
            Rcode::NotZone => 10,
            Rcode::Unknown(RcodeUnknown(value)) => value,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::FormErr => write!(f, "FORMERR"),
            Rcode::ServFail => write!(f, "SERVFAIL"),
            Rcode::NxDomain => write!(f, "NXDOMAIN"),
            Rcode::NotImp => write!(f, "NOTIMP"),
            Rcode::Refused => write!(f, "REFUSED"),
            Rcode::YxDomain => write!(f, "YXDOMAIN"),
            Rcode::YxRrset => write!(f, "YXRRSET"),
            Rcode::NxRrset => write!(f, "NXRRSET"),
            Rcode::NotAuth => write!(f, "NOTAUTH"),
            Rcode::NotZone => write!(f, "NOTZONE"),
            Rcode::Unknown(RcodeUnknown(n)) => write!(f, "RCODE{n}"),
        }
    }
}

/// A record's type together with its deserialised data.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rdata {
    A {
        address: Ipv4Addr,
    },
    NS {
        nsdname: DomainName,
    },
    CNAME {
        cname: DomainName,
    },
    SOA {
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    PTR {
        ptrdname: DomainName,
    },
    MX {
        preference: u16,
        exchange: DomainName,
    },
    TXT {
        octets: Vec<u8>,
    },
    AAAA {
        address: Ipv6Addr,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    },
    Unknown {
        tag: RecordTypeUnknown,
        octets: Vec<u8>,
    },
}

impl Rdata {
    pub fn rtype(&self) -> RecordType {
        match self {
            Rdata::A { .. } => RecordType::A,
            Rdata::NS { .. } => RecordType::NS,
            Rdata::CNAME { .. } => RecordType::CNAME,
            Rdata::SOA { .. } => RecordType::SOA,
            Rdata::PTR { .. } => RecordType::PTR,
            Rdata::MX { .. } => RecordType::MX,
            Rdata::TXT { .. } => RecordType::TXT,
            Rdata::AAAA { .. } => RecordType::AAAA,
            Rdata::SRV { .. } => RecordType::SRV,
            Rdata::Unknown { tag, .. } => RecordType::Unknown(*tag),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Rdata {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let rdata = match u.int_in_range(0..=8)? {
            0 => Rdata::A {
                address: Ipv4Addr::from(u.arbitrary::<u32>()?),
            },
            1 => Rdata::NS {
                nsdname: u.arbitrary()?,
            },
            2 => Rdata::CNAME {
                cname: u.arbitrary()?,
            },
            3 => Rdata::SOA {
                mname: u.arbitrary()?,
                rname: u.arbitrary()?,
                serial: u.arbitrary()?,
                refresh: u.arbitrary()?,
                retry: u.arbitrary()?,
                expire: u.arbitrary()?,
                minimum: u.arbitrary()?,
            },
            4 => Rdata::PTR {
                ptrdname: u.arbitrary()?,
            },
            5 => Rdata::MX {
                preference: u.arbitrary()?,
                exchange: u.arbitrary()?,
            },
            6 => {
                let len = u.int_in_range(0..=64)?;
                Rdata::TXT {
                    octets: Vec::from(u.bytes(len)?),
                }
            }
            7 => Rdata::AAAA {
                address: Ipv6Addr::from(u.arbitrary::<u128>()?),
            },
            _ => Rdata::SRV {
                priority: u.arbitrary()?,
                weight: u.arbitrary()?,
                port: u.arbitrary()?,
                target: u.arbitrary()?,
            },
        };
        Ok(rdata)
    }
}

/// A set of records sharing an owner name, type, and class.
///
/// INVARIANT: every `Rdata` in `rdatas` has type `rtype`, and the TTL
/// applies to the whole set.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rrset {
    pub name: DomainName,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdatas: Vec<Rdata>,
}

impl Rrset {
    /// The target of the first CNAME record in the set, if any.
    pub fn cname_target(&self) -> Option<&DomainName> {
        self.rdatas.iter().find_map(|rdata| match rdata {
            Rdata::CNAME { cname } => Some(cname),
            _ => None,
        })
    }

    /// The `minimum` field of the first SOA record in the set, if any.
    pub fn soa_minimum(&self) -> Option<u32> {
        self.rdatas.iter().find_map(|rdata| match rdata {
            Rdata::SOA { minimum, .. } => Some(*minimum),
            _ => None,
        })
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Rrset {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let rdata = u.arbitrary::<Rdata>()?;
        Ok(Rrset {
            name: u.arbitrary()?,
            rtype: rdata.rtype(),
            rclass: RecordClass::IN,
            ttl: u.int_in_range(0..=86400)?,
            rdatas: vec![rdata],
        })
    }
}

/// A single question: almost all messages carry exactly one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Question {
    pub name: DomainName,
    pub rtype: RecordType,
    pub rclass: RecordClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.rclass, self.rtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_recordtype_roundtrip() {
        for i in 0..300 {
            assert_eq!(u16::from(RecordType::from(i)), i);
        }
    }

    #[test]
    fn u16_recordclass_roundtrip() {
        for i in 0..300 {
            assert_eq!(u16::from(RecordClass::from(i)), i);
        }
    }

    #[test]
    fn u16_rcode_roundtrip() {
        for i in 0..16 {
            assert_eq!(u16::from(Rcode::from(i)), i);
        }
    }

    #[test]
    fn u8_opcode_roundtrip() {
        for i in 0..15 {
            assert_eq!(u8::from(Opcode::from(i)), i);
        }
    }

    #[test]
    fn recordtype_text_roundtrip() {
        for rtype in [
            RecordType::A,
            RecordType::CNAME,
            RecordType::SOA,
            RecordType::AAAA,
            RecordType::from(1234),
        ] {
            assert_eq!(Ok(rtype), rtype.to_string().parse());
        }
    }

    #[test]
    fn recordclass_text_roundtrip() {
        for rclass in [RecordClass::IN, RecordClass::CH, RecordClass::from(1234)] {
            assert_eq!(Ok(rclass), rclass.to_string().parse());
        }
    }

    #[test]
    fn metatypes() {
        assert!(RecordType::ANY.is_metatype());
        assert!(RecordType::OPT.is_metatype());
        assert!(RecordType::AXFR.is_metatype());
        assert!(!RecordType::A.is_metatype());
        assert!(!RecordType::from(1234).is_metatype());

        assert!(RecordClass::ANY.is_metaclass());
        assert!(!RecordClass::IN.is_metaclass());
    }
}

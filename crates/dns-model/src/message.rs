//! The in-memory message format, used for both queries and responses.
//!
//! ```text
//!     +---------------------+
//!     |        Header       |
//!     +---------------------+
//!     |       Question      | the question for the name server
//!     +---------------------+
//!     |        Answer       | RRsets answering the question
//!     +---------------------+
//!     |      Authority      | RRsets pointing toward an authority
//!     +---------------------+
//!     |      Additional     | RRsets holding additional information
//!     +---------------------+
//! ```
//!
//! Unlike the wire format, the sections hold whole record sets: the
//! answer-processing algorithms all operate on `(owner, class, type)`
//! groups, so the grouping is done once, at the codec boundary.

use std::collections::HashMap;

use crate::name::DomainName;
use crate::rr::{Opcode, Question, Rcode, RecordClass, RecordType, Rrset};

/// A TSIG keyring: key name to shared secret.
pub type TsigKeyring = HashMap<DomainName, Vec<u8>>;

/// The default TSIG algorithm name.
pub const TSIG_DEFAULT_ALGORITHM: &str = "hmac-sha256.";

const FLAG_QR: u16 = 0b1000_0000_0000_0000;
const FLAG_AA: u16 = 0b0000_0100_0000_0000;
const FLAG_TC: u16 = 0b0000_0010_0000_0000;
const FLAG_RD: u16 = 0b0000_0001_0000_0000;
const FLAG_RA: u16 = 0b0000_0000_1000_0000;
const OFFSET_OPCODE: u16 = 11;

/// Common header type for all messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates any
    /// kind of query, copied into the corresponding reply so the
    /// requester can match up replies to outstanding queries.
    pub id: u16,

    /// Whether this message is a query (false) or a response (true).
    pub is_response: bool,

    /// The kind of query.  Set by the originator and copied into the
    /// response.
    pub opcode: Opcode,

    /// Whether the responding name server is an authority for the
    /// domain name in the question section.
    pub is_authoritative: bool,

    /// Whether this message was truncated to fit the transmission
    /// channel.  A truncated response must be retried over TCP.
    pub is_truncated: bool,

    /// Whether the name server should pursue the query recursively.
    /// Always set by a stub: it depends on a recursive upstream.
    pub recursion_desired: bool,

    /// Whether the name server offers recursion.
    pub recursion_available: bool,

    /// The response code.
    pub rcode: Rcode,
}

/// A message section.  `find_rrset` takes one of these rather than a
/// slice so callers don't need to borrow the message twice.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

/// The TSIG selection travelling with a request.
///
/// This crate does not compute signatures; the selection is carried so
/// a codec which does sign has everything it needs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Tsig {
    pub keyname: DomainName,
    pub secret: Vec<u8>,
    pub algorithm: DomainName,
}

/// A DNS message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Rrset>,
    pub authority: Vec<Rrset>,
    pub additional: Vec<Rrset>,

    /// EDNS level: negative means "no EDNS", 0 means EDNS0.  On the
    /// wire this becomes an OPT record in the additional section.
    pub edns: i16,

    /// The EDNS flags, laid out as the OPT record's TTL field
    /// (extended rcode, version, flags).
    pub ednsflags: u32,

    /// The maximum UDP payload size the sender can handle.
    pub payload: u16,

    pub tsig: Option<Tsig>,
}

impl Message {
    /// Build a query for one question, with recursion desired.
    pub fn make_query(id: u16, name: DomainName, rtype: RecordType, rclass: RecordClass) -> Self {
        Self {
            header: Header {
                id,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: true,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name,
                rtype,
                rclass,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
            edns: -1,
            ednsflags: 0,
            payload: 0,
            tsig: None,
        }
    }

    /// Build an empty response to this query.
    pub fn make_response(&self) -> Self {
        Self {
            header: Header {
                id: self.header.id,
                is_response: true,
                opcode: self.header.opcode,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: self.header.recursion_desired,
                recursion_available: true,
                rcode: Rcode::NoError,
            },
            questions: self.questions.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
            edns: -1,
            ednsflags: 0,
            payload: 0,
            tsig: None,
        }
    }

    pub fn rcode(&self) -> Rcode {
        self.header.rcode
    }

    pub fn section(&self, section: Section) -> &[Rrset] {
        match section {
            Section::Answer => &self.answers,
            Section::Authority => &self.authority,
            Section::Additional => &self.additional,
        }
    }

    /// Locate the record set with the given owner, class, and type.
    pub fn find_rrset(
        &self,
        section: Section,
        name: &DomainName,
        rclass: RecordClass,
        rtype: RecordType,
    ) -> Option<&Rrset> {
        self.section(section)
            .iter()
            .find(|rrset| rrset.rtype == rtype && rrset.rclass == rclass && rrset.name == *name)
    }

    /// Configure EDNS.  A negative `edns` disables it and zeroes the
    /// other fields.
    pub fn use_edns(&mut self, edns: i16, ednsflags: u32, payload: u16) {
        if edns < 0 {
            self.edns = -1;
            self.ednsflags = 0;
            self.payload = 0;
        } else {
            self.edns = edns;
            // the version lives in bits 16-23 of the flags field
            self.ednsflags = (ednsflags & 0xff00_ffff) | (u32::from(edns as u16) << 16);
            self.payload = payload;
        }
    }

    /// Attach a TSIG selection to this request.  If `keyname` is not
    /// given, an arbitrary key from the keyring is used, so pass a
    /// name whenever the keyring holds more than one key.
    pub fn use_tsig(
        &mut self,
        keyring: &TsigKeyring,
        keyname: Option<&DomainName>,
        algorithm: DomainName,
    ) {
        let keyname = match keyname {
            Some(name) => Some(name.clone()),
            None => keyring.keys().next().cloned(),
        };

        if let Some(keyname) = keyname {
            if let Some(secret) = keyring.get(&keyname) {
                self.tsig = Some(Tsig {
                    keyname,
                    secret: secret.clone(),
                    algorithm,
                });
            }
        }
    }

    /// The 16-bit flags word: QR, opcode, AA, TC, RD, RA, rcode.
    pub fn flags_word(&self) -> u16 {
        let mut word = 0;
        if self.header.is_response {
            word |= FLAG_QR;
        }
        word |= u16::from(u8::from(self.header.opcode)) << OFFSET_OPCODE;
        if self.header.is_authoritative {
            word |= FLAG_AA;
        }
        if self.header.is_truncated {
            word |= FLAG_TC;
        }
        if self.header.recursion_desired {
            word |= FLAG_RD;
        }
        if self.header.recursion_available {
            word |= FLAG_RA;
        }
        word |= u16::from(self.header.rcode) & 0b1111;
        word
    }

    /// Overwrite every field covered by the flags word.
    pub fn set_flags(&mut self, word: u16) {
        self.header.is_response = word & FLAG_QR != 0;
        self.header.opcode = Opcode::from(((word >> OFFSET_OPCODE) & 0b1111) as u8);
        self.header.is_authoritative = word & FLAG_AA != 0;
        self.header.is_truncated = word & FLAG_TC != 0;
        self.header.recursion_desired = word & FLAG_RD != 0;
        self.header.recursion_available = word & FLAG_RA != 0;
        self.header.rcode = Rcode::from(word & 0b1111);
    }
}

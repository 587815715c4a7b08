//! Serialisation of messages to the wire format and back.
//!
//! The writer never compresses names.  The reader follows compression
//! pointers, with the restriction that a pointer must point strictly
//! before the name being parsed (RFC 1035 section 4.1.4), which rules
//! out pointer loops.
//!
//! Records are grouped into `Rrset`s as they are read, preserving the
//! order of first appearance; the set's TTL is the minimum of its
//! records' TTLs.  An OPT record in the additional section is absorbed
//! into the message's EDNS fields (including the extended rcode)
//! rather than surfaced as data.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::message::{Header, Message, Section};
use crate::name::{DomainName, DOMAINNAME_MAX_LEN, LABEL_MAX_LEN};
use crate::rr::{Opcode, Question, Rcode, Rdata, RecordClass, RecordType, Rrset};

/// Serialise a message.
///
/// # Errors
///
/// If a name is relative, or a section has more records than its
/// 16-bit counter can describe.
pub fn to_wire(message: &Message) -> Result<Vec<u8>, WireError> {
    let mut buffer = BytesMut::with_capacity(512);

    let qdcount = count_to_u16(message.questions.len())?;
    let ancount = count_to_u16(record_count(&message.answers))?;
    let nscount = count_to_u16(record_count(&message.authority))?;
    let mut arcount = count_to_u16(record_count(&message.additional))?;
    if message.edns >= 0 {
        arcount = arcount.checked_add(1).ok_or(WireError::CountTooLarge)?;
    }

    buffer.put_u16(message.header.id);
    buffer.put_u16(message.flags_word());
    buffer.put_u16(qdcount);
    buffer.put_u16(ancount);
    buffer.put_u16(nscount);
    buffer.put_u16(arcount);

    for question in &message.questions {
        write_name(&mut buffer, &question.name)?;
        buffer.put_u16(u16::from(question.rtype));
        buffer.put_u16(u16::from(question.rclass));
    }
    for rrset in &message.answers {
        write_rrset(&mut buffer, rrset)?;
    }
    for rrset in &message.authority {
        write_rrset(&mut buffer, rrset)?;
    }
    for rrset in &message.additional {
        write_rrset(&mut buffer, rrset)?;
    }

    if message.edns >= 0 {
        // the OPT pseudo-record: root owner, class carries the payload
        // size, TTL carries the flags
        buffer.put_u8(0);
        buffer.put_u16(u16::from(RecordType::OPT));
        buffer.put_u16(message.payload);
        buffer.put_u32(message.ednsflags);
        buffer.put_u16(0);
    }

    Ok(buffer.to_vec())
}

fn record_count(section: &[Rrset]) -> usize {
    section.iter().map(|rrset| rrset.rdatas.len()).sum()
}

fn count_to_u16(count: usize) -> Result<u16, WireError> {
    count.try_into().map_err(|_| WireError::CountTooLarge)
}

fn write_name(buffer: &mut BytesMut, name: &DomainName) -> Result<(), WireError> {
    if !name.is_absolute() {
        return Err(WireError::RelativeName);
    }

    for label in name.labels() {
        // from_labels already bounds labels at 63 octets
        buffer.put_u8(label.len() as u8);
        buffer.put_slice(label);
    }
    buffer.put_u8(0);

    Ok(())
}

fn write_rrset(buffer: &mut BytesMut, rrset: &Rrset) -> Result<(), WireError> {
    for rdata in &rrset.rdatas {
        write_name(buffer, &rrset.name)?;
        buffer.put_u16(u16::from(rdata.rtype()));
        buffer.put_u16(u16::from(rrset.rclass));
        buffer.put_u32(rrset.ttl);

        let mut rdata_buffer = BytesMut::new();
        write_rdata(&mut rdata_buffer, rdata)?;
        buffer.put_u16(count_to_u16(rdata_buffer.len())?);
        buffer.put_slice(&rdata_buffer);
    }

    Ok(())
}

fn write_rdata(buffer: &mut BytesMut, rdata: &Rdata) -> Result<(), WireError> {
    match rdata {
        Rdata::A { address } => buffer.put_slice(&address.octets()),
        Rdata::NS { nsdname } => write_name(buffer, nsdname)?,
        Rdata::CNAME { cname } => write_name(buffer, cname)?,
        Rdata::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            write_name(buffer, mname)?;
            write_name(buffer, rname)?;
            buffer.put_u32(*serial);
            buffer.put_u32(*refresh);
            buffer.put_u32(*retry);
            buffer.put_u32(*expire);
            buffer.put_u32(*minimum);
        }
        Rdata::PTR { ptrdname } => write_name(buffer, ptrdname)?,
        Rdata::MX {
            preference,
            exchange,
        } => {
            buffer.put_u16(*preference);
            write_name(buffer, exchange)?;
        }
        Rdata::TXT { octets } => buffer.put_slice(octets),
        Rdata::AAAA { address } => buffer.put_slice(&address.octets()),
        Rdata::SRV {
            priority,
            weight,
            port,
            target,
        } => {
            buffer.put_u16(*priority);
            buffer.put_u16(*weight);
            buffer.put_u16(*port);
            write_name(buffer, target)?;
        }
        Rdata::Unknown { octets, .. } => buffer.put_slice(octets),
    }

    Ok(())
}

/// Deserialise a message.
///
/// # Errors
///
/// If the octets are not a valid message.
pub fn from_wire(octets: &[u8]) -> Result<Message, WireError> {
    let mut buffer = ConsumableBuffer::new(octets);

    let id = buffer.next_u16().ok_or(WireError::HeaderTooShort)?;
    let flags = buffer.next_u16().ok_or(WireError::HeaderTooShort)?;
    let qdcount = buffer.next_u16().ok_or(WireError::HeaderTooShort)?;
    let ancount = buffer.next_u16().ok_or(WireError::HeaderTooShort)?;
    let nscount = buffer.next_u16().ok_or(WireError::HeaderTooShort)?;
    let arcount = buffer.next_u16().ok_or(WireError::HeaderTooShort)?;

    let mut message = Message {
        header: Header {
            id,
            is_response: false,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            rcode: Rcode::NoError,
        },
        questions: Vec::with_capacity(qdcount.into()),
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
        edns: -1,
        ednsflags: 0,
        payload: 0,
        tsig: None,
    };
    message.set_flags(flags);
    message.header.id = id;

    for _ in 0..qdcount {
        let name = read_name(&mut buffer)?;
        let rtype = buffer.next_u16().ok_or(WireError::QuestionTooShort)?;
        let rclass = buffer.next_u16().ok_or(WireError::QuestionTooShort)?;
        message.questions.push(Question {
            name,
            rtype: RecordType::from(rtype),
            rclass: RecordClass::from(rclass),
        });
    }

    for _ in 0..ancount {
        let record = read_record(&mut buffer)?;
        add_record(&mut message, Section::Answer, record);
    }
    for _ in 0..nscount {
        let record = read_record(&mut buffer)?;
        add_record(&mut message, Section::Authority, record);
    }
    for _ in 0..arcount {
        let record = read_record(&mut buffer)?;
        add_record(&mut message, Section::Additional, record);
    }

    Ok(message)
}

struct RawRecord {
    name: DomainName,
    rtype: RecordType,
    rclass: RecordClass,
    ttl: u32,
    /// `None` for the meta types whose RDATA this crate does not
    /// model; such records are consumed but not surfaced.
    rdata: Option<Rdata>,
}

fn add_record(message: &mut Message, section: Section, record: RawRecord) {
    if record.rtype == RecordType::OPT && section == Section::Additional {
        if message.edns < 0 {
            message.edns = i16::try_from((record.ttl >> 16) & 0xff).unwrap_or(0);
            message.ednsflags = record.ttl;
            message.payload = u16::from(record.rclass);

            let extended = u16::try_from(record.ttl >> 24).unwrap_or(0) << 4;
            message.header.rcode =
                Rcode::from(extended | (u16::from(message.header.rcode) & 0b1111));
        }
        return;
    }

    let Some(rdata) = record.rdata else {
        return;
    };

    let section = match section {
        Section::Answer => &mut message.answers,
        Section::Authority => &mut message.authority,
        Section::Additional => &mut message.additional,
    };

    for rrset in section.iter_mut() {
        if rrset.rtype == record.rtype && rrset.rclass == record.rclass && rrset.name == record.name
        {
            rrset.ttl = rrset.ttl.min(record.ttl);
            rrset.rdatas.push(rdata);
            return;
        }
    }

    section.push(Rrset {
        name: record.name,
        rtype: record.rtype,
        rclass: record.rclass,
        ttl: record.ttl,
        rdatas: vec![rdata],
    });
}

fn read_record(buffer: &mut ConsumableBuffer) -> Result<RawRecord, WireError> {
    let name = read_name(buffer)?;
    let rtype = RecordType::from(buffer.next_u16().ok_or(WireError::RecordTooShort)?);
    let rclass = RecordClass::from(buffer.next_u16().ok_or(WireError::RecordTooShort)?);
    let ttl = buffer.next_u32().ok_or(WireError::RecordTooShort)?;
    let rdlength = buffer.next_u16().ok_or(WireError::RecordTooShort)?;

    let rdata_start = buffer.position;

    // names inside RDATA have to be parsed to expand pointers; for the
    // opaque types the octets are taken as-is
    let rdata = match rtype {
        RecordType::A => Some(Rdata::A {
            address: Ipv4Addr::from(buffer.next_u32().ok_or(WireError::RecordTooShort)?),
        }),
        RecordType::NS => Some(Rdata::NS {
            nsdname: read_name(buffer)?,
        }),
        RecordType::CNAME => Some(Rdata::CNAME {
            cname: read_name(buffer)?,
        }),
        RecordType::SOA => Some(Rdata::SOA {
            mname: read_name(buffer)?,
            rname: read_name(buffer)?,
            serial: buffer.next_u32().ok_or(WireError::RecordTooShort)?,
            refresh: buffer.next_u32().ok_or(WireError::RecordTooShort)?,
            retry: buffer.next_u32().ok_or(WireError::RecordTooShort)?,
            expire: buffer.next_u32().ok_or(WireError::RecordTooShort)?,
            minimum: buffer.next_u32().ok_or(WireError::RecordTooShort)?,
        }),
        RecordType::PTR => Some(Rdata::PTR {
            ptrdname: read_name(buffer)?,
        }),
        RecordType::MX => Some(Rdata::MX {
            preference: buffer.next_u16().ok_or(WireError::RecordTooShort)?,
            exchange: read_name(buffer)?,
        }),
        RecordType::TXT => Some(Rdata::TXT {
            octets: buffer
                .take(rdlength as usize)
                .ok_or(WireError::RecordTooShort)?
                .to_vec(),
        }),
        RecordType::AAAA => {
            let mut octets = [0; 16];
            octets.copy_from_slice(buffer.take(16).ok_or(WireError::RecordTooShort)?);
            Some(Rdata::AAAA {
                address: Ipv6Addr::from(octets),
            })
        }
        RecordType::SRV => Some(Rdata::SRV {
            priority: buffer.next_u16().ok_or(WireError::RecordTooShort)?,
            weight: buffer.next_u16().ok_or(WireError::RecordTooShort)?,
            port: buffer.next_u16().ok_or(WireError::RecordTooShort)?,
            target: read_name(buffer)?,
        }),
        RecordType::Unknown(tag) => Some(Rdata::Unknown {
            tag,
            octets: buffer
                .take(rdlength as usize)
                .ok_or(WireError::RecordTooShort)?
                .to_vec(),
        }),
        // meta types (OPT, TSIG, the transfer types): consume the
        // RDATA but do not surface it as record data
        _ => {
            buffer
                .take(rdlength as usize)
                .ok_or(WireError::RecordTooShort)?;
            None
        }
    };

    if buffer.position == rdata_start + rdlength as usize {
        Ok(RawRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    } else {
        Err(WireError::RecordInvalid)
    }
}

fn read_name(buffer: &mut ConsumableBuffer) -> Result<DomainName, WireError> {
    let mut labels = Vec::with_capacity(5);
    let mut wire_len = 1;
    let start = buffer.position;

    loop {
        let size = buffer.next_u8().ok_or(WireError::NameTooShort)?;

        if usize::from(size) <= LABEL_MAX_LEN {
            if size == 0 {
                break;
            }

            let label = buffer
                .take(size as usize)
                .ok_or(WireError::NameTooShort)?
                .to_vec();
            wire_len += 1 + label.len();
            labels.push(label);

            if wire_len > DOMAINNAME_MAX_LEN {
                return Err(WireError::NameTooLong);
            }
        } else if size >= 192 {
            // a pointer must be to an earlier offset (not merely a
            // different one: an earlier one), so following it always
            // makes progress towards the start of the message
            let hi = size & 0b0011_1111;
            let lo = buffer.next_u8().ok_or(WireError::NameTooShort)?;
            let ptr = usize::from(u16::from_be_bytes([hi, lo]));

            if ptr >= start {
                return Err(WireError::NamePointerInvalid);
            }

            let mut pointed = buffer.at_offset(ptr);
            let rest = read_name(&mut pointed)?;
            for label in rest.labels() {
                wire_len += 1 + label.len();
                labels.push(label.clone());
            }
            if wire_len > DOMAINNAME_MAX_LEN {
                return Err(WireError::NameTooLong);
            }
            break;
        } else {
            return Err(WireError::NameLabelInvalid);
        }
    }

    DomainName::from_labels(labels, true).ok_or(WireError::NameLabelInvalid)
}

/// Errors encountered when converting between messages and octets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WireError {
    /// The header is missing one or more required fields.
    HeaderTooShort,
    /// A question ends with an incomplete field.
    QuestionTooShort,
    /// A resource record ends with an incomplete field.
    RecordTooShort,
    /// A resource record's RDATA does not match its RDLENGTH.
    RecordInvalid,
    /// A name is incomplete.
    NameTooShort,
    /// A name is over 255 octets in wire form.
    NameTooLong,
    /// A label is over 63 octets, but not a pointer.
    NameLabelInvalid,
    /// A compression pointer points at or after the name containing it.
    NamePointerInvalid,
    /// A relative name cannot be written to the wire.
    RelativeName,
    /// A section has more records than fit in a 16-bit counter.
    CountTooLarge,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::HeaderTooShort => write!(f, "header too short"),
            WireError::QuestionTooShort => write!(f, "question too short"),
            WireError::RecordTooShort => write!(f, "resource record too short"),
            WireError::RecordInvalid => write!(f, "resource record malformed"),
            WireError::NameTooShort => write!(f, "name too short"),
            WireError::NameTooLong => write!(f, "name too long"),
            WireError::NameLabelInvalid => write!(f, "name label malformed"),
            WireError::NamePointerInvalid => write!(f, "name compression pointer malformed"),
            WireError::RelativeName => write!(f, "cannot write relative name"),
            WireError::CountTooLarge => write!(f, "section counter overflow"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which is consumed by the parsing process.
struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    fn new(octets: &'a [u8]) -> Self {
        Self { octets, position: 0 }
    }

    fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn query_roundtrips() {
        let mut query = query("www.example.com.", RecordType::A);
        query.use_edns(0, 0, 1232);

        let octets = to_wire(&query).unwrap();
        let parsed = from_wire(&octets).unwrap();

        assert_eq!(query, parsed);
    }

    #[test]
    fn response_roundtrips() {
        let response = response(
            "www.example.com.",
            RecordType::A,
            &[
                cname_rrset("www.example.com.", "web.example.com.", 120),
                a_rrset("web.example.com.", "1.2.3.4", 300),
            ],
            &[soa_rrset("example.com.", 900, 3600)],
        );

        let octets = to_wire(&response).unwrap();
        let parsed = from_wire(&octets).unwrap();

        assert_eq!(response, parsed);
    }

    #[test]
    fn records_group_into_sets() {
        let mut rrset = a_rrset("www.example.com.", "1.2.3.4", 300);
        rrset.rdatas.push(Rdata::A {
            address: "5.6.7.8".parse().unwrap(),
        });

        let response = response("www.example.com.", RecordType::A, &[rrset.clone()], &[]);
        let parsed = from_wire(&to_wire(&response).unwrap()).unwrap();

        assert_eq!(1, parsed.answers.len());
        assert_eq!(rrset, parsed.answers[0]);
    }

    #[test]
    fn grouped_ttl_is_minimum() {
        // two A records for the same owner with different TTLs
        let mut octets = to_wire(&response(
            "a.example.com.",
            RecordType::A,
            &[a_rrset("a.example.com.", "1.2.3.4", 300)],
            &[],
        ))
        .unwrap();

        let more = to_wire(&response(
            "a.example.com.",
            RecordType::A,
            &[a_rrset("a.example.com.", "5.6.7.8", 60)],
            &[],
        ))
        .unwrap();

        // splice the second record after the first: header says two
        // answers.  the question is 19 octets (15 of name, 4 of
        // type+class), so the answer starts at offset 31.
        octets[7] = 2;
        let record = &more[31..];
        octets.extend_from_slice(record);

        let parsed = from_wire(&octets).unwrap();
        assert_eq!(1, parsed.answers.len());
        assert_eq!(60, parsed.answers[0].ttl);
        assert_eq!(2, parsed.answers[0].rdatas.len());
    }

    #[test]
    fn compression_pointers_expand() {
        // header + one question (example.com. A IN) + one answer whose
        // name is a pointer back to the question's name at offset 12
        let mut octets = Vec::new();
        octets.extend_from_slice(&[0x12, 0x34, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0]);
        octets.extend_from_slice(b"\x07example\x03com\x00");
        octets.extend_from_slice(&[0, 1, 0, 1]);
        octets.extend_from_slice(&[0xc0, 12]);
        octets.extend_from_slice(&[0, 1, 0, 1]);
        octets.extend_from_slice(&[0, 0, 1, 44]);
        octets.extend_from_slice(&[0, 4, 1, 2, 3, 4]);

        let parsed = from_wire(&octets).unwrap();
        assert_eq!(domain("example.com."), parsed.answers[0].name);
        assert_eq!(300, parsed.answers[0].ttl);
    }

    #[test]
    fn forward_pointers_rejected() {
        let mut octets = Vec::new();
        octets.extend_from_slice(&[0x12, 0x34, 0x81, 0x80, 0, 1, 0, 0, 0, 0, 0, 0]);
        octets.extend_from_slice(&[0xc0, 12]);
        octets.extend_from_slice(&[0, 1, 0, 1]);

        assert_eq!(Err(WireError::NamePointerInvalid), from_wire(&octets));
    }

    #[test]
    fn truncated_header_rejected() {
        assert_eq!(Err(WireError::HeaderTooShort), from_wire(&[0x12, 0x34, 0x01]));
    }

    #[test]
    fn relative_names_rejected() {
        let query = Message::make_query(
            1,
            DomainName::from_dotted_string("www.example").unwrap(),
            RecordType::A,
            RecordClass::IN,
        );

        assert_eq!(Err(WireError::RelativeName), to_wire(&query));
    }

    #[test]
    fn edns_fields_survive_the_wire() {
        let mut query = query("www.example.com.", RecordType::A);
        query.use_edns(0, 0x8000, 1232);

        let parsed = from_wire(&to_wire(&query).unwrap()).unwrap();
        assert_eq!(0, parsed.edns);
        assert_eq!(0x8000, parsed.ednsflags);
        assert_eq!(1232, parsed.payload);
        assert!(parsed.additional.is_empty());
    }
}

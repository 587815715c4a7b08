//! Builders for names, record sets, and messages, used by this
//! crate's tests and (behind the `test-util` feature) by dependents.

use arbitrary::{Arbitrary, Unstructured};
use rand::RngCore;

use crate::message::Message;
use crate::name::DomainName;
use crate::rr::{Rdata, RecordClass, RecordType, Rrset};

pub fn domain(name: &str) -> DomainName {
    DomainName::from_dotted_string(name).unwrap()
}

pub fn a_rrset(name: &str, address: &str, ttl: u32) -> Rrset {
    Rrset {
        name: domain(name),
        rtype: RecordType::A,
        rclass: RecordClass::IN,
        ttl,
        rdatas: vec![Rdata::A {
            address: address.parse().unwrap(),
        }],
    }
}

pub fn cname_rrset(name: &str, target: &str, ttl: u32) -> Rrset {
    Rrset {
        name: domain(name),
        rtype: RecordType::CNAME,
        rclass: RecordClass::IN,
        ttl,
        rdatas: vec![Rdata::CNAME {
            cname: domain(target),
        }],
    }
}

pub fn ptr_rrset(name: &str, target: &str, ttl: u32) -> Rrset {
    Rrset {
        name: domain(name),
        rtype: RecordType::PTR,
        rclass: RecordClass::IN,
        ttl,
        rdatas: vec![Rdata::PTR {
            ptrdname: domain(target),
        }],
    }
}

pub fn soa_rrset(name: &str, minimum: u32, ttl: u32) -> Rrset {
    Rrset {
        name: domain(name),
        rtype: RecordType::SOA,
        rclass: RecordClass::IN,
        ttl,
        rdatas: vec![Rdata::SOA {
            mname: domain(&format!("ns1.{name}")),
            rname: domain(&format!("hostmaster.{name}")),
            serial: 1,
            refresh: 10800,
            retry: 3600,
            expire: 604_800,
            minimum,
        }],
    }
}

pub fn query(name: &str, rtype: RecordType) -> Message {
    Message::make_query(1234, domain(name), rtype, RecordClass::IN)
}

/// A NOERROR response to `query(name, rtype)` with the given sections.
pub fn response(name: &str, rtype: RecordType, answers: &[Rrset], authority: &[Rrset]) -> Message {
    let mut response = query(name, rtype).make_response();
    response.answers = answers.into();
    response.authority = authority.into();
    response
}

/// Generate a random record set, retrying with bigger entropy buffers
/// until the `Arbitrary` impl is satisfied.
pub fn arbitrary_rrset() -> Rrset {
    for size in [128, 256, 512, 1024] {
        let mut buf = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut buf);

        if let Ok(rrset) = Rrset::arbitrary(&mut Unstructured::new(&buf)) {
            return rrset;
        }
    }

    panic!("could not generate arbitrary value!");
}

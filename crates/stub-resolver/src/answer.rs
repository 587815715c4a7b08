//! Turning a raw response into an answer: chasing CNAME chains,
//! locating the negative-caching SOA, and computing an expiration.

use std::time::{Duration, SystemTime};

use dns_model::message::{Message, Section};
use dns_model::name::DomainName;
use dns_model::rr::{RecordClass, RecordType, Rrset};

use crate::errors::ResolveError;

/// How many CNAME hops to follow inside one response.  A hard cap
/// against a maliciously-configured upstream nameserver returning a
/// looping alias chain.
pub const MAX_CNAME_HOPS: usize = 15;

/// The successful outcome of a resolution.
///
/// `rrset` is `None` when the name exists but has no records of the
/// requested type and class; in that case the expiration was computed
/// from the negative-caching SOA.
#[derive(Debug, Clone)]
pub struct Answer {
    /// The original question name.
    pub qname: DomainName,
    pub rtype: RecordType,
    pub rclass: RecordClass,

    /// The final name after following aliases.
    ///
    /// INVARIANT: when `rrset` is present, `rrset.name` equals this.
    pub canonical_name: DomainName,
    pub rrset: Option<Rrset>,

    /// The raw response that produced this answer, kept for
    /// diagnostics and negative-caching context.
    pub response: Message,

    /// When this answer becomes stale.  Never earlier than the moment
    /// of construction.
    pub expiration: SystemTime,

    /// Where the response came from, when it came from the network.
    pub nameserver: Option<String>,
    pub port: Option<u16>,
}

impl Answer {
    /// Post-process a NOERROR response into an answer.
    ///
    /// # Errors
    ///
    /// `NoAnswer` if the response holds no records of the requested
    /// type and class and `raise_on_no_answer` is set, or if the
    /// alias chain exceeds [`MAX_CNAME_HOPS`].
    pub fn from_response(
        qname: DomainName,
        rtype: RecordType,
        rclass: RecordClass,
        response: Message,
        raise_on_no_answer: bool,
        nameserver: Option<String>,
        port: Option<u16>,
    ) -> Result<Self, ResolveError> {
        let mut min_ttl: Option<u32> = None;
        let mut current = qname.clone();
        let mut rrset = None;
        let mut remaining_hops = MAX_CNAME_HOPS;

        loop {
            if let Some(found) = response.find_rrset(Section::Answer, &current, rclass, rtype) {
                min_ttl = fold_ttl(min_ttl, found.ttl);
                rrset = Some(found.clone());
                break;
            }

            if rtype != RecordType::CNAME {
                if let Some(alias) =
                    response.find_rrset(Section::Answer, &current, rclass, RecordType::CNAME)
                {
                    if let Some(target) = alias.cname_target() {
                        min_ttl = fold_ttl(min_ttl, alias.ttl);
                        current = target.clone();

                        remaining_hops -= 1;
                        if remaining_hops == 0 {
                            return Err(no_answer(response));
                        }
                        continue;
                    }
                }
            }

            // neither the requested type nor a CNAME at this hop
            if raise_on_no_answer {
                return Err(no_answer(response));
            }
            break;
        }

        if rrset.is_none() {
            // negative answer: the first SOA at the final name or one
            // of its ancestors bounds how long the denial may be
            // cached, through both its own TTL and its minimum field
            let mut owner = current.clone();
            loop {
                if let Some(soa) =
                    response.find_rrset(Section::Authority, &owner, rclass, RecordType::SOA)
                {
                    min_ttl = fold_ttl(min_ttl, soa.ttl);
                    if let Some(minimum) = soa.soa_minimum() {
                        min_ttl = fold_ttl(min_ttl, minimum);
                    }
                    break;
                }

                match owner.parent() {
                    Some(parent) => owner = parent,
                    None => break,
                }
            }
        }

        let ttl = Duration::from_secs(u64::from(min_ttl.unwrap_or(0)));

        Ok(Answer {
            qname,
            rtype,
            rclass,
            canonical_name: current,
            rrset,
            response,
            expiration: SystemTime::now() + ttl,
            nameserver,
            port,
        })
    }

    /// Whether this answer can still be used at `now`.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.expiration > now
    }
}

fn fold_ttl(min_ttl: Option<u32>, ttl: u32) -> Option<u32> {
    match min_ttl {
        Some(min_ttl) if min_ttl < ttl => Some(min_ttl),
        _ => Some(ttl),
    }
}

fn no_answer(response: Message) -> ResolveError {
    ResolveError::NoAnswer {
        response: Box::new(response),
    }
}

//! The ways a resolution can fail.
//!
//! A `resolve` call surfaces exactly one error, carrying enough
//! context to diagnose the failure: the names that were tried, the
//! per-server attempt log, or the original request.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use dns_model::message::Message;
use dns_model::name::DomainName;
use dns_model::rr::{Rcode, RecordClass, RecordType, Rdata};

use crate::transport::TransportError;

/// One failed attempt against one nameserver.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub nameserver: String,
    pub tcp: bool,
    pub port: u16,
    pub error: AttemptError,
    pub response: Option<Message>,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Server {} {} port {} answered {}",
            self.nameserver,
            if self.tcp { "TCP" } else { "UDP" },
            self.port,
            self.error
        )
    }
}

/// What went wrong in one attempt.
#[derive(Debug, Clone)]
pub enum AttemptError {
    Transport(TransportError),
    Rcode(Rcode),
    Yxdomain,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttemptError::Transport(error) => write!(f, "{error}"),
            AttemptError::Rcode(rcode) => write!(f, "{rcode}"),
            AttemptError::Yxdomain => write!(f, "YXDOMAIN"),
        }
    }
}

/// An authoritative denial, accumulated across every candidate name
/// that was tried.
#[derive(Debug, Clone, Default)]
pub struct Nxdomain {
    qnames: Vec<DomainName>,
    responses: HashMap<DomainName, Message>,
}

impl Nxdomain {
    pub fn new(qnames: Vec<DomainName>, responses: HashMap<DomainName, Message>) -> Self {
        Self { qnames, responses }
    }

    /// All of the names that were tried, in tried order.
    pub fn qnames(&self) -> &[DomainName] {
        &self.qnames
    }

    /// The denial for one queried name.
    pub fn response(&self, qname: &DomainName) -> Option<&Message> {
        self.responses.get(qname)
    }

    pub fn responses(&self) -> &HashMap<DomainName, Message> {
        &self.responses
    }

    /// Merge with results from another denial: the union of the
    /// qnames (first occurrence wins on order) and of the responses
    /// (the right-hand side wins on key collision).
    pub fn merge(mut self, other: Nxdomain) -> Nxdomain {
        for qname in other.qnames {
            if !self.qnames.contains(&qname) {
                self.qnames.push(qname.clone());
            }
            if let Some(response) = other.responses.get(&qname) {
                self.responses.insert(qname, response.clone());
            }
        }
        self
    }

    /// The unresolved canonical name: the deepest CNAME target seen
    /// in the recorded denials, or the first tried qname.
    pub fn canonical_name(&self) -> Option<&DomainName> {
        for qname in &self.qnames {
            let Some(response) = self.responses.get(qname) else {
                continue;
            };

            let mut cname = None;
            for rrset in &response.answers {
                if rrset.rtype != RecordType::CNAME || rrset.rclass != RecordClass::IN {
                    continue;
                }
                for rdata in &rrset.rdatas {
                    if let Rdata::CNAME { cname: target } = rdata {
                        cname = Some(target);
                    }
                }
            }
            if cname.is_some() {
                return cname;
            }
        }

        self.qnames.first()
    }
}

/// An error that can occur when resolving a name.
#[derive(Debug, Clone)]
pub enum ResolveError {
    /// None of the query names exist.
    Nxdomain(Nxdomain),
    /// The query name is too long after DNAME substitution.
    Yxdomain,
    /// The name exists but has no records of the requested type and
    /// class.
    NoAnswer { response: Box<Message> },
    /// Every nameserver failed to answer the query.
    NoNameservers {
        request: Box<Message>,
        errors: Vec<Attempt>,
    },
    /// The lifetime budget was exhausted.
    Timeout { duration: Duration },
    /// The resolver configuration could not be read, or specified no
    /// nameservers.
    NoResolverConfiguration,
    /// An absolute name is required but a relative one was given.
    NotAbsolute { name: DomainName },
    /// There is no SOA record at the root.  This should never happen.
    NoRootSoa,
    /// Queries for meta types and classes are not allowed.
    NoMetaqueries,
    /// A textual name, type, or class could not be parsed.
    Syntax(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolveError::Nxdomain(nxdomain) => {
                let qnames = nxdomain.qnames();
                if qnames.len() > 1 {
                    write!(f, "None of DNS query names exist: ")?;
                } else {
                    write!(f, "The DNS query name does not exist: ")?;
                }
                for (i, qname) in qnames.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{qname}")?;
                }
                Ok(())
            }
            ResolveError::Yxdomain => {
                write!(f, "The DNS query name is too long after DNAME substitution")
            }
            ResolveError::NoAnswer { response } => {
                write!(
                    f,
                    "The DNS response does not contain an answer to the question:"
                )?;
                for question in &response.questions {
                    write!(f, " {question}")?;
                }
                Ok(())
            }
            ResolveError::NoNameservers { request, errors } => {
                write!(f, "All nameservers failed to answer the query")?;
                for question in &request.questions {
                    write!(f, " {question}")?;
                }
                write!(f, ": ")?;
                for (i, attempt) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{attempt}")?;
                }
                Ok(())
            }
            ResolveError::Timeout { duration } => write!(
                f,
                "The DNS operation timed out after {:.3} seconds",
                duration.as_secs_f64()
            ),
            ResolveError::NoResolverConfiguration => write!(
                f,
                "Resolver configuration could not be read or specified no nameservers"
            ),
            ResolveError::NotAbsolute { name } => {
                write!(f, "An absolute name is required: got '{name}'")
            }
            ResolveError::NoRootSoa => write!(f, "There is no SOA RR at the DNS root name"),
            ResolveError::NoMetaqueries => write!(f, "DNS metaqueries are not allowed"),
            ResolveError::Syntax(what) => write!(f, "syntax error: {what}"),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use dns_model::rr::RecordType;
    use dns_model::test_util::*;

    use super::*;

    fn nxdomain_response(name: &str) -> Message {
        let mut response = query(name, RecordType::A).make_response();
        response.header.rcode = Rcode::NxDomain;
        response
    }

    #[test]
    fn merge_unions_qnames_preserving_left_order() {
        let a = Nxdomain::new(
            vec![domain("a.example."), domain("b.example.")],
            HashMap::from([(domain("a.example."), nxdomain_response("a.example."))]),
        );
        let b = Nxdomain::new(
            vec![domain("b.example."), domain("c.example.")],
            HashMap::from([(domain("c.example."), nxdomain_response("c.example."))]),
        );

        let merged = a.merge(b);
        assert_eq!(
            vec![
                domain("a.example."),
                domain("b.example."),
                domain("c.example.")
            ],
            merged.qnames()
        );
        assert!(merged.response(&domain("a.example.")).is_some());
        assert!(merged.response(&domain("c.example.")).is_some());
    }

    #[test]
    fn merge_responses_right_biased() {
        let mut left = nxdomain_response("x.example.");
        left.header.id = 1;
        let mut right = nxdomain_response("x.example.");
        right.header.id = 2;

        let a = Nxdomain::new(
            vec![domain("x.example.")],
            HashMap::from([(domain("x.example."), left)]),
        );
        let b = Nxdomain::new(
            vec![domain("x.example.")],
            HashMap::from([(domain("x.example."), right)]),
        );

        let merged = a.merge(b);
        assert_eq!(1, merged.qnames().len());
        assert_eq!(2, merged.response(&domain("x.example.")).unwrap().header.id);
    }

    #[test]
    fn canonical_name_prefers_cname_targets() {
        let mut response = nxdomain_response("www.example.");
        response
            .answers
            .push(cname_rrset("www.example.", "real.example.", 60));

        let nxdomain = Nxdomain::new(
            vec![domain("other.example."), domain("www.example.")],
            HashMap::from([(domain("www.example."), response)]),
        );

        assert_eq!(Some(&domain("real.example.")), nxdomain.canonical_name());
    }

    #[test]
    fn canonical_name_falls_back_to_first_qname() {
        let nxdomain = Nxdomain::new(vec![domain("www.example.")], HashMap::new());
        assert_eq!(Some(&domain("www.example.")), nxdomain.canonical_name());
    }
}

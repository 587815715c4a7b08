//! The state machine driving one logical lookup.
//!
//! All of the business logic of resolution lives here, split into
//! three operations the driver loop in `Resolver::resolve` alternates
//! between:
//!
//! - `next_request` picks the next candidate name and either answers
//!   from the cache or builds the outgoing query;
//! - `next_nameserver` picks the server, port, and protocol for the
//!   next attempt, handling pool refills and backoff;
//! - `query_result` classifies what came back and decides whether to
//!   stop, move to the next candidate, or try another server.
//!
//! Outcomes are tagged values rather than exceptions, so the driver
//! dispatches on the tag and only `resolve` itself surfaces errors.

use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use dns_model::message::Message;
use dns_model::name::DomainName;
use dns_model::rr::{Rcode, RecordClass, RecordType};

use crate::answer::Answer;
use crate::errors::{Attempt, AttemptError, Nxdomain, ResolveError};
use crate::resolver::Resolver;
use crate::transport::TransportError;

/// The cooldown applied before the second full sweep of the server
/// pool; it doubles on every refill up to [`BACKOFF_CAP`].  The first
/// sweep has no cooldown.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// What `next_request` produced.
pub(crate) enum RequestOutcome {
    /// A query to put on the wire.
    Query(Box<Message>),
    /// A live cached answer; resolution is over.
    Cached(Box<Answer>),
}

/// Where the next attempt should go.
pub(crate) struct NameserverAttempt {
    pub nameserver: String,
    pub port: u16,
    pub tcp: bool,
    /// Sleep this long before the attempt, if present.
    pub backoff: Option<Duration>,
}

/// What `query_result` decided.
pub(crate) enum QueryOutcome {
    /// Resolution is over.
    Answer(Box<Answer>),
    /// This qname is NXDOMAIN; move to the next candidate.
    NextCandidate,
    /// Try the next nameserver.
    TryNext,
}

pub(crate) struct Resolution<'a> {
    resolver: &'a Resolver,

    qnames_to_try: Vec<DomainName>,
    /// Drained from the back; built in reverse of `qnames_to_try`, so
    /// the top of the stack is the first name to try.
    remaining_qnames: Vec<DomainName>,
    rtype: RecordType,
    rclass: RecordClass,
    tcp: bool,
    raise_on_no_answer: bool,

    /// NXDOMAIN responses accumulated per qname, to build the final
    /// denial.
    nxdomain_responses: HashMap<DomainName, Message>,

    qname: DomainName,
    nameservers: Vec<String>,
    current_nameservers: Vec<String>,
    errors: Vec<Attempt>,
    nameserver: Option<String>,
    port: u16,
    tcp_attempt: bool,
    retry_with_tcp: bool,
    request: Message,
    backoff: Duration,
}

impl<'a> Resolution<'a> {
    pub(crate) fn new(
        resolver: &'a Resolver,
        qname: DomainName,
        rtype: RecordType,
        rclass: RecordClass,
        tcp: bool,
        raise_on_no_answer: bool,
        search: Option<bool>,
    ) -> Result<Self, ResolveError> {
        if rtype.is_metatype() || rclass.is_metaclass() {
            return Err(ResolveError::NoMetaqueries);
        }

        let qnames_to_try = resolver.qnames_to_try(&qname, search);
        let mut remaining_qnames = qnames_to_try.clone();
        remaining_qnames.reverse();

        let request = Message::make_query(0, qname.clone(), rtype, rclass);

        Ok(Resolution {
            resolver,
            qnames_to_try,
            remaining_qnames,
            rtype,
            rclass,
            tcp,
            raise_on_no_answer,
            nxdomain_responses: HashMap::new(),
            qname,
            nameservers: Vec::new(),
            current_nameservers: Vec::new(),
            errors: Vec::new(),
            nameserver: None,
            port: 0,
            tcp_attempt: false,
            retry_with_tcp: false,
            request,
            backoff: Duration::ZERO,
        })
    }

    /// Move to the next candidate name: consult the cache, or build
    /// the query and reset the per-candidate server state.
    ///
    /// # Errors
    ///
    /// `Nxdomain` when every candidate has been denied; `NoAnswer` on
    /// a cached negative answer when the caller asked to raise.
    pub(crate) fn next_request(&mut self) -> Result<RequestOutcome, ResolveError> {
        let Some(qname) = self.remaining_qnames.pop() else {
            // every candidate came back NXDOMAIN: anything else would
            // have returned before now
            return Err(ResolveError::Nxdomain(Nxdomain::new(
                std::mem::take(&mut self.qnames_to_try),
                std::mem::take(&mut self.nxdomain_responses),
            )));
        };
        self.qname = qname;

        if let Some(cache) = &self.resolver.cache {
            if let Some(answer) = cache.get(&(self.qname.clone(), self.rtype, self.rclass)) {
                tracing::trace!(qname = %self.qname, "cache HIT");
                if answer.rrset.is_none() && self.raise_on_no_answer {
                    return Err(ResolveError::NoAnswer {
                        response: Box::new(answer.response),
                    });
                }
                return Ok(RequestOutcome::Cached(Box::new(answer)));
            }
            tracing::trace!(qname = %self.qname, "cache MISS");
        }

        let mut request = Message::make_query(
            rand::thread_rng().gen(),
            self.qname.clone(),
            self.rtype,
            self.rclass,
        );
        if let Some(keyring) = &self.resolver.keyring {
            request.use_tsig(
                keyring,
                self.resolver.keyname.as_ref(),
                self.resolver.keyalgorithm.clone(),
            );
        }
        request.use_edns(
            self.resolver.edns,
            self.resolver.ednsflags,
            self.resolver.payload,
        );
        if let Some(flags) = self.resolver.flags {
            request.set_flags(flags);
        }

        self.nameservers = self.resolver.nameservers.clone();
        if self.resolver.rotate {
            self.nameservers.shuffle(&mut rand::thread_rng());
        }
        self.current_nameservers = self.nameservers.clone();
        self.errors.clear();
        self.nameserver = None;
        self.tcp_attempt = false;
        self.retry_with_tcp = false;
        self.request = request.clone();
        self.backoff = BACKOFF_INITIAL;

        Ok(RequestOutcome::Query(Box::new(request)))
    }

    /// Pick the nameserver, port, and protocol for the next attempt.
    ///
    /// # Errors
    ///
    /// `NoNameservers` when the pool has been drained of usable
    /// servers.
    pub(crate) fn next_nameserver(&mut self) -> Result<NameserverAttempt, ResolveError> {
        if self.retry_with_tcp {
            if let Some(nameserver) = &self.nameserver {
                // same server again, over TCP this time
                self.tcp_attempt = true;
                self.retry_with_tcp = false;
                return Ok(NameserverAttempt {
                    nameserver: nameserver.clone(),
                    port: self.port,
                    tcp: true,
                    backoff: None,
                });
            }
            self.retry_with_tcp = false;
        }

        let mut backoff = None;
        if self.current_nameservers.is_empty() {
            if self.nameservers.is_empty() {
                // out of things to try
                return Err(ResolveError::NoNameservers {
                    request: Box::new(self.request.clone()),
                    errors: std::mem::take(&mut self.errors),
                });
            }
            self.current_nameservers = self.nameservers.clone();
            backoff = Some(self.backoff);
            self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        }

        // consumed last-push-first
        let nameserver = self
            .current_nameservers
            .pop()
            .unwrap_or_default();
        self.port = self
            .resolver
            .nameserver_ports
            .get(&nameserver)
            .copied()
            .unwrap_or(self.resolver.port);
        self.nameserver = Some(nameserver.clone());
        self.tcp_attempt = self.tcp;

        Ok(NameserverAttempt {
            nameserver,
            port: self.port,
            tcp: self.tcp_attempt,
            backoff,
        })
    }

    /// Feed the outcome of one attempt back into the state machine.
    ///
    /// # Errors
    ///
    /// `Yxdomain` immediately; `NoAnswer` from answer construction
    /// when the caller asked to raise.
    pub(crate) fn query_result(
        &mut self,
        result: Result<Message, TransportError>,
    ) -> Result<QueryOutcome, ResolveError> {
        let nameserver = self.nameserver.clone().unwrap_or_default();

        let response = match result {
            Err(error) => {
                tracing::debug!(%nameserver, %error, "query attempt failed");
                self.errors.push(Attempt {
                    nameserver: nameserver.clone(),
                    tcp: self.tcp_attempt,
                    port: self.port,
                    error: AttemptError::Transport(error.clone()),
                    response: None,
                });

                match error {
                    // this nameserver is no good, take it out of the mix
                    TransportError::Form(_)
                    | TransportError::ShortRead { .. }
                    | TransportError::NotImplemented => {
                        self.nameservers.retain(|ns| ns != &nameserver);
                    }
                    TransportError::Truncated => {
                        if self.tcp_attempt {
                            // truncation over TCP is no good either
                            self.nameservers.retain(|ns| ns != &nameserver);
                        } else {
                            self.retry_with_tcp = true;
                        }
                    }
                    TransportError::Io(_) | TransportError::Timeout | TransportError::Http(_) => {}
                }
                return Ok(QueryOutcome::TryNext);
            }
            Ok(response) => response,
        };

        match response.rcode() {
            Rcode::NoError => {
                let answer = Answer::from_response(
                    self.qname.clone(),
                    self.rtype,
                    self.rclass,
                    response,
                    self.raise_on_no_answer,
                    Some(nameserver),
                    Some(self.port),
                )?;
                if let Some(cache) = &self.resolver.cache {
                    cache.put(
                        (self.qname.clone(), self.rtype, self.rclass),
                        answer.clone(),
                    );
                }
                Ok(QueryOutcome::Answer(Box::new(answer)))
            }
            Rcode::NxDomain => {
                tracing::debug!(qname = %self.qname, %nameserver, "denied");
                self.nxdomain_responses.insert(self.qname.clone(), response);
                Ok(QueryOutcome::NextCandidate)
            }
            Rcode::YxDomain => {
                self.errors.push(Attempt {
                    nameserver,
                    tcp: self.tcp_attempt,
                    port: self.port,
                    error: AttemptError::Yxdomain,
                    response: Some(response),
                });
                Err(ResolveError::Yxdomain)
            }
            rcode => {
                // an unhappy rcode: drop the server unless it's a
                // SERVFAIL and the resolver is set to forgive those
                if rcode != Rcode::ServFail || !self.resolver.retry_servfail {
                    self.nameservers.retain(|ns| ns != &nameserver);
                }
                tracing::debug!(%nameserver, %rcode, "unexpected rcode");
                self.errors.push(Attempt {
                    nameserver,
                    tcp: self.tcp_attempt,
                    port: self.port,
                    error: AttemptError::Rcode(rcode),
                    response: Some(response),
                });
                Ok(QueryOutcome::TryNext)
            }
        }
    }
}

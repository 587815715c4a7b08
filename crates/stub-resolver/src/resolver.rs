//! The resolver facade: configuration, the driver loop, and the
//! public lookup surface.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::Instrument;

use dns_model::message::{Message, TsigKeyring, TSIG_DEFAULT_ALGORITHM};
use dns_model::name::DomainName;
use dns_model::rr::{RecordClass, RecordType};

use crate::answer::Answer;
use crate::cache::AnswerCache;
use crate::errors::ResolveError;
use crate::resolution::{NameserverAttempt, QueryOutcome, RequestOutcome, Resolution};
use crate::transport::{NetTransport, Transport, TransportError};

/// The default port queries are sent to.
pub const DEFAULT_PORT: u16 = 53;

/// The default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// The default end-to-end budget for one `resolve` call.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(30);

/// Per-call options for [`Resolver::resolve_with`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Use TCP for the initial attempt.
    pub tcp: bool,
    /// Bind to this local address when making queries.
    pub source: Option<IpAddr>,
    /// Bind to this local port when making queries.
    pub source_port: u16,
    /// Fail with `NoAnswer` when the name exists but has no records
    /// of the requested type and class.
    pub raise_on_no_answer: bool,
    /// Override the resolver's end-to-end budget.
    pub lifetime: Option<Duration>,
    /// Use the configured search list; `None` defers to the
    /// resolver's `use_search_by_default`.
    pub search: Option<bool>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            tcp: false,
            source: None,
            source_port: 0,
            raise_on_no_answer: true,
            lifetime: None,
            search: None,
        }
    }
}

/// A DNS stub resolver: produces validated answers by consulting a
/// configured set of recursive nameservers.
///
/// Configuration is read-mostly: set it up before sharing the
/// resolver between tasks.
pub struct Resolver {
    /// The local domain, appended to unqualified names when the
    /// search list is not in play.
    pub domain: DomainName,

    /// Servers to consult, in order.  IP literals use UDP/TCP;
    /// `https://` URLs use DNS-over-HTTPS; other URL schemes are
    /// skipped.
    pub nameservers: Vec<String>,

    /// Per-server port overrides.
    pub nameserver_ports: HashMap<String, u16>,

    /// The port used when no override applies.
    pub port: u16,

    /// Suffixes appended to unqualified names.
    pub search: Vec<DomainName>,

    /// Whether `resolve` uses the search list when the caller does
    /// not say.
    pub use_search_by_default: bool,

    /// Per-attempt timeout.
    pub timeout: Duration,

    /// End-to-end budget for one `resolve` call.
    pub lifetime: Duration,

    pub(crate) keyring: Option<TsigKeyring>,
    pub(crate) keyname: Option<DomainName>,
    pub(crate) keyalgorithm: DomainName,

    /// EDNS level; negative disables EDNS.
    pub edns: i16,
    pub ednsflags: u32,
    pub payload: u16,

    /// The shared answer cache, if any.
    pub cache: Option<Arc<dyn AnswerCache>>,

    /// When set, overwrites the flags word of every outgoing request.
    pub flags: Option<u16>,

    /// Keep a server in the pool when it answers SERVFAIL.
    pub retry_servfail: bool,

    /// Shuffle the server pool per request.
    pub rotate: bool,

    /// Minimum label count at which an unqualified name is "dotted
    /// enough" to be tried as absolute before the search list.
    pub ndots: Option<usize>,

    transport: Arc<dyn Transport>,
}

fn default_tsig_algorithm() -> DomainName {
    DomainName::from_dotted_string(TSIG_DEFAULT_ALGORITHM)
        .expect("default TSIG algorithm name is valid")
}

impl Resolver {
    /// An unconfigured resolver: defaults only, no nameservers.  Use
    /// the constructors in [`crate::config`] to pick up system
    /// configuration.
    pub fn new() -> Self {
        let mut resolver = Resolver {
            domain: DomainName::root(),
            nameservers: Vec::new(),
            nameserver_ports: HashMap::new(),
            port: DEFAULT_PORT,
            search: Vec::new(),
            use_search_by_default: false,
            timeout: DEFAULT_TIMEOUT,
            lifetime: DEFAULT_LIFETIME,
            keyring: None,
            keyname: None,
            keyalgorithm: default_tsig_algorithm(),
            edns: -1,
            ednsflags: 0,
            payload: 0,
            cache: None,
            flags: None,
            retry_servfail: false,
            rotate: false,
            ndots: None,
            transport: Arc::new(NetTransport::new()),
        };
        resolver.reset();
        resolver
    }

    /// Reset all configuration to the defaults.
    pub fn reset(&mut self) {
        self.domain = DomainName::root();
        self.nameservers = Vec::new();
        self.nameserver_ports = HashMap::new();
        self.port = DEFAULT_PORT;
        self.search = Vec::new();
        self.use_search_by_default = false;
        self.timeout = DEFAULT_TIMEOUT;
        self.lifetime = DEFAULT_LIFETIME;
        self.keyring = None;
        self.keyname = None;
        self.keyalgorithm = default_tsig_algorithm();
        self.edns = -1;
        self.ednsflags = 0;
        self.payload = 0;
        self.cache = None;
        self.flags = None;
        self.retry_servfail = false;
        self.rotate = false;
        self.ndots = None;
    }

    /// Replace the transport.  Tests inject scripted transports here.
    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = transport;
    }

    /// Sign outgoing requests with a key from `keyring`.  Without a
    /// `keyname` an arbitrary key is used, so pass one whenever the
    /// keyring holds more than one key.
    pub fn use_tsig(
        &mut self,
        keyring: TsigKeyring,
        keyname: Option<DomainName>,
        algorithm: Option<DomainName>,
    ) {
        self.keyname = match keyname {
            Some(name) => Some(name),
            None => keyring.keys().next().cloned(),
        };
        self.keyring = Some(keyring);
        if let Some(algorithm) = algorithm {
            self.keyalgorithm = algorithm;
        }
    }

    /// Configure EDNS for outgoing requests.  A negative `edns`
    /// disables it.
    pub fn use_edns(&mut self, edns: i16, ednsflags: u32, payload: u16) {
        if edns < 0 {
            self.edns = -1;
            self.ednsflags = 0;
            self.payload = 0;
        } else {
            self.edns = edns;
            self.ednsflags = ednsflags;
            self.payload = payload;
        }
    }

    /// Override the flags word of every outgoing request.
    pub fn set_flags(&mut self, flags: u16) {
        self.flags = Some(flags);
    }

    /// Expand a query name into the ordered list of candidates to
    /// try.
    ///
    /// An absolute name is tried as-is.  An unqualified name is tried
    /// against the search list (when enabled), with the
    /// made-absolute name tried first when it has more than `ndots`
    /// labels and last otherwise; without a search list the local
    /// domain is appended instead.
    pub fn qnames_to_try(&self, qname: &DomainName, search: Option<bool>) -> Vec<DomainName> {
        let search = search.unwrap_or(self.use_search_by_default);

        if qname.is_absolute() {
            return vec![qname.clone()];
        }

        let mut candidates = Vec::new();
        let absolute = qname.concatenate(&DomainName::root());

        if search && !self.search.is_empty() {
            let dotted_enough = qname.label_count() > self.ndots.unwrap_or(1);
            if dotted_enough {
                candidates.extend(absolute.clone());
            }
            for suffix in &self.search {
                if let Some(candidate) = qname.concatenate(suffix) {
                    candidates.push(candidate);
                }
            }
            if !dotted_enough {
                candidates.extend(absolute);
            }
        } else {
            if qname.label_count() > 1 {
                candidates.extend(absolute);
            }
            if let Some(candidate) = qname.concatenate(&self.domain) {
                candidates.push(candidate);
            }
        }

        candidates
    }

    /// Query the configured nameservers to answer a question, with
    /// default options.
    ///
    /// # Errors
    ///
    /// See `ResolveError`.
    pub async fn resolve(
        &self,
        qname: DomainName,
        rtype: RecordType,
        rclass: RecordClass,
    ) -> Result<Answer, ResolveError> {
        self.resolve_with(qname, rtype, rclass, ResolveOptions::default())
            .await
    }

    /// Query the configured nameservers to answer a question.
    ///
    /// # Errors
    ///
    /// See `ResolveError`.
    pub async fn resolve_with(
        &self,
        qname: DomainName,
        rtype: RecordType,
        rclass: RecordClass,
        options: ResolveOptions,
    ) -> Result<Answer, ResolveError> {
        let span = tracing::error_span!("resolve", %qname, %rtype, %rclass);
        self.resolve_inner(qname, rtype, rclass, options)
            .instrument(span)
            .await
    }

    /// The textual entry point: parses the name, type, and class and
    /// calls the typed one.
    ///
    /// # Errors
    ///
    /// `Syntax` when a field does not parse; otherwise see
    /// `ResolveError`.
    pub async fn resolve_text(
        &self,
        qname: &str,
        rtype: &str,
        rclass: &str,
        options: ResolveOptions,
    ) -> Result<Answer, ResolveError> {
        let qname: DomainName = qname
            .parse()
            .map_err(|_| ResolveError::Syntax(format!("bad domain name '{qname}'")))?;
        let rtype: RecordType = rtype
            .parse()
            .map_err(|_| ResolveError::Syntax(format!("bad record type '{rtype}'")))?;
        let rclass: RecordClass = rclass
            .parse()
            .map_err(|_| ResolveError::Syntax(format!("bad record class '{rclass}'")))?;

        self.resolve_with(qname, rtype, rclass, options).await
    }

    /// Reverse-map an address and query PTR.
    ///
    /// # Errors
    ///
    /// See `ResolveError`.
    pub async fn resolve_address(
        &self,
        address: IpAddr,
        options: ResolveOptions,
    ) -> Result<Answer, ResolveError> {
        self.resolve_with(
            DomainName::reverse(address),
            RecordType::PTR,
            RecordClass::IN,
            options,
        )
        .await
    }

    async fn resolve_inner(
        &self,
        qname: DomainName,
        rtype: RecordType,
        rclass: RecordClass,
        options: ResolveOptions,
    ) -> Result<Answer, ResolveError> {
        let mut resolution = Resolution::new(
            self,
            qname,
            rtype,
            rclass,
            options.tcp,
            options.raise_on_no_answer,
            options.search,
        )?;
        let start = SystemTime::now();

        loop {
            let request = match resolution.next_request()? {
                RequestOutcome::Cached(answer) => return Ok(*answer),
                RequestOutcome::Query(request) => request,
            };

            loop {
                let attempt = resolution.next_nameserver()?;
                if let Some(backoff) = attempt.backoff {
                    tokio::time::sleep(backoff).await;
                }
                let attempt_timeout = self.compute_timeout(start, options.lifetime)?;

                let Some(result) = self
                    .dispatch(&request, &attempt, &options, attempt_timeout)
                    .await
                else {
                    // a nameserver this resolver cannot speak to
                    continue;
                };

                match resolution.query_result(result)? {
                    QueryOutcome::Answer(answer) => return Ok(*answer),
                    QueryOutcome::NextCandidate => break,
                    QueryOutcome::TryNext => (),
                }
            }
        }
    }

    /// Send one request.  Returns `None` when the nameserver is
    /// neither an IP literal nor an `https://` URL: such entries are
    /// skipped for the attempt.
    async fn dispatch(
        &self,
        request: &Message,
        attempt: &NameserverAttempt,
        options: &ResolveOptions,
        attempt_timeout: Duration,
    ) -> Option<Result<Message, TransportError>> {
        if let Ok(address) = attempt.nameserver.parse::<IpAddr>() {
            let result = if attempt.tcp {
                self.transport
                    .tcp(
                        request,
                        address,
                        attempt.port,
                        options.source,
                        options.source_port,
                        attempt_timeout,
                    )
                    .await
            } else {
                self.transport
                    .udp(
                        request,
                        address,
                        attempt.port,
                        options.source,
                        options.source_port,
                        attempt_timeout,
                    )
                    .await
            };
            return Some(result);
        }

        match attempt.nameserver.split_once("://") {
            Some(("https", _)) => Some(
                self.transport
                    .https(request, &attempt.nameserver, attempt_timeout)
                    .await,
            ),
            _ => {
                tracing::debug!(nameserver = %attempt.nameserver, "skipping unusable nameserver");
                None
            }
        }
    }

    /// The per-attempt timeout: whatever is smaller out of the
    /// configured timeout and what is left of the lifetime budget.
    ///
    /// Clock regressions up to one second are masked; larger ones
    /// give up immediately.
    fn compute_timeout(
        &self,
        start: SystemTime,
        lifetime: Option<Duration>,
    ) -> Result<Duration, ResolveError> {
        let lifetime = lifetime.unwrap_or(self.lifetime);

        let elapsed = match SystemTime::now().duration_since(start) {
            Ok(elapsed) => elapsed,
            Err(error) => {
                if error.duration() > Duration::from_secs(1) {
                    // time going backwards is bad, just give up
                    return Err(ResolveError::Timeout {
                        duration: Duration::ZERO,
                    });
                }
                // a small regression can happen under some
                // hypervisors: pretend it didn't
                Duration::ZERO
            }
        };

        if elapsed >= lifetime {
            return Err(ResolveError::Timeout { duration: elapsed });
        }

        Ok((lifetime - elapsed).min(self.timeout))
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the name of the zone containing `name` by climbing towards
/// the root one SOA query at a time.
///
/// # Errors
///
/// `NotAbsolute` for a relative input; `NoRootSoa` if the climb
/// passes the root, which only happens with badly misconfigured
/// servers; otherwise whatever the underlying `resolve` calls fail
/// with, except that NXDOMAIN and `NoAnswer` are absorbed.
pub async fn zone_for_name(
    name: DomainName,
    rclass: RecordClass,
    tcp: bool,
    resolver: &Resolver,
) -> Result<DomainName, ResolveError> {
    if !name.is_absolute() {
        return Err(ResolveError::NotAbsolute { name });
    }

    let mut name = name;
    loop {
        let options = ResolveOptions {
            tcp,
            ..ResolveOptions::default()
        };
        match resolver
            .resolve_with(name.clone(), RecordType::SOA, rclass, options)
            .await
        {
            Ok(answer) => {
                if let Some(rrset) = &answer.rrset {
                    if rrset.name == name {
                        return Ok(name);
                    }
                    // CNAMEd or DNAMEd: the zone is higher up
                }
            }
            Err(ResolveError::Nxdomain(_) | ResolveError::NoAnswer { .. }) => (),
            Err(error) => return Err(error),
        }

        name = match name.parent() {
            Some(parent) => parent,
            None => return Err(ResolveError::NoRootSoa),
        };
    }
}

#[cfg(test)]
mod tests {
    use dns_model::test_util::*;

    use super::*;

    fn resolver_with_search() -> Resolver {
        let mut resolver = Resolver::new();
        resolver.domain = domain("home.example.");
        resolver.search = vec![domain("corp.example."), domain("example.")];
        resolver
    }

    #[test]
    fn absolute_names_are_tried_alone() {
        let resolver = resolver_with_search();
        assert_eq!(
            vec![domain("www.example.com.")],
            resolver.qnames_to_try(&domain("www.example.com."), Some(true))
        );
    }

    #[test]
    fn multi_label_relative_name_without_search() {
        let resolver = resolver_with_search();
        assert_eq!(
            vec![domain("www.example."), domain("www.example.home.example.")],
            resolver.qnames_to_try(&domain("www.example"), Some(false))
        );
    }

    #[test]
    fn single_label_relative_name_without_search() {
        let resolver = resolver_with_search();
        assert_eq!(
            vec![domain("host.home.example.")],
            resolver.qnames_to_try(&domain("host"), Some(false))
        );
    }

    #[test]
    fn dotted_enough_names_try_absolute_first() {
        let resolver = resolver_with_search();
        assert_eq!(
            vec![
                domain("www.internal."),
                domain("www.internal.corp.example."),
                domain("www.internal.example."),
            ],
            resolver.qnames_to_try(&domain("www.internal"), Some(true))
        );
    }

    #[test]
    fn sparse_names_try_the_search_list_first() {
        let resolver = resolver_with_search();
        assert_eq!(
            vec![
                domain("host.corp.example."),
                domain("host.example."),
                domain("host."),
            ],
            resolver.qnames_to_try(&domain("host"), Some(true))
        );
    }

    #[test]
    fn ndots_moves_the_absolute_candidate() {
        let mut resolver = resolver_with_search();
        resolver.ndots = Some(2);

        // two labels is no longer dotted enough
        assert_eq!(
            vec![
                domain("www.internal.corp.example."),
                domain("www.internal.example."),
                domain("www.internal."),
            ],
            resolver.qnames_to_try(&domain("www.internal"), Some(true))
        );
    }

    #[test]
    fn search_defaults_to_resolver_setting() {
        let mut resolver = resolver_with_search();

        assert_eq!(
            vec![domain("host.home.example.")],
            resolver.qnames_to_try(&domain("host"), None)
        );

        resolver.use_search_by_default = true;
        assert_eq!(
            vec![
                domain("host.corp.example."),
                domain("host.example."),
                domain("host."),
            ],
            resolver.qnames_to_try(&domain("host"), None)
        );
    }

    #[test]
    fn compute_timeout_respects_both_budgets() {
        let resolver = Resolver::new();

        // fresh start: per-attempt timeout is the binding constraint
        let timeout = resolver
            .compute_timeout(SystemTime::now(), Some(Duration::from_secs(30)))
            .unwrap();
        assert!(timeout <= DEFAULT_TIMEOUT);

        // almost out of lifetime: the remaining budget is
        let start = SystemTime::now() - Duration::from_millis(29_500);
        let timeout = resolver
            .compute_timeout(start, Some(Duration::from_secs(30)))
            .unwrap();
        assert!(timeout <= Duration::from_millis(500));
    }

    #[test]
    fn compute_timeout_exhausted_lifetime() {
        let resolver = Resolver::new();
        let start = SystemTime::now() - Duration::from_secs(31);

        let result = resolver.compute_timeout(start, None);
        match result {
            Err(ResolveError::Timeout { duration }) => {
                assert!(duration >= Duration::from_secs(30));
            }
            _ => panic!("expected Timeout"),
        }
    }

    #[test]
    fn compute_timeout_masks_small_clock_regressions() {
        let resolver = Resolver::new();

        let start = SystemTime::now() + Duration::from_millis(500);
        assert!(resolver.compute_timeout(start, None).is_ok());

        let start = SystemTime::now() + Duration::from_secs(5);
        assert!(matches!(
            resolver.compute_timeout(start, None),
            Err(ResolveError::Timeout { .. })
        ));
    }
}

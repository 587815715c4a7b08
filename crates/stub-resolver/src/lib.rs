#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]

pub mod answer;
pub mod cache;
pub mod config;
pub mod errors;
pub mod lru;
pub mod resolver;
pub mod transport;

mod resolution;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use dns_model::name::DomainName;
use dns_model::rr::{RecordClass, RecordType};

pub use crate::answer::Answer;
pub use crate::errors::ResolveError;
pub use crate::resolver::{ResolveOptions, Resolver};

lazy_static! {
    static ref DEFAULT_RESOLVER: RwLock<Option<Arc<Resolver>>> = RwLock::new(None);
}

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] default resolver lock poisoned, cannot recover from this - aborting";

/// The process-wide default resolver, configured from the system the
/// first time it is asked for.
///
/// # Errors
///
/// `NoResolverConfiguration` if system configuration cannot be read.
pub fn default_resolver() -> Result<Arc<Resolver>, ResolveError> {
    if let Some(resolver) = DEFAULT_RESOLVER.read().expect(LOCK_POISON_MESSAGE).as_ref() {
        return Ok(resolver.clone());
    }

    let mut slot = DEFAULT_RESOLVER.write().expect(LOCK_POISON_MESSAGE);
    if let Some(resolver) = slot.as_ref() {
        return Ok(resolver.clone());
    }

    let resolver = Arc::new(Resolver::from_system()?);
    *slot = Some(resolver.clone());
    Ok(resolver)
}

/// Re-initialise the default resolver, re-reading the system
/// configuration immediately.
///
/// # Errors
///
/// `NoResolverConfiguration` if system configuration cannot be read.
pub fn reset_default_resolver() -> Result<(), ResolveError> {
    let resolver = Arc::new(Resolver::from_system()?);
    *DEFAULT_RESOLVER.write().expect(LOCK_POISON_MESSAGE) = Some(resolver);
    Ok(())
}

/// Resolve a question using the default resolver.
///
/// # Errors
///
/// See `ResolveError`.
pub async fn resolve(
    qname: DomainName,
    rtype: RecordType,
    rclass: RecordClass,
) -> Result<Answer, ResolveError> {
    default_resolver()?.resolve(qname, rtype, rclass).await
}

/// Reverse-resolve an address using the default resolver.
///
/// # Errors
///
/// See `ResolveError`.
pub async fn resolve_address(address: IpAddr) -> Result<Answer, ResolveError> {
    default_resolver()?
        .resolve_address(address, ResolveOptions::default())
        .await
}

/// Find the zone containing `name`, using the default resolver.
///
/// # Errors
///
/// See [`resolver::zone_for_name`].
pub async fn zone_for_name(
    name: DomainName,
    rclass: RecordClass,
) -> Result<DomainName, ResolveError> {
    resolver::zone_for_name(name, rclass, false, &*default_resolver()?).await
}

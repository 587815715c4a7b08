//! Reading resolver configuration.
//!
//! Two equivalent surfaces: POSIX `resolv.conf` text, and the
//! registry-style key/value pairs some platforms provide.  Both map
//! onto the same `Resolver` fields.

use std::fs;
use std::path::Path;
use std::time::Duration;

use dns_model::name::DomainName;

use crate::errors::ResolveError;
use crate::resolver::Resolver;

/// Where POSIX systems keep their resolver configuration.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

impl Resolver {
    /// A resolver configured the normal way for this system.
    ///
    /// # Errors
    ///
    /// `NoResolverConfiguration` if the configuration cannot be read
    /// or names no nameservers.
    pub fn from_system() -> Result<Self, ResolveError> {
        Self::from_resolv_conf(RESOLV_CONF)
    }

    /// A resolver configured from a `resolv.conf`-format file.
    ///
    /// # Errors
    ///
    /// `NoResolverConfiguration` if the file cannot be read or names
    /// no nameservers.
    pub fn from_resolv_conf<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        let mut resolver = Resolver::new();
        resolver.read_resolv_conf(path)?;
        Ok(resolver)
    }

    /// Merge a `resolv.conf`-format file into this configuration.
    ///
    /// # Errors
    ///
    /// `NoResolverConfiguration` if the file cannot be read, or if no
    /// nameservers are configured afterwards.
    pub fn read_resolv_conf<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ResolveError> {
        let Ok(text) = fs::read_to_string(path) else {
            // doesn't exist, can't be read, etc.
            return Err(ResolveError::NoResolverConfiguration);
        };

        self.apply_resolv_conf(&text);

        if self.nameservers.is_empty() {
            return Err(ResolveError::NoResolverConfiguration);
        }
        Ok(())
    }

    /// Interpret `resolv.conf` text: `nameserver`, `domain`,
    /// `search`, and the `rotate`, `edns0`, `timeout:n`, and
    /// `ndots:n` options.  Unrecognised lines and malformed integer
    /// options are ignored.
    pub fn apply_resolv_conf(&mut self, text: &str) {
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();

            // any line with fewer than two tokens is malformed
            if tokens.len() < 2 {
                continue;
            }

            match tokens[0] {
                "nameserver" => self.nameservers.push(tokens[1].to_string()),
                "domain" => {
                    if let Some(name) = parse_suffix(tokens[1]) {
                        self.domain = name;
                    }
                }
                "search" => {
                    for token in &tokens[1..] {
                        if let Some(name) = parse_suffix(token) {
                            self.search.push(name);
                        }
                    }
                }
                "options" => {
                    for option in &tokens[1..] {
                        self.apply_option(option);
                    }
                }
                _ => (),
            }
        }
    }

    fn apply_option(&mut self, option: &str) {
        if option == "rotate" {
            self.rotate = true;
        } else if option == "edns0" {
            self.use_edns(0, 0, 0);
        } else if option.contains("timeout") {
            if let Some(seconds) = integer_option(option) {
                self.timeout = Duration::from_secs(seconds);
            }
        } else if option.contains("ndots") {
            if let Some(ndots) = integer_option(option) {
                self.ndots = usize::try_from(ndots).ok();
            }
        }
    }

    /// Apply one registry-style key/value pair.  List values use
    /// either space or comma as a delimiter, depending on the
    /// platform version; the delimiter is auto-detected.
    pub fn apply_registry_key(&mut self, key: &str, value: &str) {
        match key {
            "NameServer" | "DhcpNameServer" => {
                for server in split_registry_list(value) {
                    if !self.nameservers.iter().any(|ns| ns == server) {
                        self.nameservers.push(server.to_string());
                    }
                }
            }
            "Domain" | "DhcpDomain" => {
                if let Some(name) = parse_suffix(value) {
                    self.domain = name;
                }
            }
            "SearchList" => {
                for suffix in split_registry_list(value) {
                    if let Some(name) = parse_suffix(suffix) {
                        if !self.search.contains(&name) {
                            self.search.push(name);
                        }
                    }
                }
            }
            _ => (),
        }
    }
}

/// Configuration names may be written without a trailing dot; they
/// are always absolute.
fn parse_suffix(s: &str) -> Option<DomainName> {
    let name = DomainName::from_dotted_string(s)?;
    if name.is_absolute() {
        Some(name)
    } else {
        name.concatenate(&DomainName::root())
    }
}

fn integer_option(option: &str) -> Option<u64> {
    option.split(':').nth(1)?.parse().ok()
}

fn split_registry_list(entry: &str) -> impl Iterator<Item = &str> {
    // the registry switches the delimiter between ' ' and ',' in
    // various versions; a singleton is treated as a space-separated
    // list
    let split_char = if entry.contains(' ') {
        ' '
    } else if entry.contains(',') {
        ','
    } else {
        ' '
    };

    entry.split(split_char).filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use dns_model::test_util::*;

    use super::*;

    #[test]
    fn full_resolv_conf() {
        let mut resolver = Resolver::new();
        resolver.apply_resolv_conf(
            "# a comment\n\
             ; another comment\n\
             nameserver 192.0.2.1\n\
             nameserver 192.0.2.2\n\
             domain home.example\n\
             search corp.example example\n\
             options rotate edns0 timeout:5 ndots:2\n",
        );

        assert_eq!(vec!["192.0.2.1", "192.0.2.2"], resolver.nameservers);
        assert_eq!(domain("home.example."), resolver.domain);
        assert_eq!(
            vec![domain("corp.example."), domain("example.")],
            resolver.search
        );
        assert!(resolver.rotate);
        assert_eq!(0, resolver.edns);
        assert_eq!(Duration::from_secs(5), resolver.timeout);
        assert_eq!(Some(2), resolver.ndots);
    }

    #[test]
    fn short_and_unknown_lines_are_ignored() {
        let mut resolver = Resolver::new();
        resolver.apply_resolv_conf(
            "nameserver\n\
             bogus 192.0.2.9\n\
             nameserver 192.0.2.1\n",
        );

        assert_eq!(vec!["192.0.2.1"], resolver.nameservers);
    }

    #[test]
    fn malformed_options_are_ignored() {
        let mut resolver = Resolver::new();
        resolver.apply_resolv_conf(
            "nameserver 192.0.2.1\n\
             options timeout:abc ndots: rotate\n",
        );

        assert_eq!(Duration::from_secs(2), resolver.timeout);
        assert_eq!(None, resolver.ndots);
        assert!(resolver.rotate);
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let mut resolver = Resolver::new();
        let result = resolver.read_resolv_conf("/nonexistent/resolv.conf");
        assert!(matches!(
            result,
            Err(ResolveError::NoResolverConfiguration)
        ));
    }

    #[test]
    fn empty_nameserver_list_is_a_configuration_error() {
        let path = std::env::temp_dir().join("resolv-conf-domain-only");
        fs::write(&path, "domain home.example\n").unwrap();

        let mut resolver = Resolver::new();
        let result = resolver.read_resolv_conf(&path);
        assert!(matches!(
            result,
            Err(ResolveError::NoResolverConfiguration)
        ));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn registry_space_delimited_lists() {
        let mut resolver = Resolver::new();
        resolver.apply_registry_key("NameServer", "192.0.2.1 192.0.2.2");
        resolver.apply_registry_key("SearchList", "corp.example example");

        assert_eq!(vec!["192.0.2.1", "192.0.2.2"], resolver.nameservers);
        assert_eq!(
            vec![domain("corp.example."), domain("example.")],
            resolver.search
        );
    }

    #[test]
    fn registry_comma_delimited_lists() {
        let mut resolver = Resolver::new();
        resolver.apply_registry_key("DhcpNameServer", "192.0.2.1,192.0.2.2");

        assert_eq!(vec!["192.0.2.1", "192.0.2.2"], resolver.nameservers);
    }

    #[test]
    fn registry_lists_deduplicate() {
        let mut resolver = Resolver::new();
        resolver.apply_registry_key("NameServer", "192.0.2.1");
        resolver.apply_registry_key("DhcpNameServer", "192.0.2.1 192.0.2.2");

        assert_eq!(vec!["192.0.2.1", "192.0.2.2"], resolver.nameservers);
    }

    #[test]
    fn registry_domain_keys() {
        let mut resolver = Resolver::new();
        resolver.apply_registry_key("Domain", "home.example");
        assert_eq!(domain("home.example."), resolver.domain);

        resolver.apply_registry_key("DhcpDomain", "lan.example");
        assert_eq!(domain("lan.example."), resolver.domain);
    }
}

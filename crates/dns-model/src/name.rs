//! Domain names as the resolver sees them: a sequence of labels plus
//! an absolute / relative distinction.  A relative name is one still
//! waiting to have a search suffix or the local domain appended to it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A label can be no longer than 63 octets.
pub const LABEL_MAX_LEN: usize = 63;

/// An absolute name can be no longer than 255 octets in wire form,
/// including both length and label octets.
pub const DOMAINNAME_MAX_LEN: usize = 255;

/// A domain name.
///
/// Labels are stored lowercased, so equality and hashing are canonical
/// (case-insensitive) without any extra work at comparison time.  The
/// root label is not stored: the root name has zero labels and is
/// absolute.
///
/// An absolute name (`www.example.com.`) is a complete query name.  A
/// relative name (`www.example`) only makes sense as input to the
/// search-list machinery.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainName {
    labels: Vec<Vec<u8>>,
    absolute: bool,
}

impl DomainName {
    /// The root name, `.`
    pub fn root() -> Self {
        DomainName {
            labels: Vec::new(),
            absolute: true,
        }
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.labels.is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// The labels, without the root label.
    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    /// How many labels the name has, not counting the root label.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Build a name from labels, validating and lowercasing them.
    ///
    /// Returns `None` if any label is empty, non-ASCII, or over 63
    /// octets, or if the whole name would not fit in 255 octets of
    /// wire format.
    pub fn from_labels(mixed_case_labels: Vec<Vec<u8>>, absolute: bool) -> Option<Self> {
        let mut labels = Vec::with_capacity(mixed_case_labels.len());
        let mut wire_len = 1;

        for mc_label in &mixed_case_labels {
            if mc_label.is_empty() || mc_label.len() > LABEL_MAX_LEN {
                return None;
            }

            let mut label = Vec::with_capacity(mc_label.len());
            for octet in mc_label {
                if !octet.is_ascii() {
                    return None;
                }
                label.push(octet.to_ascii_lowercase());
            }

            wire_len += 1 + label.len();
            labels.push(label);
        }

        if wire_len > DOMAINNAME_MAX_LEN {
            return None;
        }

        Some(Self { labels, absolute })
    }

    /// Parse a dotted string.  A trailing `.` makes the name absolute;
    /// `.` alone is the root.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s == "." {
            return Some(Self::root());
        }
        if s.is_empty() {
            return None;
        }

        let (s, absolute) = match s.strip_suffix('.') {
            Some(prefix) => (prefix, true),
            None => (s, false),
        };

        let labels = s.split('.').map(|l| l.as_bytes().to_vec()).collect();
        Self::from_labels(labels, absolute)
    }

    pub fn to_dotted_string(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }

        let mut out = String::new();
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            for octet in label {
                out.push(*octet as char);
            }
        }
        if self.absolute {
            out.push('.');
        }

        out
    }

    /// The name with its leftmost label removed.  Returns `None` for
    /// the root and for relative names with nothing left to strip.
    pub fn parent(&self) -> Option<Self> {
        if self.labels.is_empty() {
            return None;
        }

        Some(Self {
            labels: self.labels[1..].to_vec(),
            absolute: self.absolute,
        })
    }

    /// Append `suffix` to this name.  The result is absolute exactly
    /// when the suffix is.
    ///
    /// Returns `None` if this name is already absolute (there is
    /// nothing meaningful to append to it) or if the combined name
    /// would be too long.
    pub fn concatenate(&self, suffix: &DomainName) -> Option<Self> {
        if self.absolute {
            return None;
        }

        let mut labels = self.labels.clone();
        labels.extend(suffix.labels.iter().cloned());

        let wire_len: usize = 1 + labels.iter().map(|l| 1 + l.len()).sum::<usize>();
        if wire_len > DOMAINNAME_MAX_LEN {
            return None;
        }

        Some(Self {
            labels,
            absolute: suffix.absolute,
        })
    }

    /// The reverse-mapping name for an address: `in-addr.arpa.` for
    /// IPv4 and `ip6.arpa.` for IPv6.
    pub fn reverse(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(addr) => Self::reverse_ipv4(addr),
            IpAddr::V6(addr) => Self::reverse_ipv6(addr),
        }
    }

    pub fn reverse_ipv4(addr: Ipv4Addr) -> Self {
        let mut labels = Vec::with_capacity(6);
        for octet in addr.octets().iter().rev() {
            labels.push(octet.to_string().into_bytes());
        }
        labels.push(b"in-addr".to_vec());
        labels.push(b"arpa".to_vec());

        Self {
            labels,
            absolute: true,
        }
    }

    pub fn reverse_ipv6(addr: Ipv6Addr) -> Self {
        let mut labels = Vec::with_capacity(34);
        for octet in addr.octets().iter().rev() {
            labels.push(vec![HEX_DIGITS[usize::from(octet & 0x0f)]]);
            labels.push(vec![HEX_DIGITS[usize::from(octet >> 4)]]);
        }
        labels.push(b"ip6".to_vec());
        labels.push(b"arpa".to_vec());

        Self {
            labels,
            absolute: true,
        }
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainName")
            .field("to_dotted_string()", &self.to_dotted_string())
            .finish()
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.to_dotted_string())
    }
}

impl FromStr for DomainName {
    type Err = DomainNameFromStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = DomainName::from_dotted_string(s) {
            Ok(name)
        } else {
            Err(DomainNameFromStr::NoParse)
        }
    }
}

/// Errors that can arise when converting a `&str` into a `DomainName`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DomainNameFromStr {
    NoParse,
}

impl fmt::Display for DomainNameFromStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not parse string to domain name")
    }
}

impl std::error::Error for DomainNameFromStr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for DomainName {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_labels = u.int_in_range::<usize>(1..=6)?;
        let mut labels = Vec::new();
        for _ in 0..num_labels {
            let label_len = u.int_in_range::<u8>(1..=16)?;
            let mut label = Vec::new();
            for _ in 0..label_len {
                let b = u.int_in_range::<u8>(97..=122)?;
                label.push(b);
            }
            labels.push(label);
        }
        Ok(DomainName::from_labels(labels, true).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use fake::Fake;

    use super::*;

    #[test]
    fn root_conversions() {
        assert_eq!(Some(DomainName::root()), DomainName::from_dotted_string("."));
        assert_eq!(".", DomainName::root().to_dotted_string());
        assert!(DomainName::root().is_absolute());
        assert_eq!(0, DomainName::root().label_count());
    }

    #[test]
    fn trailing_dot_means_absolute() {
        let absolute = DomainName::from_dotted_string("www.example.com.").unwrap();
        let relative = DomainName::from_dotted_string("www.example.com").unwrap();

        assert!(absolute.is_absolute());
        assert!(!relative.is_absolute());
        assert_ne!(absolute, relative);
        assert_eq!(3, absolute.label_count());
        assert_eq!(3, relative.label_count());
    }

    #[test]
    fn comparison_is_case_insensitive() {
        assert_eq!(
            DomainName::from_dotted_string("WWW.EXAMPLE.COM."),
            DomainName::from_dotted_string("www.example.com.")
        );
    }

    #[test]
    fn empty_labels_rejected() {
        assert_eq!(None, DomainName::from_dotted_string(""));
        assert_eq!(None, DomainName::from_dotted_string("www..example.com."));
        assert_eq!(None, DomainName::from_dotted_string(".example.com."));
    }

    #[test]
    fn long_labels_rejected() {
        let label = "x".repeat(64);
        assert_eq!(None, DomainName::from_dotted_string(&format!("{label}.com.")));

        let label = "x".repeat(63);
        assert!(DomainName::from_dotted_string(&format!("{label}.com.")).is_some());
    }

    #[test]
    fn long_names_rejected() {
        let label = "x".repeat(63);
        let name = format!("{label}.{label}.{label}.{label}.");
        assert_eq!(None, DomainName::from_dotted_string(&name));
    }

    #[test]
    fn parent_strips_leftmost_label() {
        let name = DomainName::from_dotted_string("www.example.com.").unwrap();
        let parent = name.parent().unwrap();
        let grandparent = parent.parent().unwrap();

        assert_eq!("example.com.", parent.to_dotted_string());
        assert_eq!("com.", grandparent.to_dotted_string());
        assert_eq!(Some(DomainName::root()), grandparent.parent());
        assert_eq!(None, DomainName::root().parent());
    }

    #[test]
    fn concatenate_follows_suffix_absoluteness() {
        let host = DomainName::from_dotted_string("host").unwrap();
        let suffix = DomainName::from_dotted_string("corp.example.").unwrap();

        let combined = host.concatenate(&suffix).unwrap();
        assert_eq!("host.corp.example.", combined.to_dotted_string());

        let combined = host.concatenate(&DomainName::root()).unwrap();
        assert_eq!("host.", combined.to_dotted_string());
    }

    #[test]
    fn concatenate_rejects_absolute_prefix() {
        let host = DomainName::from_dotted_string("host.").unwrap();
        assert_eq!(None, host.concatenate(&DomainName::root()));
    }

    #[test]
    fn concatenate_rejects_overlong_result() {
        let label = "x".repeat(63);
        let prefix = DomainName::from_dotted_string(&format!("{label}.{label}")).unwrap();
        let suffix = DomainName::from_dotted_string(&format!("{label}.{label}.")).unwrap();
        assert_eq!(None, prefix.concatenate(&suffix));
    }

    #[test]
    fn reverse_ipv4() {
        assert_eq!(
            "34.216.184.93.in-addr.arpa.",
            DomainName::reverse(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))).to_dotted_string()
        );
    }

    #[test]
    fn reverse_ipv6() {
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(
            "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa.",
            DomainName::reverse(IpAddr::V6(addr)).to_dotted_string()
        );
    }

    #[test]
    fn dotted_string_roundtrips() {
        for _ in 0..100 {
            let labels_len = (1..5).fake::<usize>();

            let mut input = String::new();
            for i in 0..labels_len {
                if i > 0 {
                    input.push('.');
                }
                let label_len = (1..10).fake::<usize>();
                for _ in 0..label_len {
                    let chr = (97..123).fake::<u8>();
                    input.push(chr as char);
                }
            }
            input.push('.');

            assert_eq!(
                Some(input.clone()),
                DomainName::from_dotted_string(&input).map(|d| d.to_dotted_string())
            );
        }
    }
}

//! Connection admission by source address

use std::net::IpAddr;

use crate::state::canonical_ip;

/// Addresses allowed to talk to the gateway without being a known peer.
///
/// Entries are exact addresses (`10.0.0.5`, `::1`) or IPv4 prefixes ending
/// with a dot (`192.168.1.`).
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    exact: Vec<IpAddr>,
    prefixes: Vec<String>,
}

impl AllowList {
    /// Build from configured entries. Entries that are neither an address
    /// nor a prefix are logged and ignored.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.ends_with('.') {
                list.prefixes.push(entry.to_string());
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                list.exact.push(canonical_ip(ip));
            } else {
                tracing::warn!("Ignoring allow-list entry {:?}", entry);
            }
        }
        list
    }

    /// Whether `ip` is admitted
    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = canonical_ip(ip);
        if self.exact.contains(&ip) {
            return true;
        }
        let text = ip.to_string();
        self.prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_prefix_entries() {
        let list = AllowList::new(&["127.0.0.1", "::1", "10.1.", "not an address"]);

        assert!(list.allows("127.0.0.1".parse().unwrap()));
        assert!(list.allows("::1".parse().unwrap()));
        assert!(list.allows("10.1.44.2".parse().unwrap()));
        assert!(!list.allows("10.10.0.1".parse().unwrap()));
        assert!(!list.allows("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_mapped_ipv6_is_normalized() {
        let list = AllowList::new(&["192.168.1."]);
        assert!(list.allows("::ffff:192.168.1.20".parse().unwrap()));

        let list = AllowList::new(&["::ffff:127.0.0.1"]);
        assert!(list.allows("127.0.0.1".parse().unwrap()));
    }
}

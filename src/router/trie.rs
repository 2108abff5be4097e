use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

/// Domain suffix trie.
///
/// Domains are inserted in reverse-label order, e.g. "www.example.com"
/// is stored as ["com", "example", "www"]. Matching only happens on label
/// boundaries, so "example.com" never matches "notexample.com".
pub struct DomainTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

struct TrieNode<V> {
    children: HashMap<String, TrieNode<V>>,
    /// If Some, this node is a terminal and holds the associated value.
    value: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            value: None,
        }
    }
}

impl<V> Default for DomainTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DomainTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            len: 0,
        }
    }

    /// Insert a domain suffix. Re-inserting the same suffix overwrites the
    /// previous value.
    pub fn insert(&mut self, domain: &str, value: V) {
        let mut node = &mut self.root;
        for label in domain.split('.').rev().filter(|l| !l.is_empty()) {
            node = node
                .children
                .entry(label.to_ascii_lowercase())
                .or_insert_with(TrieNode::new);
        }
        if node.value.replace(value).is_none() {
            self.len += 1;
        }
    }

    /// Longest matching suffix for the given domain.
    pub fn find(&self, domain: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut best_match = None;

        for label in domain.split('.').rev().filter(|l| !l.is_empty()) {
            let lower = label.to_ascii_lowercase();
            match node.children.get(&lower) {
                Some(child) => {
                    if child.value.is_some() {
                        best_match = child.value.as_ref();
                    }
                    node = child;
                }
                None => break,
            }
        }

        best_match
    }

    pub fn matches(&self, domain: &str) -> bool {
        self.find(domain).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root = TrieNode::new();
        self.len = 0;
    }
}

/// Binary trie for IP CIDR longest-prefix matching.
/// IPv4 and IPv6 prefixes live under separate roots.
pub struct IpPrefixTrie<V> {
    root_v4: IpTrieNode<V>,
    root_v6: IpTrieNode<V>,
    len: usize,
}

struct IpTrieNode<V> {
    children: [Option<Box<IpTrieNode<V>>>; 2],
    value: Option<V>,
}

impl<V> IpTrieNode<V> {
    fn new() -> Self {
        Self {
            children: [None, None],
            value: None,
        }
    }
}

impl<V> Default for IpPrefixTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IpPrefixTrie<V> {
    pub fn new() -> Self {
        Self {
            root_v4: IpTrieNode::new(),
            root_v6: IpTrieNode::new(),
            len: 0,
        }
    }

    /// Insert a CIDR prefix. The same prefix inserted twice keeps the later value.
    pub fn insert(&mut self, cidr: &IpNet, value: V) {
        let (bits, prefix_len, root) = match cidr {
            IpNet::V4(v4) => (
                octets_to_bits(&v4.addr().octets()),
                v4.prefix_len(),
                &mut self.root_v4,
            ),
            IpNet::V6(v6) => (
                octets_to_bits(&v6.addr().octets()),
                v6.prefix_len(),
                &mut self.root_v6,
            ),
        };

        let mut node = root;
        for &bit in bits.iter().take(prefix_len as usize) {
            node = node.children[bit as usize].get_or_insert_with(|| Box::new(IpTrieNode::new()));
        }
        if node.value.replace(value).is_none() {
            self.len += 1;
        }
    }

    /// Find the longest prefix match for an IP address.
    pub fn longest_prefix_match(&self, addr: IpAddr) -> Option<&V> {
        let (bits, root) = match addr {
            IpAddr::V4(v4) => (octets_to_bits(&v4.octets()), &self.root_v4),
            IpAddr::V6(v6) => (octets_to_bits(&v6.octets()), &self.root_v6),
        };

        let mut node = root;
        let mut best = node.value.as_ref();

        for &bit in &bits {
            match &node.children[bit as usize] {
                Some(child) => {
                    node = child;
                    if node.value.is_some() {
                        best = node.value.as_ref();
                    }
                }
                None => break,
            }
        }

        best
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.longest_prefix_match(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root_v4 = IpTrieNode::new();
        self.root_v6 = IpTrieNode::new();
        self.len = 0;
    }
}

// MSB first
fn octets_to_bits(octets: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(octets.len() * 8);
    for &byte in octets {
        for i in (0..8).rev() {
            bits.push((byte >> i) & 1);
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trie_insert_and_find() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com", 1);
        trie.insert("google.com", 2);

        assert_eq!(trie.find("example.com"), Some(&1));
        assert_eq!(trie.find("www.example.com"), Some(&1));
        assert_eq!(trie.find("sub.www.example.com"), Some(&1));
        assert_eq!(trie.find("google.com"), Some(&2));
        assert_eq!(trie.find("notexample.com"), None);
    }

    #[test]
    fn trie_case_insensitive() {
        let mut trie = DomainTrie::new();
        trie.insert("Example.COM", 1);

        assert_eq!(trie.find("example.com"), Some(&1));
        assert_eq!(trie.find("www.Example.Com"), Some(&1));
    }

    #[test]
    fn trie_longest_match() {
        let mut trie = DomainTrie::new();
        trie.insert("com", 1);
        trie.insert("example.com", 2);
        trie.insert("www.example.com", 3);

        assert_eq!(trie.find("www.example.com"), Some(&3));
        assert_eq!(trie.find("sub.example.com"), Some(&2));
        assert_eq!(trie.find("other.com"), Some(&1));
    }

    #[test]
    fn trie_later_insert_overwrites() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com", "direct");
        trie.insert("example.com", "block");
        assert_eq!(trie.find("a.example.com"), Some(&"block"));
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn trie_trailing_dot_fqdn() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com", 1);
        assert_eq!(trie.find("www.example.com."), Some(&1));
    }

    #[test]
    fn trie_clear() {
        let mut trie = DomainTrie::new();
        trie.insert("cn", 1);
        assert!(trie.matches("baidu.cn"));
        assert!(!trie.matches("cnn.com"));
        trie.clear();
        assert!(trie.is_empty());
        assert!(!trie.matches("baidu.cn"));
    }

    #[test]
    fn ip_trie_longest_prefix_v4() {
        let mut trie = IpPrefixTrie::new();
        trie.insert(&"10.0.0.0/8".parse().unwrap(), 1);
        trie.insert(&"10.0.0.0/16".parse().unwrap(), 2);
        trie.insert(&"10.0.0.0/24".parse().unwrap(), 3);

        assert_eq!(trie.longest_prefix_match("10.0.0.5".parse().unwrap()), Some(&3));
        assert_eq!(trie.longest_prefix_match("10.0.1.5".parse().unwrap()), Some(&2));
        assert_eq!(trie.longest_prefix_match("10.1.0.5".parse().unwrap()), Some(&1));
        assert_eq!(trie.longest_prefix_match("11.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn ip_trie_v6_separate_root() {
        let mut trie = IpPrefixTrie::new();
        trie.insert(&"10.0.0.0/8".parse().unwrap(), 1);
        trie.insert(&"2001:db8::/32".parse().unwrap(), 2);

        assert_eq!(trie.longest_prefix_match("2001:db8::1".parse().unwrap()), Some(&2));
        assert_eq!(trie.longest_prefix_match("::1".parse().unwrap()), None);
        assert_eq!(trie.longest_prefix_match("8.8.8.8".parse().unwrap()), None);
        assert_eq!(trie.len(), 2);
    }

    #[test]
    fn ip_trie_default_route_and_host() {
        let mut trie = IpPrefixTrie::new();
        trie.insert(&"0.0.0.0/0".parse().unwrap(), 0);
        trie.insert(&"1.2.3.4/32".parse().unwrap(), 1);

        assert_eq!(trie.longest_prefix_match("1.2.3.4".parse().unwrap()), Some(&1));
        assert_eq!(trie.longest_prefix_match("1.2.3.5".parse().unwrap()), Some(&0));
    }

    #[test]
    fn ip_trie_same_prefix_overwrites() {
        let mut trie = IpPrefixTrie::new();
        trie.insert(&"192.168.0.0/16".parse().unwrap(), "direct");
        trie.insert(&"192.168.0.0/16".parse().unwrap(), "proxy");
        assert_eq!(
            trie.longest_prefix_match("192.168.1.1".parse().unwrap()),
            Some(&"proxy")
        );
        assert_eq!(trie.len(), 1);
    }
}

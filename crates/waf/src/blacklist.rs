//! IP and DNS reputation sets
//!
//! [`IpSet`] is a bitwise trie over CIDR prefixes supporting longest-prefix
//! membership in O(prefix bits), with separate roots for IPv4 and IPv6.
//! [`DnsSet`] is an exact-match host set. Both are immutable once built and
//! replaced wholesale on reload.
//!
//! File format for both: one entry per line, blank lines and `#` comments
//! ignored. IP entries may be bare addresses (auto-expanded to `/32` for v4
//! and `/64` for v6) or explicit prefixes.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

use palisade_common::{PalisadeError, PalisadeResult};

/// Expand a bare IP to the conventional blacklist prefix.
///
/// IPv4 addresses cover a single host; IPv6 addresses cover the /64 the
/// host sits in, since individual v6 hosts are trivially rotated.
pub fn expand_bare_ip(entry: &str) -> String {
    if entry.contains('/') {
        entry.to_string()
    } else if entry.contains(':') {
        format!("{entry}/64")
    } else {
        format!("{entry}/32")
    }
}

/// Parse a blacklist entry into a normalized network.
pub fn parse_entry(entry: &str) -> Result<IpNet, ipnet::AddrParseError> {
    let expanded = expand_bare_ip(entry);
    expanded.parse::<IpNet>().map(|net| net.trunc())
}

#[derive(Debug, Clone, Copy, Default)]
struct TrieNode {
    children: [Option<u32>; 2],
    terminal: bool,
}

/// Bitwise prefix trie over one address family
#[derive(Debug, Clone)]
struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

impl PrefixTrie {
    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    fn insert(&mut self, bits: &[u8], prefix_len: u8) {
        let mut node = 0usize;
        for i in 0..prefix_len as usize {
            let bit = (bits[i / 8] >> (7 - (i % 8))) & 1;
            node = match self.nodes[node].children[bit as usize] {
                Some(next) => next as usize,
                None => {
                    let next = self.nodes.len() as u32;
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children[bit as usize] = Some(next);
                    next as usize
                }
            };
        }
        self.nodes[node].terminal = true;
    }

    fn contains(&self, bits: &[u8]) -> bool {
        let mut node = 0usize;
        if self.nodes[node].terminal {
            return true;
        }
        for i in 0..bits.len() * 8 {
            let bit = (bits[i / 8] >> (7 - (i % 8))) & 1;
            match self.nodes[node].children[bit as usize] {
                Some(next) => {
                    node = next as usize;
                    if self.nodes[node].terminal {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }

    fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && !self.nodes[0].terminal
    }
}

/// CIDR membership set with independent v4 and v6 tries
#[derive(Debug, Clone)]
pub struct IpSet {
    v4: PrefixTrie,
    v6: PrefixTrie,
    entries: usize,
}

impl IpSet {
    pub fn new() -> Self {
        Self {
            v4: PrefixTrie::new(),
            v6: PrefixTrie::new(),
            entries: 0,
        }
    }

    /// Build a set from already-parsed networks.
    pub fn from_nets(nets: impl IntoIterator<Item = IpNet>) -> Self {
        let mut set = Self::new();
        for net in nets {
            set.insert(net);
        }
        set
    }

    /// Insert one network.
    pub fn insert(&mut self, net: IpNet) {
        match net.trunc() {
            IpNet::V4(v4) => {
                self.v4.insert(&v4.addr().octets(), v4.prefix_len());
            }
            IpNet::V6(v6) => {
                self.v6.insert(&v6.addr().octets(), v6.prefix_len());
            }
        }
        self.entries += 1;
    }

    /// Longest-prefix membership test.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.contains(&v4.octets()),
            IpAddr::V6(v6) => self.v6.contains(&v6.octets()),
        }
    }

    /// Number of inserted entries (not trie nodes).
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

impl Default for IpSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Exact-match host set
///
/// Callers canonicalize through [`DnsSet::canonicalize`]: lowercase, trailing
/// dot stripped.
#[derive(Debug, Clone, Default)]
pub struct DnsSet {
    hosts: HashSet<String>,
}

impl DnsSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowercase and strip the trailing dot of an FQDN.
    pub fn canonicalize(host: &str) -> String {
        host.trim().trim_end_matches('.').to_ascii_lowercase()
    }

    pub fn insert(&mut self, host: &str) {
        self.hosts.insert(Self::canonicalize(host));
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(&Self::canonicalize(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Read the non-comment lines of a blacklist file.
fn read_entries(path: &Path) -> PalisadeResult<Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| PalisadeError::Io {
        message: format!("failed to read blacklist: {e}"),
        path: Some(path.to_path_buf()),
        source: e,
    })?;

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Load an IP blacklist file into a fresh [`IpSet`].
///
/// A missing file disables the feature with a warning rather than failing
/// the load. Unparsable entries are skipped individually.
pub fn load_ip_blacklist(path: &Path) -> PalisadeResult<IpSet> {
    if !path.exists() {
        warn!(file = %path.display(), "Skipping IP blacklist load, file does not exist");
        return Ok(IpSet::new());
    }

    let mut set = IpSet::new();
    for entry in read_entries(path)? {
        match parse_entry(&entry) {
            Ok(net) => set.insert(net),
            Err(e) => {
                warn!(entry = %entry, error = %e, "Skipping invalid IP in blacklist");
            }
        }
    }

    debug!(file = %path.display(), entries = set.len(), "Loaded IP blacklist");
    Ok(set)
}

/// Load a DNS blacklist file into a fresh [`DnsSet`].
pub fn load_dns_blacklist(path: &Path) -> PalisadeResult<DnsSet> {
    if !path.exists() {
        warn!(file = %path.display(), "Skipping DNS blacklist load, file does not exist");
        return Ok(DnsSet::new());
    }

    let mut set = DnsSet::new();
    for entry in read_entries(path)? {
        set.insert(&entry);
    }

    debug!(file = %path.display(), entries = set.len(), "Loaded DNS blacklist");
    Ok(set)
}

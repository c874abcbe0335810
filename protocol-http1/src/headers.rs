//! Ordered, case-insensitive HTTP header map.
//!
//! Entries keep insertion order; names are ASCII-lowercased on ingest. A
//! closed set of well-known names ([`InlineName`]) is resolved through a
//! byte trie to a fixed slot so hot-path lookups never scan the entry list.
//! Pseudo-names (`:method`, `:path`, `:scheme`, `:authority`, `:status`)
//! exist only in this internal representation; the wire encoders translate
//! `:authority` to `host` and drop the rest.

use std::sync::OnceLock;

/// Well-known header names with O(1) inline slots.
///
/// Lookup by one of these names costs a trie walk proportional to the name
/// length, independent of how many headers the map holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum InlineName {
    Method,
    Path,
    Scheme,
    Authority,
    Status,
    Host,
    ContentLength,
    TransferEncoding,
    Connection,
    KeepAlive,
    ProxyConnection,
    Upgrade,
    Expect,
    RequestId,
    ForwardedFor,
    ForwardedProto,
    EnvoyInternal,
    EnvoyExternalAddress,
    EnvoyRetryOn,
    EnvoyMaxRetries,
    EnvoyUpstreamRqTimeoutMs,
    EnvoyUpstreamRqPerTryTimeoutMs,
    EnvoyUpstreamRqTimeoutAltResponse,
    EnvoyExpectedRqTimeoutMs,
    EnvoyForceTrace,
    EnvoyUpstreamCanary,
    EnvoyDownstreamServiceCluster,
    EnvoyUpstreamServiceTime,
}

impl InlineName {
    pub const COUNT: usize = 28;

    const ALL: [InlineName; Self::COUNT] = [
        InlineName::Method,
        InlineName::Path,
        InlineName::Scheme,
        InlineName::Authority,
        InlineName::Status,
        InlineName::Host,
        InlineName::ContentLength,
        InlineName::TransferEncoding,
        InlineName::Connection,
        InlineName::KeepAlive,
        InlineName::ProxyConnection,
        InlineName::Upgrade,
        InlineName::Expect,
        InlineName::RequestId,
        InlineName::ForwardedFor,
        InlineName::ForwardedProto,
        InlineName::EnvoyInternal,
        InlineName::EnvoyExternalAddress,
        InlineName::EnvoyRetryOn,
        InlineName::EnvoyMaxRetries,
        InlineName::EnvoyUpstreamRqTimeoutMs,
        InlineName::EnvoyUpstreamRqPerTryTimeoutMs,
        InlineName::EnvoyUpstreamRqTimeoutAltResponse,
        InlineName::EnvoyExpectedRqTimeoutMs,
        InlineName::EnvoyForceTrace,
        InlineName::EnvoyUpstreamCanary,
        InlineName::EnvoyDownstreamServiceCluster,
        InlineName::EnvoyUpstreamServiceTime,
    ];

    /// The canonical (lowercase) wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            InlineName::Method => ":method",
            InlineName::Path => ":path",
            InlineName::Scheme => ":scheme",
            InlineName::Authority => ":authority",
            InlineName::Status => ":status",
            InlineName::Host => "host",
            InlineName::ContentLength => "content-length",
            InlineName::TransferEncoding => "transfer-encoding",
            InlineName::Connection => "connection",
            InlineName::KeepAlive => "keep-alive",
            InlineName::ProxyConnection => "proxy-connection",
            InlineName::Upgrade => "upgrade",
            InlineName::Expect => "expect",
            InlineName::RequestId => "x-request-id",
            InlineName::ForwardedFor => "x-forwarded-for",
            InlineName::ForwardedProto => "x-forwarded-proto",
            InlineName::EnvoyInternal => "x-envoy-internal",
            InlineName::EnvoyExternalAddress => "x-envoy-external-address",
            InlineName::EnvoyRetryOn => "x-envoy-retry-on",
            InlineName::EnvoyMaxRetries => "x-envoy-max-retries",
            InlineName::EnvoyUpstreamRqTimeoutMs => "x-envoy-upstream-rq-timeout-ms",
            InlineName::EnvoyUpstreamRqPerTryTimeoutMs => "x-envoy-upstream-rq-per-try-timeout-ms",
            InlineName::EnvoyUpstreamRqTimeoutAltResponse => {
                "x-envoy-upstream-rq-timeout-alt-response"
            }
            InlineName::EnvoyExpectedRqTimeoutMs => "x-envoy-expected-rq-timeout-ms",
            InlineName::EnvoyForceTrace => "x-envoy-force-trace",
            InlineName::EnvoyUpstreamCanary => "x-envoy-upstream-canary",
            InlineName::EnvoyDownstreamServiceCluster => "x-envoy-downstream-service-cluster",
            InlineName::EnvoyUpstreamServiceTime => "x-envoy-upstream-service-time",
        }
    }

    /// Whether repeated inserts of this name append (comma-joined) instead
    /// of replacing. `x-forwarded-for` is the only appending inline name.
    fn appends(self) -> bool {
        matches!(self, InlineName::ForwardedFor)
    }

    /// Resolve a lowercase name to its inline slot, if it has one.
    pub fn lookup(name: &str) -> Option<InlineName> {
        trie().lookup(name.as_bytes())
    }
}

// One trie node per name prefix, one child slot per byte value. Index 0 is
// the root; 0 in a child slot means "no child".
struct Trie {
    children: Vec<[u16; 256]>,
    leaf: Vec<Option<InlineName>>,
}

impl Trie {
    fn build() -> Trie {
        let mut trie = Trie {
            children: vec![[0u16; 256]],
            leaf: vec![None],
        };
        for name in InlineName::ALL {
            let mut node = 0usize;
            for &b in name.as_str().as_bytes() {
                let next = trie.children[node][b as usize] as usize;
                if next == 0 {
                    trie.children.push([0u16; 256]);
                    trie.leaf.push(None);
                    let idx = trie.children.len() - 1;
                    trie.children[node][b as usize] = idx as u16;
                    node = idx;
                } else {
                    node = next;
                }
            }
            trie.leaf[node] = Some(name);
        }
        trie
    }

    fn lookup(&self, name: &[u8]) -> Option<InlineName> {
        let mut node = 0usize;
        for &b in name {
            let next = self.children[node][b as usize];
            if next == 0 {
                return None;
            }
            node = next as usize;
        }
        self.leaf[node]
    }
}

fn trie() -> &'static Trie {
    static TRIE: OnceLock<Trie> = OnceLock::new();
    TRIE.get_or_init(Trie::build)
}

/// One header entry. The name is stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    name: String,
    value: String,
}

impl HeaderEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Insertion-ordered header map with O(1) access to well-known names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<HeaderEntry>,
    inline: [Option<u32>; InlineName::COUNT],
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of name and value byte lengths across all entries.
    pub fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.name.len() + e.value.len())
            .sum()
    }

    /// Insert a header. The name is lowercased. Inline names follow their
    /// overwrite policy (replace, or comma-append for `x-forwarded-for`);
    /// everything else is appended preserving insertion order.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let lower = lowercase(name);
        let value = value.into();
        match InlineName::lookup(&lower) {
            Some(inline) => self.insert_inline_at(inline, lower, value),
            None => self.entries.push(HeaderEntry { name: lower, value }),
        }
    }

    /// Insert by inline slot, skipping the trie walk.
    pub fn set_inline(&mut self, name: InlineName, value: impl Into<String>) {
        self.insert_inline_at(name, name.as_str().to_string(), value.into());
    }

    fn insert_inline_at(&mut self, inline: InlineName, name: String, value: String) {
        match self.inline[inline as usize] {
            Some(idx) => {
                let entry = &mut self.entries[idx as usize];
                if inline.appends() && !entry.value.is_empty() {
                    entry.value.push(',');
                    entry.value.push_str(&value);
                } else {
                    entry.value = value;
                }
            }
            None => {
                self.entries.push(HeaderEntry { name, value });
                self.inline[inline as usize] = Some(self.entries.len() as u32 - 1);
            }
        }
    }

    /// First value for `name` (case-insensitive), or None.
    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = lowercase(name);
        if let Some(inline) = InlineName::lookup(&lower) {
            return self.get_inline(inline);
        }
        self.entries
            .iter()
            .find(|e| e.name == lower)
            .map(|e| e.value.as_str())
    }

    /// Value in an inline slot, or None.
    pub fn get_inline(&self, name: InlineName) -> Option<&str> {
        self.inline[name as usize].map(|idx| self.entries[idx as usize].value.as_str())
    }

    pub fn contains(&self, name: InlineName) -> bool {
        self.inline[name as usize].is_some()
    }

    /// Remove all entries named `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let lower = lowercase(name);
        let before = self.entries.len();
        self.entries.retain(|e| e.name != lower);
        if self.entries.len() != before {
            self.reindex();
            true
        } else {
            false
        }
    }

    /// Remove an inline entry. Returns the removed value.
    pub fn remove_inline(&mut self, name: InlineName) -> Option<String> {
        let idx = self.inline[name as usize]? as usize;
        let entry = self.entries.remove(idx);
        self.reindex();
        Some(entry.value)
    }

    fn reindex(&mut self) {
        self.inline = [None; InlineName::COUNT];
        for (idx, entry) in self.entries.iter().enumerate() {
            if let Some(inline) = InlineName::lookup(&entry.name) {
                if self.inline[inline as usize].is_none() {
                    self.inline[inline as usize] = Some(idx as u32);
                }
            }
        }
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }
}

fn lowercase(name: &str) -> String {
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        name.to_ascii_lowercase()
    } else {
        name.to_string()
    }
}

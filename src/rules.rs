use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;

const MAX_DOMAIN_LENGTH: usize = 253;

/// Routing decision for a single hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteVerdict {
    Direct,
    Proxied,
}

/// Immutable set of lower-cased domains. Published whole, never edited.
#[derive(Debug, Default)]
pub struct RuleSet {
    domains: FxHashSet<Box<str>>,
}

impl RuleSet {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize(d.as_ref()))
            .map(String::into_boxed_str)
            .collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    /// True if any right-aligned tail of `host` with at least two labels is
    /// in the set. `a.b.example.com` tests `a.b.example.com`, `b.example.com`
    /// and `example.com`, never `com`.
    pub fn matches_suffix(&self, host: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }

        let mut candidate = host;
        while let Some(dot) = candidate.find('.') {
            if self.domains.contains(candidate) {
                return true;
            }
            candidate = &candidate[dot + 1..];
        }

        false
    }
}

/// The two live rule sets. Readers clone an `Arc` under the read lock and
/// release it before matching, so a refresh only ever waits on a pointer copy.
pub struct RuleStore {
    blocklist: RwLock<Arc<RuleSet>>,
    custom_list: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            blocklist: RwLock::new(Arc::new(RuleSet::default())),
            custom_list: RwLock::new(Arc::new(RuleSet::default())),
        }
    }

    pub fn classify(&self, hostname: &str) -> RouteVerdict {
        let Some(host) = normalize(hostname) else {
            return RouteVerdict::Direct;
        };

        if self.custom_list().contains(&host) {
            return RouteVerdict::Proxied;
        }

        if self.blocklist().matches_suffix(&host) {
            return RouteVerdict::Proxied;
        }

        RouteVerdict::Direct
    }

    pub fn replace_blocklist(&self, set: RuleSet) {
        *self.blocklist.write() = Arc::new(set);
    }

    pub fn replace_custom_list(&self, set: RuleSet) {
        *self.custom_list.write() = Arc::new(set);
    }

    pub fn blocklist(&self) -> Arc<RuleSet> {
        self.blocklist.read().clone()
    }

    pub fn custom_list(&self) -> Arc<RuleSet> {
        self.custom_list.read().clone()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a base64 blocklist blob (line breaks inside the base64 allowed)
/// and parses the Adblock-style rules it carries.
pub fn decode_blocklist(raw: &[u8]) -> Result<RuleSet, base64::DecodeError> {
    let compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let decoded = STANDARD.decode(compact)?;
    Ok(parse_blocklist(&String::from_utf8_lossy(&decoded)))
}

pub fn parse_blocklist(text: &str) -> RuleSet {
    RuleSet::new(text.lines().filter_map(parse_rule_line))
}

/// One hostname per line, `#` comments.
pub fn parse_custom_list(text: &str) -> RuleSet {
    RuleSet::new(
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#')),
    )
}

fn parse_rule_line(line: &str) -> Option<&str> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return None;
    }

    let line = line.strip_prefix("||").unwrap_or(line);
    let line = line.strip_prefix('.').unwrap_or(line);

    if line.is_empty() {
        return None;
    }

    Some(line)
}

fn normalize(domain: &str) -> Option<String> {
    let domain = domain.trim();
    let domain = domain.strip_suffix('.').unwrap_or(domain);

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LENGTH {
        return None;
    }

    Some(domain.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    fn store(blocklist: &[&str], custom: &[&str]) -> RuleStore {
        let store = RuleStore::new();
        store.replace_blocklist(RuleSet::new(blocklist));
        store.replace_custom_list(RuleSet::new(custom));
        store
    }

    #[test]
    fn test_custom_list_is_exact_only() {
        let store = store(&[], &["private.example.org"]);

        assert_eq!(store.classify("private.example.org"), RouteVerdict::Proxied);
        assert_eq!(store.classify("sub.private.example.org"), RouteVerdict::Direct);
        assert_eq!(store.classify("example.org"), RouteVerdict::Direct);
    }

    #[test]
    fn test_blocklist_matches_every_tail_down_to_two_labels() {
        let store = store(&["example.com"], &[]);

        assert_eq!(store.classify("example.com"), RouteVerdict::Proxied);
        assert_eq!(store.classify("b.example.com"), RouteVerdict::Proxied);
        assert_eq!(store.classify("a.b.example.com"), RouteVerdict::Proxied);
        assert_eq!(store.classify("notexample.com"), RouteVerdict::Direct);
        assert_eq!(store.classify("example.com.cn"), RouteVerdict::Direct);
    }

    #[test]
    fn test_blocklist_inner_label_rule() {
        let store = store(&["b.example.com"], &[]);

        assert_eq!(store.classify("a.b.example.com"), RouteVerdict::Proxied);
        assert_eq!(store.classify("example.com"), RouteVerdict::Direct);
        assert_eq!(store.classify("c.example.com"), RouteVerdict::Direct);
    }

    #[test]
    fn test_bare_tld_rule_never_matches() {
        let store = store(&["com"], &[]);

        assert_eq!(store.classify("example.com"), RouteVerdict::Direct);
        assert_eq!(store.classify("com"), RouteVerdict::Direct);
    }

    #[test]
    fn test_single_label_host() {
        let store = store(&["intranet"], &["printer"]);

        assert_eq!(store.classify("intranet"), RouteVerdict::Direct);
        assert_eq!(store.classify("printer"), RouteVerdict::Proxied);
    }

    #[test]
    fn test_empty_host_is_direct() {
        let store = store(&["example.com"], &[""]);
        assert_eq!(store.classify(""), RouteVerdict::Direct);
    }

    #[test]
    fn test_case_and_trailing_dot_ignored() {
        let store = store(&["Example.COM"], &[]);

        assert_eq!(store.classify("WWW.example.com"), RouteVerdict::Proxied);
        assert_eq!(store.classify("www.example.com."), RouteVerdict::Proxied);
    }

    #[test]
    fn test_parse_blocklist_mixed_lines() {
        let text = "\
[AutoProxy 0.2.9]
! Checksum: abc
! comment line

||google.com
.youtube.com
||.twitter.com
plain.example.net
  ||spaced.org
";

        let set = parse_blocklist(text);
        let got: BTreeSet<&str> = set.domains.iter().map(|d| &**d).collect();
        let want: BTreeSet<&str> = [
            "google.com",
            "youtube.com",
            "twitter.com",
            "plain.example.net",
            "spaced.org",
        ]
        .into_iter()
        .collect();

        assert_eq!(got, want);
    }

    #[test]
    fn test_decode_blocklist_with_wrapped_base64() {
        let text = "[AutoProxy]\n! header\n||google.com\n.example.org\n";
        let encoded = STANDARD.encode(text);
        // Wrap at 16 columns like the published list does at 64.
        let wrapped: String = encoded
            .as_bytes()
            .chunks(16)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

        let set = decode_blocklist(wrapped.as_bytes()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("google.com"));
        assert!(set.contains("example.org"));
    }

    #[test]
    fn test_decode_blocklist_rejects_garbage() {
        assert!(decode_blocklist(b"not base64 at all!!").is_err());
    }

    #[test]
    fn test_parse_custom_list() {
        let set = parse_custom_list("# mine\n\nfoo.example.com\n  bar.example.com \n#baz.com\n");
        assert_eq!(set.len(), 2);
        assert!(set.contains("foo.example.com"));
        assert!(set.contains("bar.example.com"));
    }

    #[test]
    fn test_replace_is_atomic_under_concurrent_readers() {
        let old: Vec<String> = (0..200).map(|i| format!("old{}.example.com", i)).collect();
        let new: Vec<String> = (0..200).map(|i| format!("new{}.example.org", i)).collect();

        let store = Arc::new(RuleStore::new());
        store.replace_blocklist(RuleSet::new(&old));

        let writer = {
            let store = store.clone();
            let (old, new) = (old.clone(), new.clone());
            thread::spawn(move || {
                for i in 0..500 {
                    let next = if i % 2 == 0 { &new } else { &old };
                    store.replace_blocklist(RuleSet::new(next));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let (old, new) = (old.clone(), new.clone());
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = store.blocklist();
                        let old_hits = old.iter().filter(|d| snapshot.contains(d)).count();
                        let new_hits = new.iter().filter(|d| snapshot.contains(d)).count();
                        assert!(
                            (old_hits == old.len() && new_hits == 0)
                                || (new_hits == new.len() && old_hits == 0),
                            "torn read: old={} new={}",
                            old_hits,
                            new_hits
                        );
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}

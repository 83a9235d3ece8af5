//! `WildcardMatcher`: decides whether a `Host` header falls under the
//! configured wildcard pattern and, if so, extracts the subdomain label
//! used for dispatch (spec.md §4.3, tested by §8's invariant).

#[derive(Debug, Clone)]
pub struct WildcardMatcher {
    /// The suffix following the leading `*.`, e.g. `example.com`.
    suffix: String,
}

impl WildcardMatcher {
    /// `pattern` must look like `*.example.com`. Anything else degrades to
    /// an empty suffix that never matches.
    pub fn new(pattern: &str) -> Self {
        let suffix = pattern.strip_prefix("*.").unwrap_or("").to_string();
        Self { suffix }
    }

    /// Returns the label(s) preceding the wildcard suffix, or `None` if
    /// `host` is the bare suffix itself or doesn't end in the suffix at all.
    ///
    /// `match("a.b.example.com") = Some("a.b")`, `match("example.com") = None`.
    pub fn matches<'a>(&self, host: &'a str) -> Option<&'a str> {
        if self.suffix.is_empty() {
            return None;
        }
        let host = host.split(':').next().unwrap_or(host);
        if host == self.suffix {
            return None;
        }
        let dotted_suffix = format!(".{}", self.suffix);
        host.strip_suffix(&dotted_suffix)
            .filter(|label| !label.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_subdomain_label() {
        let m = WildcardMatcher::new("*.example.com");
        assert_eq!(m.matches("a.b.example.com"), Some("a.b"));
    }

    #[test]
    fn bare_suffix_does_not_match() {
        let m = WildcardMatcher::new("*.example.com");
        assert_eq!(m.matches("example.com"), None);
    }

    #[test]
    fn unrelated_host_does_not_match() {
        let m = WildcardMatcher::new("*.example.com");
        assert_eq!(m.matches("evil.com"), None);
    }

    #[test]
    fn port_suffix_is_ignored() {
        let m = WildcardMatcher::new("*.example.com");
        assert_eq!(m.matches("ui-abc.example.com:8443"), Some("ui-abc"));
    }
}

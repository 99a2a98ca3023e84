use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Host/IP blacklist with exact entries and `*.suffix` wildcard rules.
///
/// Rules are rebuilt from scratch on every `load` and swapped in atomically,
/// so lookups observe either the previous or the new ruleset, never a mix.
pub struct Filter {
    rules: RwLock<RuleSet>,
}

#[derive(Default)]
struct RuleSet {
    exact: Vec<String>,
    suffix: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(RuleSet::default()),
        }
    }

    /// Replaces the active ruleset with the contents of `path`.
    ///
    /// Lines are trimmed; blank lines and `#` comments are skipped; entries
    /// are lower-cased. `*.example.com` becomes the suffix rule
    /// `example.com`; everything else (hostnames and IP literals alike) is an
    /// exact entry. On any error the previous ruleset stays active.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to open blocklist {:?}", path))?;

        let mut exact = Vec::new();
        let mut suffix = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read blocklist line {}", line_num + 1))?;
            let rule = line.trim();
            if rule.is_empty() || rule.starts_with('#') {
                continue;
            }
            let rule = rule.to_ascii_lowercase();
            match rule.strip_prefix("*.") {
                Some(rest) if !rest.is_empty() => suffix.push(rest.to_string()),
                _ => exact.push(rule),
            }
        }

        let mut rules = self.rules.write();
        rules.exact = exact;
        rules.suffix = suffix;
        Ok(())
    }

    /// Returns true when `host` matches an exact entry, equals a suffix rule,
    /// or ends with `.suffix`. Matching is case-insensitive and anchored at
    /// label boundaries, so `evilexample.com` does not match `*.example.com`.
    pub fn is_blocked(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }

        let rules = self.rules.read();
        if rules.exact.iter().any(|e| *e == host) {
            return true;
        }
        rules.suffix.iter().any(|s| suffix_matches(&host, s))
    }

    pub fn rule_count(&self) -> usize {
        let rules = self.rules.read();
        rules.exact.len() + rules.suffix.len()
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn suffix_matches(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    if host.len() <= suffix.len() || !host.ends_with(suffix) {
        return false;
    }
    host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

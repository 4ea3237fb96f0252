use regex::Regex;

use crate::error::ConfigError;

/// Decides whether a request path is exempt from logging.
///
/// A literal pattern matches the path itself and any of its sub-paths:
/// `/authorize` matches `/authorize`, `/authorize/`, and `/authorize/login`,
/// but not `/auth`. Every configured pattern is evaluated; matching errs
/// toward "not exempt" so a doubtful path is still logged.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    prefixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl PathMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a literal exemption pattern. Trailing separators are ignored;
    /// an empty pattern is dropped rather than allowed to exempt every path.
    pub fn add_prefix(&mut self, pattern: &str) {
        let trimmed = pattern.trim_end_matches('/');
        if !trimmed.trim_start_matches('/').is_empty() {
            self.prefixes.push(normalize(trimmed));
        }
    }

    /// Register a regex exemption, matched against the normalized path.
    pub fn add_regex(&mut self, pattern: &str) -> Result<(), ConfigError> {
        let re = Regex::new(pattern).map_err(|source| ConfigError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.patterns.push(re);
        Ok(())
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        let uri = normalize(path);
        self.prefixes.iter().any(|prefix| {
            uri == *prefix
                || uri
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        }) || self.patterns.iter().any(|re| re.is_match(&uri))
    }
}

/// Collapses repeated separators and forces a single leading one.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

//! Whitelist Matcher
//!
//! Decides whether a request target may reach the origin. Matching is plain
//! case-insensitive substring containment: a target is allowed when any
//! configured pattern occurs anywhere inside the lowercased target.

use std::fmt;

/// Outcome of a whitelist lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterDecision {
    /// Forward to the origin unmodified
    Allow,

    /// Answer locally, never contact the origin
    Block,
}

impl FilterDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl fmt::Display for FilterDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// Immutable set of lowercase substring patterns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    entries: Vec<String>,
}

impl Whitelist {
    /// Build from individual patterns
    ///
    /// Patterns are trimmed and lowercased. Blank patterns are discarded,
    /// since an empty pattern would match every target.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries: Vec<String> = Vec::new();

        for pattern in patterns {
            let entry = pattern.as_ref().trim().to_lowercase();
            if entry.is_empty() || entries.contains(&entry) {
                continue;
            }
            entries.push(entry);
        }

        Self { entries }
    }

    /// Parse a comma-separated pattern list (`"example.com, api.test"`)
    pub fn from_csv(source: &str) -> Self {
        Self::new(source.split(','))
    }

    /// Allow iff some entry is a substring of the lowercased target
    pub fn decide(&self, target: &str) -> FilterDecision {
        if self.matching_entry(target).is_some() {
            FilterDecision::Allow
        } else {
            FilterDecision::Block
        }
    }

    /// First entry contained in the lowercased target, if any
    pub fn matching_entry(&self, target: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }

        let target = target.to_lowercase();
        self.entries
            .iter()
            .find(|entry| target.contains(entry.as_str()))
            .map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use regex::Regex;
use serde::Deserialize;

/// File rules that decide whether a pull's changes warrant a build.
///
/// Deserializes from a list of regex strings; an invalid pattern fails the
/// configuration load.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct RuleSet {
    rules: Vec<Regex>,
}

impl RuleSet {
    pub fn new(patterns: &[&str]) -> Result<Self, regex::Error> {
        let rules = patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when no rules are configured (fail-open) or when any filename
    /// matches any rule.
    pub fn matches<S: AsRef<str>>(&self, filenames: &[S]) -> bool {
        if self.is_empty() {
            return true;
        }
        filenames
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !name.is_empty())
            .any(|name| self.rules.iter().any(|rule| rule.is_match(name)))
    }
}

impl TryFrom<Vec<String>> for RuleSet {
    type Error = regex::Error;

    fn try_from(patterns: Vec<String>) -> Result<Self, Self::Error> {
        let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
        Self::new(&patterns)
    }
}

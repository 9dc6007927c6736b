use regex::bytes::Regex;
use std::fmt;

use crate::error::{MockError, Result};
use crate::markers;

/// What a receive assertion expects to see.
///
/// The two modes never fall back to each other: a literal is compared
/// byte-for-byte after marker expansion, a pattern is only ever a regex.
#[derive(Debug, Clone)]
pub enum Expect {
    /// Marker-expanded literal bytes.
    Literal(Vec<u8>),
    /// Regular expression matched from the start of the received bytes.
    Pattern(Regex),
}

impl Expect {
    pub fn literal(payload: &str) -> Self {
        Expect::Literal(markers::expand_bytes(payload))
    }

    /// Compile `pattern` as-is (no marker expansion).
    ///
    /// Matching is anchored at the start of the received bytes, and `$` also
    /// accepts a single trailing `\n`, so `^STORED$` matches `STORED\r\n`
    /// only if the `\r` is accounted for (e.g. `^STORED\r$` or `^STORED.*$`).
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Expect::Pattern(Regex::new(pattern)?))
    }

    pub fn matches(&self, actual: &[u8]) -> bool {
        match self {
            Expect::Literal(expected) => expected.as_slice() == actual,
            Expect::Pattern(re) => {
                anchored_match(re, actual)
                    || actual
                        .strip_suffix(b"\n")
                        .is_some_and(|trimmed| anchored_match(re, trimmed))
            }
        }
    }

    /// Assert `actual` satisfies this expectation, reporting both sides on mismatch.
    pub fn check(&self, target: &'static str, actual: &[u8]) -> Result<()> {
        if self.matches(actual) {
            return Ok(());
        }
        Err(MockError::AssertionMismatch {
            target,
            expected: self.to_string(),
            actual: String::from_utf8_lossy(actual).into_owned(),
        })
    }
}

// Leftmost match starts at 0 iff any match starts at 0.
fn anchored_match(re: &Regex, haystack: &[u8]) -> bool {
    re.find(haystack).is_some_and(|m| m.start() == 0)
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Literal(bytes) => write!(f, "literal {:?}", String::from_utf8_lossy(bytes)),
            Expect::Pattern(re) => write!(f, "pattern /{}/", re.as_str()),
        }
    }
}

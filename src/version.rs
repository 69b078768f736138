//! Package versions as they appear in index listings
//!
//! Most filenames carry a PEP 440 version. Older uploads do not, and those
//! are kept as loosely ordered legacy versions rather than discarded.
//! Legacy versions sort before every strict version; there is no
//! meaningful ordering between the two kinds beyond that.

use pep440_rs::{Version, VersionSpecifiers};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A version that failed strict parsing
#[derive(Debug, Clone)]
pub struct LegacyVersion {
    text: String,
    key: Vec<LegacyPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum LegacyPart {
    // Declared first so alphabetic runs sort below numeric ones.
    Text(String),
    Number(u64),
}

impl LegacyVersion {
    pub fn new(text: &str) -> Self {
        let mut key = Vec::new();
        let mut chars = text.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                let mut run = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    run.push(d);
                    chars.next();
                }
                match run.parse::<u64>() {
                    Ok(n) => key.push(LegacyPart::Number(n)),
                    Err(_) => key.push(LegacyPart::Text(run)),
                }
            } else if c.is_alphabetic() {
                let mut run = String::new();
                while let Some(&a) = chars.peek().filter(|a| a.is_alphabetic()) {
                    run.extend(a.to_lowercase());
                    chars.next();
                }
                key.push(LegacyPart::Text(run));
            } else {
                chars.next();
            }
        }

        Self {
            text: text.to_string(),
            key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for LegacyVersion {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for LegacyVersion {}

impl PartialOrd for LegacyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LegacyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Hash for LegacyVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Either a PEP 440 version or a legacy fallback
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackageVersion {
    Legacy(LegacyVersion),
    Strict(Version),
}

impl PackageVersion {
    /// Parse strictly, falling back to a legacy version
    pub fn parse(text: &str) -> Self {
        match parse_strict(text) {
            Some(version) => PackageVersion::Strict(version),
            None => PackageVersion::Legacy(LegacyVersion::new(text)),
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, PackageVersion::Strict(_))
    }

    /// Whether this version is admitted by a specifier set.
    /// Legacy versions are never admitted by an explicit constraint.
    pub fn satisfies(&self, specifiers: &VersionSpecifiers) -> bool {
        match self {
            PackageVersion::Strict(version) => specifiers.contains(version),
            PackageVersion::Legacy(_) => false,
        }
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageVersion::Strict(version) => write!(f, "{}", version),
            PackageVersion::Legacy(legacy) => f.write_str(legacy.as_str()),
        }
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parse against the PEP 440 grammar only
pub fn parse_strict(text: &str) -> Option<Version> {
    if text.is_empty() || text.trim() != text {
        return None;
    }
    Version::from_str(text).ok()
}

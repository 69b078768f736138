//! Heuristic decomposition of index-listing filenames
//!
//! Package indices do not enforce one naming convention. Sdists, eggs
//! repackaged as tarballs, and wheels all put the package name and version
//! into a single dash-delimited string, and the package name itself may
//! contain dashes. This module recovers `(package, version, build)` from
//! such names with an ordered list of heuristics; the first one that
//! matches wins and is recorded on the result so regressions can be traced
//! back to the rule that produced them.

use crate::error::{FacadeError, Result};
use crate::version::{parse_strict, PackageVersion};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;

/// Archive extensions served by package indices
pub const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tgz", ".tbz", ".tar", ".zip", ".whl",
];

/// Identifies the rule that decomposed a filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heuristic {
    TwoFields,
    KnownPackage,
    ThreePartEnd,
    ThreePartBuild,
    TwoPartEnd,
    TwoPartBuild,
    Epoch,
    LocalVersion,
    DashV,
    SuffixScan,
    LegacyParenV,
    LegacyDashV,
    LastSegment,
}

impl Heuristic {
    pub const ALL: &'static [Heuristic] = &[
        Heuristic::TwoFields,
        Heuristic::KnownPackage,
        Heuristic::ThreePartEnd,
        Heuristic::ThreePartBuild,
        Heuristic::TwoPartEnd,
        Heuristic::TwoPartBuild,
        Heuristic::Epoch,
        Heuristic::LocalVersion,
        Heuristic::DashV,
        Heuristic::SuffixScan,
        Heuristic::LegacyParenV,
        Heuristic::LegacyDashV,
        Heuristic::LastSegment,
    ];

    /// Stable identifier used in logs and regression tests
    pub fn id(&self) -> &'static str {
        match self {
            Heuristic::TwoFields => "1",
            Heuristic::KnownPackage => "known-package",
            Heuristic::ThreePartEnd => "3part",
            Heuristic::ThreePartBuild => "3part-build",
            Heuristic::TwoPartEnd => "2part",
            Heuristic::TwoPartBuild => "2part-build",
            Heuristic::Epoch => "epoch",
            Heuristic::LocalVersion => "local",
            Heuristic::DashV => "dash-v",
            Heuristic::SuffixScan => "suffix-scan",
            Heuristic::LegacyParenV => "legacy-paren-v",
            Heuristic::LegacyDashV => "legacy-dash-v",
            Heuristic::LastSegment => "last-segment",
        }
    }
}

impl fmt::Display for Heuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl Serialize for Heuristic {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

/// Everything recovered from one listing filename
#[derive(Debug, Clone, Serialize)]
pub struct ParsedRecord {
    /// Filename without any `#fragment`
    pub filename: String,
    pub package: String,
    pub version: PackageVersion,
    pub is_wheel: bool,
    pub build_tag: Option<String>,
    pub python_tag: Option<String>,
    pub abi_tag: Option<String>,
    pub platform_tag: Option<String>,
    pub ext: String,
    pub heuristic: Heuristic,
    /// Preserved verbatim for rebuilding proxied links, never matched on
    pub fragment: Option<String>,
}

impl ParsedRecord {
    /// Percent-encoded filename with its fragment re-attached
    pub fn href(&self) -> String {
        let filename = urlencoding::encode(&self.filename);
        match &self.fragment {
            Some(fragment) => format!("{}#{}", filename, fragment),
            None => filename.into_owned(),
        }
    }
}

struct Candidate {
    package: String,
    version: String,
    build: Option<String>,
}

type Strategy = fn(&str) -> Option<Candidate>;

/// Tried in order after the two-field and known-package shortcuts
const HEURISTICS: &[(Heuristic, Strategy)] = &[
    (Heuristic::ThreePartEnd, three_part_end),
    (Heuristic::ThreePartBuild, three_part_build),
    (Heuristic::TwoPartEnd, two_part_end),
    (Heuristic::TwoPartBuild, two_part_build),
    (Heuristic::Epoch, epoch),
    (Heuristic::LocalVersion, local_version),
    (Heuristic::DashV, dash_v),
    (Heuristic::SuffixScan, suffix_scan),
    (Heuristic::LegacyParenV, legacy_paren_v),
    (Heuristic::LegacyDashV, legacy_dash_v),
    (Heuristic::LastSegment, last_segment),
];

static THREE_PART_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)[-_](?P<ver>\d+\.\d+\.\d+)$").unwrap());
static THREE_PART_BUILD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<pkg>.+?)[-_](?P<ver>\d+\.\d+\.\d+)-(?P<build>\d\w*)$").unwrap()
});
static TWO_PART_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)[-_](?P<ver>\d+\.\d+)$").unwrap());
static TWO_PART_BUILD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)[-_](?P<ver>\d+\.\d+)-(?P<build>\d\w*)$").unwrap());
static EPOCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)-(?P<ver>\d+![^-]+)$").unwrap());
static LOCAL_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)-(?P<ver>[^-]+\+[^-]+)$").unwrap());
static DASH_V: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)-[vV](?P<ver>\d[^-]*)$").unwrap());
static LEGACY_PAREN_V: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)-[vV]\((?P<ver>[^)]+)\)$").unwrap());
static LEGACY_DASH_V: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<pkg>.+?)-[vV](?P<ver>[^-]+)$").unwrap());

/// Decompose a listing filename.
///
/// `known_package` short-circuits the guessing when the caller already
/// knows which package the file belongs to (e.g. it came from that
/// package's version listing).
pub fn parse(filename: &str, known_package: Option<&str>) -> Result<ParsedRecord> {
    let (name, fragment) = match filename.split_once('#') {
        Some((name, fragment)) => (name, Some(fragment.to_string())),
        None => (filename, None),
    };

    if !name.contains('.') {
        return Err(FacadeError::invalid_name(filename, "no extension"));
    }

    let lower = name.to_ascii_lowercase();
    let ext = ARCHIVE_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .ok_or_else(|| FacadeError::invalid_name(filename, "unrecognized archive extension"))?;

    let mut stem = &name[..name.len() - ext.len()];
    if !stem.contains('-') {
        return Err(FacadeError::invalid_name(filename, "no dash"));
    }

    let is_wheel = *ext == ".whl";
    let (mut python_tag, mut abi_tag, mut platform_tag) = (None, None, None);
    if is_wheel {
        let fields: Vec<&str> = stem.rsplitn(4, '-').collect();
        if fields.len() < 4 {
            return Err(FacadeError::invalid_name(
                filename,
                "wheel lacks python, abi and platform tags",
            ));
        }
        platform_tag = Some(fields[0].to_string());
        abi_tag = Some(fields[1].to_string());
        python_tag = Some(fields[2].to_string());
        stem = fields[3];
        if !stem.contains('-') {
            return Err(FacadeError::invalid_name(filename, "no dash"));
        }
    }

    let (candidate, heuristic) = decompose(stem, known_package)
        .ok_or_else(|| FacadeError::invalid_name(filename, "no package/version split"))?;

    Ok(ParsedRecord {
        filename: name.to_string(),
        package: candidate.package,
        version: PackageVersion::parse(&candidate.version),
        is_wheel,
        build_tag: candidate.build,
        python_tag,
        abi_tag,
        platform_tag,
        ext: ext.to_string(),
        heuristic,
        fragment,
    })
}

fn decompose(stem: &str, known_package: Option<&str>) -> Option<(Candidate, Heuristic)> {
    if let Some((package, version)) = stem.split_once('-') {
        if !package.is_empty() && !version.contains('-') && parse_strict(version).is_some() {
            let candidate = Candidate {
                package: package.to_string(),
                version: version.to_string(),
                build: None,
            };
            return Some((candidate, Heuristic::TwoFields));
        }
    }

    if let Some(candidate) = known_package.and_then(|known| strip_known_package(stem, known)) {
        return Some((candidate, Heuristic::KnownPackage));
    }

    HEURISTICS
        .iter()
        .find_map(|(heuristic, strategy)| strategy(stem).map(|candidate| (candidate, *heuristic)))
}

/// PEP 503 name normalization: lowercase, `-_.` runs collapse to `-`
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.extend(c.to_lowercase());
            in_separator = false;
        }
    }
    normalized
}

fn starts_with_digit(text: &str) -> bool {
    text.starts_with(|c: char| c.is_ascii_digit())
}

fn strip_known_package(stem: &str, known: &str) -> Option<Candidate> {
    let target = normalize_name(known);
    let fields: Vec<&str> = stem.split('-').collect();

    (1..fields.len()).find_map(|split| {
        let package = fields[..split].join("-");
        if normalize_name(&package) != target {
            return None;
        }
        let region = fields[split..].join("-");
        let (version, build) = split_build(unwrap_version_text(&region));
        Some(Candidate {
            package,
            version,
            build,
        })
    })
}

/// Strip the `v(...)` and `v...` wrappers some legacy uploads use
fn unwrap_version_text(region: &str) -> &str {
    let unprefixed = region
        .strip_prefix('v')
        .or_else(|| region.strip_prefix('V'))
        .filter(|rest| !rest.is_empty());

    match unprefixed {
        Some(rest) => rest
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .unwrap_or(rest),
        None => region,
    }
}

/// Split a trailing numeric build tag off a version region
fn split_build(region: &str) -> (String, Option<String>) {
    match region.rsplit_once('-') {
        Some((head, last)) if starts_with_digit(last) && parse_strict(head).is_some() => {
            (head.to_string(), Some(last.to_string()))
        }
        _ => (region.to_string(), None),
    }
}

fn capture(re: &Regex, stem: &str, require_strict: bool) -> Option<Candidate> {
    let caps = re.captures(stem)?;
    let version = caps.name("ver")?.as_str();
    if require_strict && parse_strict(version).is_none() {
        return None;
    }
    Some(Candidate {
        package: caps.name("pkg")?.as_str().to_string(),
        version: version.to_string(),
        build: caps.name("build").map(|m| m.as_str().to_string()),
    })
}

fn three_part_end(stem: &str) -> Option<Candidate> {
    capture(&THREE_PART_END, stem, false)
}

fn three_part_build(stem: &str) -> Option<Candidate> {
    capture(&THREE_PART_BUILD, stem, false)
}

fn two_part_end(stem: &str) -> Option<Candidate> {
    capture(&TWO_PART_END, stem, false)
}

fn two_part_build(stem: &str) -> Option<Candidate> {
    capture(&TWO_PART_BUILD, stem, false)
}

fn epoch(stem: &str) -> Option<Candidate> {
    capture(&EPOCH, stem, true)
}

fn local_version(stem: &str) -> Option<Candidate> {
    capture(&LOCAL_VERSION, stem, true)
}

fn dash_v(stem: &str) -> Option<Candidate> {
    capture(&DASH_V, stem, true)
}

/// Find the narrowest dash-suffix that parses as a version.
///
/// A window whose last segment starts with a digit may also be read as
/// `version-build` (PEP 427 style) when the whole window does not parse.
fn suffix_scan(stem: &str) -> Option<Candidate> {
    let fields: Vec<&str> = stem.split('-').collect();

    for start in (1..fields.len()).rev() {
        let package_tail = fields[start - 1];
        if package_tail.is_empty() || starts_with_digit(package_tail) {
            continue;
        }
        let window = &fields[start..];
        let package = fields[..start].join("-");

        let version = window.join("-");
        if parse_strict(&version).is_some() {
            return Some(Candidate {
                package,
                version,
                build: None,
            });
        }

        if let Some((last, head)) = window.split_last() {
            if !head.is_empty() && starts_with_digit(last) {
                let version = head.join("-");
                if parse_strict(&version).is_some() {
                    return Some(Candidate {
                        package,
                        version,
                        build: Some(last.to_string()),
                    });
                }
            }
        }
    }
    None
}

fn legacy_paren_v(stem: &str) -> Option<Candidate> {
    capture(&LEGACY_PAREN_V, stem, false)
}

fn legacy_dash_v(stem: &str) -> Option<Candidate> {
    capture(&LEGACY_DASH_V, stem, false)
}

fn last_segment(stem: &str) -> Option<Candidate> {
    let (package, version) = stem.rsplit_once('-')?;
    if package.is_empty() || version.is_empty() {
        return None;
    }
    Some(Candidate {
        package: package.to_string(),
        version: version.to_string(),
        build: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(text: &str) -> PackageVersion {
        PackageVersion::parse(text)
    }

    #[test]
    fn test_two_fields() {
        for (filename, package, ver) in [
            ("pip-1.5.4.tar.gz", "pip", "1.5.4"),
            ("requests-2.31.0.zip", "requests", "2.31.0"),
            ("Django-4.2rc1.tar.bz2", "Django", "4.2rc1"),
            ("six-1.16.0.tgz", "six", "1.16.0"),
            ("foo-0.1.dev3.tbz", "foo", "0.1.dev3"),
            ("bar-1.tar", "bar", "1"),
        ] {
            let parsed = parse(filename, None).unwrap();
            assert_eq!(parsed.package, package, "{}", filename);
            assert_eq!(parsed.version, version(ver), "{}", filename);
            assert_eq!(parsed.heuristic, Heuristic::TwoFields, "{}", filename);
        }
    }

    #[test]
    fn test_wheel_tags() {
        let parsed = parse("pip-7.0.3-py2.py3-none-any.whl", None).unwrap();
        assert!(parsed.is_wheel);
        assert_eq!(parsed.package, "pip");
        assert_eq!(parsed.version, version("7.0.3"));
        assert_eq!(parsed.python_tag.as_deref(), Some("py2.py3"));
        assert_eq!(parsed.abi_tag.as_deref(), Some("none"));
        assert_eq!(parsed.platform_tag.as_deref(), Some("any"));
        assert_eq!(parsed.heuristic, Heuristic::TwoFields);
    }

    #[test]
    fn test_wheel_build_tag() {
        let parsed = parse("foo_bar-1.0-1-cp311-cp311-manylinux_2_17_x86_64.whl", None).unwrap();
        assert_eq!(parsed.package, "foo_bar");
        assert_eq!(parsed.version, version("1.0"));
        assert_eq!(parsed.build_tag.as_deref(), Some("1"));
        assert_eq!(parsed.platform_tag.as_deref(), Some("manylinux_2_17_x86_64"));
    }

    #[test]
    fn test_fragment_is_preserved_not_matched() {
        let parsed = parse("pip-6.1.1.tar.gz#sha256=abc123", None).unwrap();
        assert_eq!(parsed.filename, "pip-6.1.1.tar.gz");
        assert_eq!(parsed.fragment.as_deref(), Some("sha256=abc123"));
        assert_eq!(parsed.href(), "pip-6.1.1.tar.gz#sha256=abc123");
        assert_eq!(parsed.version, version("6.1.1"));

        let local = parse("torch-2.0.0+cpu-cp311-cp311-linux_x86_64.whl", None).unwrap();
        assert_eq!(local.href(), "torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl");
    }

    #[test]
    fn test_invalid_names() {
        for filename in [
            "README",
            "pip.tar.gz",
            "pip-1.0.exe",
            "pip-1.0.rpm",
            "pip-1.0-any.whl",
        ] {
            assert!(
                matches!(parse(filename, None), Err(FacadeError::InvalidName { .. })),
                "{}",
                filename
            );
        }
    }

    /// One canonical input per heuristic; the known package comes from the
    /// first parse and must reproduce the same version.
    const CANONICAL: &[(&str, Option<&str>, Heuristic, &str, &str)] = &[
        ("requests-2.31.0.tar.gz", None, Heuristic::TwoFields, "requests", "2.31.0"),
        ("my-pkg-1.0-1.tar.gz", Some("my_pkg"), Heuristic::KnownPackage, "my-pkg", "1.0"),
        ("python-dateutil-2.8.2.tar.gz", None, Heuristic::ThreePartEnd, "python-dateutil", "2.8.2"),
        ("python-dateutil-2.8.2-1.tar.gz", None, Heuristic::ThreePartBuild, "python-dateutil", "2.8.2"),
        ("python-dateutil-2.8.tar.gz", None, Heuristic::TwoPartEnd, "python-dateutil", "2.8"),
        ("python-dateutil-2.8-1.tar.gz", None, Heuristic::TwoPartBuild, "python-dateutil", "2.8"),
        ("my-pkg-1!2.0b1.tar.gz", None, Heuristic::Epoch, "my-pkg", "1!2.0b1"),
        ("my-pkg-1.0+ubuntu1.tar.gz", None, Heuristic::LocalVersion, "my-pkg", "1.0+ubuntu1"),
        ("my-pkg-v1.2.zip", None, Heuristic::DashV, "my-pkg", "1.2"),
        ("my-pkg-1.0rc1.tar.gz", None, Heuristic::SuffixScan, "my-pkg", "1.0rc1"),
        ("my-pkg-v(1.0).tar.gz", None, Heuristic::LegacyParenV, "my-pkg", "1.0"),
        ("my-pkg-v1.2.x.tar.gz", None, Heuristic::LegacyDashV, "my-pkg", "1.2.x"),
        ("my-pkg-dev.tar.gz", None, Heuristic::LastSegment, "my-pkg", "dev"),
    ];

    #[test]
    fn test_every_heuristic_has_a_canonical_input() {
        for heuristic in Heuristic::ALL {
            assert!(
                CANONICAL.iter().any(|(_, _, h, _, _)| h == heuristic),
                "no canonical input for {}",
                heuristic
            );
        }
    }

    #[test]
    fn test_canonical_inputs_select_their_heuristic() {
        for (filename, known, heuristic, package, ver) in CANONICAL {
            let parsed = parse(filename, *known).unwrap();
            assert_eq!(parsed.heuristic, *heuristic, "{}", filename);
            assert_eq!(parsed.package, *package, "{}", filename);
            assert_eq!(parsed.version, version(ver), "{}", filename);
        }
    }

    #[test]
    fn test_reparse_with_recovered_package() {
        for (filename, known, _, _, _) in CANONICAL {
            let first = parse(filename, *known).unwrap();
            let second = parse(filename, Some(first.package.as_str())).unwrap();
            assert_eq!(first.version, second.version, "{}", filename);
            assert_eq!(first.build_tag, second.build_tag, "{}", filename);
        }
    }

    #[test]
    fn test_build_tags_from_heuristics() {
        let parsed = parse("python-dateutil-2.8.2-1.tar.gz", None).unwrap();
        assert_eq!(parsed.build_tag.as_deref(), Some("1"));
        let parsed = parse("my-pkg-1.0-1.tar.gz", Some("my-pkg")).unwrap();
        assert_eq!(parsed.build_tag.as_deref(), Some("1"));
    }

    #[test]
    fn test_suffix_scan_absorbs_build_tag() {
        let parsed = parse("my-pkg-1.0rc1-2abc.tar.gz", None).unwrap();
        assert_eq!(parsed.heuristic, Heuristic::SuffixScan);
        assert_eq!(parsed.package, "my-pkg");
        assert_eq!(parsed.version, version("1.0rc1"));
        assert_eq!(parsed.build_tag.as_deref(), Some("2abc"));
    }

    #[test]
    fn test_legacy_versions_are_kept() {
        let parsed = parse("my-pkg-dev.tar.gz", None).unwrap();
        assert!(!parsed.version.is_strict());
        assert_eq!(parsed.version.to_string(), "dev");
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Foo_Bar"), "foo-bar");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("a__-.b"), "a-b");
        assert_eq!(normalize_name("pip"), "pip");
    }
}

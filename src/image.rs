//! The process-wide merged view of every index and the cache
//!
//! Contexts never copy the image; they only filter it. All of it lives
//! behind the single mutex held in [`SharedState`], and that mutex is only
//! ever taken around in-memory merges, never around network or disk I/O.

use crate::context::ContextRegistry;
use crate::filename::{normalize_name, ParsedRecord};
use crate::version::PackageVersion;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// One downloadable file
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub cached_path: Option<PathBuf>,
    pub sources: Vec<Url>,
    pub record: Arc<ParsedRecord>,
}

/// Files of one package, by filename and by version
#[derive(Debug, Default)]
pub struct PackageFiles {
    files: BTreeMap<String, FileEntry>,
    versions: BTreeMap<PackageVersion, BTreeSet<String>>,
}

impl PackageFiles {
    fn entry(&mut self, record: ParsedRecord) -> &mut FileEntry {
        let filename = record.filename.clone();
        self.versions
            .entry(record.version.clone())
            .or_default()
            .insert(filename.clone());

        let entry = self.files.entry(filename).or_insert_with(|| FileEntry {
            cached_path: None,
            sources: Vec::new(),
            record: Arc::new(record.clone()),
        });
        // A cache-seeded record has no fragment; adopt the listed one.
        if entry.record.fragment.is_none()
            && record.fragment.is_some()
            && entry.record.version == record.version
        {
            entry.record = Arc::new(record);
        }
        entry
    }

    /// Merge a file discovered on an upstream index
    pub fn insert_source(&mut self, record: ParsedRecord, source: Url) {
        let entry = self.entry(record);
        if !entry.sources.contains(&source) {
            entry.sources.push(source);
        }
    }

    /// Merge a file already present in the cache
    pub fn insert_cached(&mut self, record: ParsedRecord, path: PathBuf) {
        self.entry(record).cached_path = Some(path);
    }

    pub fn file(&self, filename: &str) -> Option<&FileEntry> {
        self.files.get(filename)
    }

    pub fn file_mut(&mut self, filename: &str) -> Option<&mut FileEntry> {
        self.files.get_mut(filename)
    }

    /// Resolve a requested filename: exact first, then ignoring case and
    /// `_`/`-` differences.
    pub fn resolve_filename(&self, requested: &str) -> Option<&str> {
        if let Some((name, _)) = self.files.get_key_value(requested) {
            return Some(name.as_str());
        }
        let wanted = normalize_filename(requested);
        self.files
            .keys()
            .find(|name| normalize_filename(name) == wanted)
            .map(|name| name.as_str())
    }

    pub fn versions(&self) -> impl Iterator<Item = &PackageVersion> {
        self.versions.keys()
    }

    pub fn files_for<'a>(&'a self, version: &PackageVersion) -> impl Iterator<Item = &'a FileEntry> {
        self.versions
            .get(version)
            .into_iter()
            .flatten()
            .filter_map(move |name| self.files.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn has_cached_files(&self) -> bool {
        self.files.values().any(|entry| entry.cached_path.is_some())
    }
}

fn normalize_filename(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

/// Normalized package name → its files
#[derive(Debug, Default)]
pub struct PackageImage {
    packages: BTreeMap<String, PackageFiles>,
}

impl PackageImage {
    pub fn package(&self, name: &str) -> Option<&PackageFiles> {
        self.packages.get(&normalize_name(name))
    }

    pub fn package_mut(&mut self, name: &str) -> &mut PackageFiles {
        self.packages.entry(normalize_name(name)).or_default()
    }

    pub fn existing_package_mut(&mut self, name: &str) -> Option<&mut PackageFiles> {
        self.packages.get_mut(&normalize_name(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(|name| name.as_str())
    }
}

/// Listing state of one package on one index
#[derive(Debug, Clone)]
pub struct PackageStatus {
    pub versions_listed: bool,
    pub url: Url,
}

/// Per-index bookkeeping so listings are pulled once per process
#[derive(Debug, Default)]
pub struct IndexStatus {
    pub fully_listed: bool,
    pub packages: HashMap<String, PackageStatus>,
}

/// Everything guarded by the facade's one lock
#[derive(Debug)]
pub struct FacadeState {
    pub image: PackageImage,
    pub status: HashMap<String, IndexStatus>,
    pub contexts: ContextRegistry,
}

impl FacadeState {
    pub fn new(contexts: ContextRegistry) -> Self {
        Self {
            image: PackageImage::default(),
            status: HashMap::new(),
            contexts,
        }
    }

    pub fn index_status(&mut self, index: &Url) -> &mut IndexStatus {
        self.status.entry(index.to_string()).or_default()
    }
}

pub type SharedState = Arc<Mutex<FacadeState>>;

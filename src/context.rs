//! Named, stackable version-constraint contexts
//!
//! A context decides which versions of each package a client may see and
//! which upstream indices are consulted. Contexts are created from a
//! snapshot of their parent, so later edits to the parent never leak into
//! children that already exist.

use crate::error::{FacadeError, Result};
use crate::filename::normalize_name;
use crate::version::PackageVersion;
use pep440_rs::VersionSpecifiers;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};
use url::Url;

const OPERATOR_CHARS: &[char] = &['<', '>', '=', '!', '~'];

/// One AND-group of specifiers. `None` admits every version.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    text: String,
    specifiers: Option<VersionSpecifiers>,
}

impl ConstraintSet {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let specifiers = if text.is_empty() {
            None
        } else {
            let parsed = VersionSpecifiers::from_str(text).map_err(|e| {
                FacadeError::Configuration(format!("bad version constraint '{}': {}", text, e))
            })?;
            Some(parsed)
        };
        Ok(Self {
            text: text.to_string(),
            specifiers,
        })
    }

    pub fn accepts(&self, version: &PackageVersion) -> bool {
        match &self.specifiers {
            Some(specifiers) => version.satisfies(specifiers),
            None => true,
        }
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A named set of constraints and upstream indices
#[derive(Debug, Clone)]
pub struct Context {
    name: String,
    constraints: BTreeMap<String, Vec<ConstraintSet>>,
    indices: Vec<Url>,
}

impl Context {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraints: BTreeMap::new(),
            indices: Vec::new(),
        }
    }

    /// Start from a deep copy of `parent`'s constraints and indices
    pub fn inherit(name: &str, parent: &Context) -> Self {
        Self {
            name: name.to_string(),
            constraints: parent.constraints.clone(),
            indices: parent.indices.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> &[Url] {
        &self.indices
    }

    pub fn constraints_for(&self, package: &str) -> Option<&[ConstraintSet]> {
        self.constraints
            .get(&normalize_name(package))
            .map(|alternatives| alternatives.as_slice())
    }

    /// Apply `package op-expr` entries separated by `;` or newlines.
    ///
    /// Packages named in `reset` lose their inherited constraints first.
    /// Every other entry is added as an extra OR-alternative. Indices are
    /// appended as given.
    pub fn apply_update(&mut self, reset: &[String], specs: &str, indices: &[Url]) -> Result<()> {
        let mut parsed = Vec::new();
        for entry in specs.split(|c: char| c == ';' || c == '\n') {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            parsed.push(parse_entry(entry)?);
        }

        for package in reset {
            if self.constraints.remove(&normalize_name(package)).is_some() {
                debug!("Context {}: reset constraints for {}", self.name, package);
            }
        }

        for (package, alternatives) in parsed {
            debug!(
                "Context {}: {} += {}",
                self.name,
                package,
                alternatives
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(" | ")
            );
            self.constraints
                .entry(package)
                .or_default()
                .extend(alternatives);
        }

        self.indices.extend(indices.iter().cloned());
        Ok(())
    }

    /// Admit only `==version` alternatives for each listed package
    pub fn pin_to_listing<'a, I>(&mut self, package: &str, versions: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a PackageVersion>,
    {
        let pins = versions
            .into_iter()
            .filter(|version| version.is_strict())
            .map(|version| ConstraintSet::parse(&format!("=={}", version)))
            .collect::<Result<Vec<_>>>()?;
        if pins.is_empty() {
            return Ok(());
        }
        self.constraints
            .entry(normalize_name(package))
            .or_default()
            .extend(pins);
        Ok(())
    }

    /// Keep the candidates at least one OR-alternative accepts
    pub fn filter_versions<'a, I>(&self, package: &str, candidates: I) -> Vec<&'a PackageVersion>
    where
        I: IntoIterator<Item = &'a PackageVersion>,
    {
        match self.constraints_for(package) {
            None => candidates.into_iter().collect(),
            Some(alternatives) => candidates
                .into_iter()
                .filter(|version| alternatives.iter().any(|alt| alt.accepts(version)))
                .collect(),
        }
    }
}

/// Split `pip>=7,<8|==6.1.1` into a normalized name and its alternatives
fn parse_entry(entry: &str) -> Result<(String, Vec<ConstraintSet>)> {
    let (package, expr) = match entry.find(OPERATOR_CHARS) {
        Some(idx) => (entry[..idx].trim(), &entry[idx..]),
        None => (entry, ""),
    };
    if package.is_empty() {
        return Err(FacadeError::Configuration(format!(
            "constraint '{}' names no package",
            entry
        )));
    }

    let mut alternatives = expr
        .split('|')
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .map(ConstraintSet::parse)
        .collect::<Result<Vec<_>>>()?;
    if alternatives.is_empty() {
        alternatives.push(ConstraintSet::parse("")?);
    }

    Ok((normalize_name(package), alternatives))
}

/// Registry of contexts plus the stack of active ones.
///
/// The default context sits at the bottom of the stack and can never be
/// popped.
#[derive(Debug)]
pub struct ContextRegistry {
    contexts: HashMap<String, Context>,
    stack: Vec<String>,
    default: String,
}

impl ContextRegistry {
    pub fn new(default: Context) -> Self {
        let name = default.name.clone();
        let mut contexts = HashMap::new();
        contexts.insert(name.clone(), default);
        Self {
            contexts,
            stack: vec![name.clone()],
            default: name,
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Context> {
        self.contexts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Context> {
        self.contexts.get_mut(name)
    }

    /// Create (or replace) a context from a snapshot of `parent`.
    /// An unknown or absent parent yields an empty context.
    pub fn create(&mut self, name: &str, parent: Option<&str>) -> &mut Context {
        let context = match parent.and_then(|p| self.contexts.get(p)) {
            Some(parent) => Context::inherit(name, parent),
            None => {
                if let Some(parent) = parent {
                    warn!("Parent context {} for {} does not exist", parent, name);
                }
                Context::new(name)
            }
        };
        match self.contexts.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(context);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(context),
        }
    }

    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    pub fn active_name(&self) -> &str {
        self.stack.last().unwrap_or(&self.default)
    }

    pub fn active(&self) -> &Context {
        self.contexts
            .get(self.active_name())
            .or_else(|| self.contexts.get(&self.default))
            .expect("default context is always registered")
    }

    /// Make `name` the active context.
    ///
    /// Pushing the current top is a no-op; pushing a context that is
    /// already lower in the stack pops back to it instead of duplicating.
    pub fn push(&mut self, name: &str) -> bool {
        if !self.contexts.contains_key(name) {
            warn!("Cannot push unknown context {}", name);
            return false;
        }
        match self.stack.iter().position(|entry| entry == name) {
            Some(idx) => self.stack.truncate(idx + 1),
            None => self.stack.push(name.to_string()),
        }
        true
    }

    /// Pop `name` (or the top when `None`) and everything above it.
    ///
    /// Popping the default context, or a context that is not on the stack,
    /// resets the stack to just the default and reports failure.
    pub fn pop(&mut self, name: Option<&str>) -> bool {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.active_name().to_string(),
        };

        if name == self.default {
            warn!("Refusing to pop default context {}", name);
            self.reset_stack();
            return false;
        }

        match self.stack.iter().position(|entry| *entry == name) {
            Some(idx) => {
                self.stack.truncate(idx);
                true
            }
            None => {
                warn!("Context {} is not on the stack", name);
                self.reset_stack();
                false
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack = vec![self.default.clone()];
    }
}

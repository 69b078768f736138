//! Startup options
//!
//! Everything can come from a JSON file (kebab-case keys) and be
//! overridden on the command line. [`ProxyConfig::validate`] runs once
//! before anything is bound or generated; any error it returns is fatal.

use crate::certificate::CertificateOptions;
use crate::error::{FacadeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use url::Url;

/// A context declared up front in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ContextConfig {
    pub name: String,
    pub parent: Option<String>,
    pub reset: Vec<String>,
    pub constraints: Vec<String>,
    pub indices: Vec<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    pub interfaces: Vec<String>,
    pub port: Option<u16>,
    /// `START-END`, tried in order until one binds
    pub port_range: Option<String>,
    pub chroot: PathBuf,
    /// Leave system CA bundles alone
    pub no_sudo: bool,
    pub default_context: String,
    pub indices: Vec<Url>,
    pub constraining_indices: Vec<Url>,
    pub cache: PathBuf,
    pub constraints: Vec<String>,
    /// Seconds, handed to clients through their config files
    pub timeout: u64,
    pub certpath: PathBuf,
    pub certfile: Option<PathBuf>,
    pub certfile_key: Option<PathBuf>,
    pub certfile_key_password: Option<String>,
    pub certroot: Option<PathBuf>,
    pub certroot_key: Option<PathBuf>,
    pub certroot_key_password: Option<String>,
    pub no_certroot: bool,
    pub venvs: Vec<PathBuf>,
    pub contexts: Vec<ContextConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            interfaces: vec!["127.0.0.1".to_string()],
            port: None,
            port_range: None,
            chroot: PathBuf::from("/"),
            no_sudo: false,
            default_context: "default".to_string(),
            indices: vec![Url::parse("https://pypi.org/simple/").expect("static URL")],
            constraining_indices: Vec::new(),
            cache: PathBuf::from("./cache"),
            constraints: Vec::new(),
            timeout: 60,
            certpath: PathBuf::from("./certs"),
            certfile: None,
            certfile_key: None,
            certfile_key_password: None,
            certroot: None,
            certroot_key: None,
            certroot_key_password: None,
            no_certroot: false,
            venvs: Vec::new(),
            contexts: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load options from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| FacadeError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Reject contradictory options and give every index a trailing `/`
    pub fn validate(&mut self) -> Result<()> {
        let fail = |message: String| Err(FacadeError::Configuration(message));

        if self.interfaces.is_empty() {
            return fail("at least one interface is required".to_string());
        }
        if self.indices.is_empty() {
            return fail("at least one index is required".to_string());
        }
        if self.default_context.is_empty() || self.default_context.contains('/') {
            return fail(format!("invalid default context '{}'", self.default_context));
        }
        if self.port.is_some() && self.port_range.is_some() {
            return fail("port and port-range are mutually exclusive".to_string());
        }
        self.ports()?;

        if self.no_certroot
            && (self.certroot.is_some() || self.certroot_key.is_some() || self.certroot_key_password.is_some())
        {
            return fail("no-certroot contradicts certroot options".to_string());
        }
        if self.certfile_key_password.is_some() && self.certfile_key.is_none() {
            return fail("certfile-key-password given without certfile-key".to_string());
        }

        let mut declared = HashSet::from([self.default_context.as_str()]);
        for context in &self.contexts {
            if context.name.is_empty() || context.name.contains('/') {
                return fail(format!("invalid context name '{}'", context.name));
            }
            if let Some(parent) = &context.parent {
                if !declared.contains(parent.as_str()) {
                    return fail(format!(
                        "context '{}' names parent '{}' which is not declared before it",
                        context.name, parent
                    ));
                }
            }
            if !declared.insert(context.name.as_str()) {
                return fail(format!("context '{}' declared twice", context.name));
            }
        }

        for url in self
            .indices
            .iter_mut()
            .chain(self.constraining_indices.iter_mut())
            .chain(self.contexts.iter_mut().flat_map(|c| c.indices.iter_mut()))
        {
            with_trailing_slash(url);
        }
        Ok(())
    }

    /// Ports to try, in order. Port 0 asks the OS for any free port.
    pub fn ports(&self) -> Result<RangeInclusive<u16>> {
        if let Some(port) = self.port {
            return Ok(port..=port);
        }
        let Some(range) = &self.port_range else {
            return Ok(0..=0);
        };

        let bad = || FacadeError::Configuration(format!("malformed port range '{}'", range));
        let (start, end) = range.split_once('-').ok_or_else(bad)?;
        let start: u16 = start.trim().parse().map_err(|_| bad())?;
        let end: u16 = end.trim().parse().map_err(|_| bad())?;
        if start == 0 || start > end {
            return Err(bad());
        }
        Ok(start..=end)
    }

    /// Default-context constraints joined for [`crate::context::Context::apply_update`]
    pub fn constraint_text(&self) -> String {
        self.constraints.join(";")
    }

    pub fn certificate_options(&self) -> CertificateOptions {
        CertificateOptions {
            certpath: self.certpath.clone(),
            certroot: self.certroot.clone(),
            certroot_key: self.certroot_key.clone(),
            certroot_key_password: self.certroot_key_password.clone(),
            certfile: self.certfile.clone(),
            certfile_key: self.certfile_key.clone(),
            certfile_key_password: self.certfile_key_password.clone(),
            no_certroot: self.no_certroot,
            hosts: self.interfaces.clone(),
        }
    }
}

fn with_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}

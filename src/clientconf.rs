//! Client configuration files pointing installers at the facade
//!
//! Each file kind knows how to render itself. [`ConfigBackups`] owns the
//! registered locations, keeps the original bytes of anything it touches,
//! and puts them back on [`ConfigBackups::clean`].

use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What every rendered file points at
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Index URL including the active context, ending in `/`
    pub index_url: String,
    /// CA bundle path as seen from inside the configured root
    pub cert: PathBuf,
    pub timeout: u64,
}

/// One kind of client configuration file
pub trait ConfigKind: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn render(&self, settings: &ClientSettings) -> String;
}

/// `pip.conf`
#[derive(Debug, Clone, Copy)]
pub struct PipConf;

impl ConfigKind for PipConf {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn render(&self, settings: &ClientSettings) -> String {
        format!(
            "[global]\nindex-url = {}\ncert = {}\ntimeout = {}\n",
            settings.index_url,
            settings.cert.display(),
            settings.timeout
        )
    }
}

/// `.pydistutils.cfg`, read by easy_install
#[derive(Debug, Clone, Copy)]
pub struct DistutilsConf;

impl ConfigKind for DistutilsConf {
    fn name(&self) -> &'static str {
        "distutils"
    }

    fn render(&self, settings: &ClientSettings) -> String {
        format!("[easy_install]\nindex_url = {}\n", settings.index_url)
    }
}

#[derive(Debug)]
struct Registration {
    kind: Arc<dyn ConfigKind>,
    paths: Vec<PathBuf>,
    auto_ensure: bool,
}

/// Registered config locations plus the originals they replaced
#[derive(Debug, Default)]
pub struct ConfigBackups {
    registrations: Vec<Registration>,
    /// `None` records that the file did not exist before
    originals: BTreeMap<PathBuf, Option<Vec<u8>>>,
}

impl ConfigBackups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manage `paths` as files of `kind`. With `auto_ensure` missing files
    /// are created; otherwise only files that already exist are rewritten.
    pub fn register(&mut self, kind: Arc<dyn ConfigKind>, paths: Vec<PathBuf>, auto_ensure: bool) {
        debug!("Registered {} {} config locations", paths.len(), kind.name());
        self.registrations.push(Registration {
            kind,
            paths,
            auto_ensure,
        });
    }

    /// Register pip and distutils files for a filesystem root
    pub fn register_root(&mut self, root: &Path) {
        self.register(Arc::new(PipConf), vec![root.join("etc/pip.conf")], true);
        self.register(
            Arc::new(DistutilsConf),
            vec![root.join("root/.pydistutils.cfg")],
            false,
        );
    }

    /// Register pip and distutils files inside a virtualenv
    pub fn register_venv(&mut self, venv: &Path) {
        self.register(Arc::new(PipConf), vec![venv.join("pip.conf")], true);
        self.register(Arc::new(DistutilsConf), vec![venv.join(".pydistutils.cfg")], true);
    }

    /// Re-render every registered file of one kind
    pub fn update(&mut self, kind: &str, settings: &ClientSettings) -> Result<usize> {
        let mut written = 0;
        for registration in self.registrations.iter().filter(|r| r.kind.name() == kind) {
            let content = registration.kind.render(settings);
            for path in &registration.paths {
                if !registration.auto_ensure && !path.exists() {
                    continue;
                }
                ensure(&mut self.originals, path)?;
                fs::write(path, &content)?;
                written += 1;
            }
        }
        if written > 0 {
            debug!("Rendered {} {} config files for {}", written, kind, settings.index_url);
        }
        Ok(written)
    }

    /// Re-render every registered file
    pub fn update_all(&mut self, settings: &ClientSettings) -> Result<usize> {
        let mut kinds: Vec<&'static str> = self.registrations.iter().map(|r| r.kind.name()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        let mut written = 0;
        for kind in kinds {
            written += self.update(kind, settings)?;
        }
        Ok(written)
    }

    /// Put every touched file back the way it was
    pub fn clean(&mut self) -> usize {
        let mut restored = 0;
        for (path, original) in std::mem::take(&mut self.originals) {
            let outcome = match original {
                Some(bytes) => fs::write(&path, bytes),
                None => fs::remove_file(&path),
            };
            match outcome {
                Ok(()) => restored += 1,
                Err(e) => warn!("Failed to restore {}: {}", path.display(), e),
            }
        }
        if restored > 0 {
            info!("Restored {} client config files", restored);
        }
        restored
    }
}

/// Back the file up once and make sure its directory exists
fn ensure(originals: &mut BTreeMap<PathBuf, Option<Vec<u8>>>, path: &Path) -> std::io::Result<()> {
    if !originals.contains_key(path) {
        let original = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        originals.insert(path.to_path_buf(), original);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

//! PipProxy - a caching HTTPS facade for Python package indices
//!
//! Clients see one index per named context. Each context filters the
//! merged view of several upstream indices and a local file cache through
//! its own version constraints. Contexts stack, so a build step can push a
//! stricter view and pop back to the previous one.

pub mod cache;
pub mod certificate;
pub mod clientconf;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod filename;
pub mod image;
pub mod proxy;
pub mod upstream;
pub mod version;

pub use cache::PackageCache;
pub use certificate::{CertificateManager, CertificateOptions};
pub use clientconf::{ClientSettings, ConfigBackups};
pub use config::{ContextConfig, ProxyConfig};
pub use context::{Context, ContextRegistry};
pub use controller::{ProxyController, Reply, Route};
pub use error::{FacadeError, Result};
pub use filename::{parse as parse_filename, Heuristic, ParsedRecord};
pub use image::{FacadeState, SharedState};
pub use proxy::{Binding, DaemonState, ProxyServer, SHUTDOWN_PATH};
pub use upstream::UpstreamFetcher;
pub use version::PackageVersion;

//! PipProxy - Main entry point
//!
//! Brings up the certificates, the package facade and the HTTPS daemon,
//! points client config files at it, and undoes all of that on Ctrl-C.

use anyhow::{Context as _, Result};
use clap::Parser;
use pipproxy::{Binding, CertificateManager, ConfigBackups, ProxyConfig, ProxyController, ProxyServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

/// PipProxy - a caching HTTPS facade for Python package indices
#[derive(Parser, Debug)]
#[command(name = "pipproxy")]
#[command(author = "PipProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A caching HTTPS facade for Python package indices")]
struct Args {
    /// JSON file with any of the options below (kebab-case keys)
    #[arg(long, env = "PIPPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Interfaces to serve; the first one is bound
    #[arg(long, env = "PIPPROXY_INTERFACES", value_delimiter = ',')]
    interfaces: Vec<String>,

    /// Port to listen on
    #[arg(long, env = "PIPPROXY_PORT")]
    port: Option<u16>,

    /// Range of ports to try, e.g. 3141-3199
    #[arg(long, env = "PIPPROXY_PORT_RANGE")]
    port_range: Option<String>,

    /// Filesystem root whose CA bundles and pip config are patched
    #[arg(long, env = "PIPPROXY_CHROOT")]
    chroot: Option<PathBuf>,

    /// Do not touch system CA bundles
    #[arg(long)]
    no_sudo: bool,

    /// Name of the context at the bottom of the stack
    #[arg(long, env = "PIPPROXY_DEFAULT_CONTEXT")]
    default_context: Option<String>,

    /// Upstream index URLs
    #[arg(long, env = "PIPPROXY_INDICES", value_delimiter = ',')]
    indices: Vec<Url>,

    /// Indices whose contents pin what the default context may see
    #[arg(long, env = "PIPPROXY_CONSTRAINING_INDICES", value_delimiter = ',')]
    constraining_indices: Vec<Url>,

    /// Package cache directory
    #[arg(long, env = "PIPPROXY_CACHE")]
    cache: Option<PathBuf>,

    /// Default-context constraints, e.g. "pip>=7,<8|==6.1.1"
    #[arg(long, value_delimiter = ';')]
    constraints: Vec<String>,

    /// Client timeout in seconds, written to pip.conf
    #[arg(long, env = "PIPPROXY_TIMEOUT")]
    timeout: Option<u64>,

    /// Certificates directory
    #[arg(long, env = "PIPPROXY_CERTPATH")]
    certpath: Option<PathBuf>,

    /// Leaf certificate presented to clients
    #[arg(long)]
    certfile: Option<PathBuf>,

    /// Key of the leaf certificate
    #[arg(long)]
    certfile_key: Option<PathBuf>,

    /// Password of the leaf key
    #[arg(long, env = "PIPPROXY_CERTFILE_KEY_PASSWORD", hide_env_values = true)]
    certfile_key_password: Option<String>,

    /// Root certificate that signs the leaf
    #[arg(long)]
    certroot: Option<PathBuf>,

    /// Key of the root certificate
    #[arg(long)]
    certroot_key: Option<PathBuf>,

    /// Password of the root key
    #[arg(long, env = "PIPPROXY_CERTROOT_KEY_PASSWORD", hide_env_values = true)]
    certroot_key_password: Option<String>,

    /// Use an existing leaf certificate and manage no root
    #[arg(long)]
    no_certroot: bool,

    /// Virtualenvs whose pip config is patched
    #[arg(long, value_delimiter = ',')]
    venvs: Vec<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values win over the config file
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path)?,
            None => ProxyConfig::default(),
        };

        if !self.interfaces.is_empty() {
            config.interfaces = self.interfaces;
        }
        if self.port.is_some() {
            config.port = self.port;
            config.port_range = None;
        }
        if self.port_range.is_some() {
            config.port_range = self.port_range;
            config.port = None;
        }
        if let Some(chroot) = self.chroot {
            config.chroot = chroot;
        }
        config.no_sudo |= self.no_sudo;
        if let Some(default_context) = self.default_context {
            config.default_context = default_context;
        }
        if !self.indices.is_empty() {
            config.indices = self.indices;
        }
        if !self.constraining_indices.is_empty() {
            config.constraining_indices = self.constraining_indices;
        }
        if let Some(cache) = self.cache {
            config.cache = cache;
        }
        config.constraints.extend(self.constraints);
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(certpath) = self.certpath {
            config.certpath = certpath;
        }
        config.certfile = self.certfile.or(config.certfile);
        config.certfile_key = self.certfile_key.or(config.certfile_key);
        config.certfile_key_password = self.certfile_key_password.or(config.certfile_key_password);
        config.certroot = self.certroot.or(config.certroot);
        config.certroot_key = self.certroot_key.or(config.certroot_key);
        config.certroot_key_password = self.certroot_key_password.or(config.certroot_key_password);
        config.no_certroot |= self.no_certroot;
        config.venvs.extend(self.venvs);

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting PipProxy v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config().context("invalid configuration")?;

    let mut certs = CertificateManager::new(config.certificate_options())?;
    if let Err(e) = certs.generate() {
        certs.delete();
        return Err(anyhow::Error::new(e).context("certificate setup failed"));
    }

    let result = serve(&config, &mut certs).await;
    certs.delete();
    result
}

/// Run the daemon until Ctrl-C, restoring client configs on the way out
async fn serve(config: &ProxyConfig, certs: &mut CertificateManager) -> Result<()> {
    let controller = Arc::new(ProxyController::from_config(config).await?);
    info!("Default context is {}", controller.active_context());

    let server = Arc::new(ProxyServer::new(controller.clone(), certs.server_config()?));
    let interface = config.interfaces[0].clone();
    let addr = server
        .start(Binding::Address {
            interface: interface.clone(),
            ports: config.ports()?,
        })
        .await?;

    let cert = client_cert_path(config, certs)?;
    let mut backups = ConfigBackups::new();
    backups.register_root(&config.chroot);
    for venv in &config.venvs {
        backups.register_venv(venv);
    }
    let host = if interface.contains(':') {
        format!("[{}]", interface)
    } else {
        interface
    };
    let base_url = Url::parse(&format!("https://{}:{}/", host, addr.port()))?;
    let outcome = match controller.configure_clients(backups, base_url.clone(), cert, config.timeout) {
        Ok(written) => {
            info!("Serving {} ({} client config files written)", base_url, written);
            tokio::signal::ctrl_c().await.map_err(anyhow::Error::from)
        }
        Err(e) => Err(e.into()),
    };
    info!("Shutting down");

    server.stop().await;
    controller.restore_clients();
    outcome
}

/// The CA path clients should trust, as seen from inside the chroot
fn client_cert_path(config: &ProxyConfig, certs: &mut CertificateManager) -> Result<PathBuf> {
    if config.no_sudo || certs.root_pem().is_none() {
        return Ok(certs.client_trust_path().to_path_buf());
    }

    let installed = certs.install_system_bundles(&config.chroot)?;
    let Some(bundle) = installed.first() else {
        return Ok(certs.client_trust_path().to_path_buf());
    };
    let chroot = config.chroot.canonicalize()?;
    Ok(match bundle.strip_prefix(&chroot) {
        Ok(inside) => Path::new("/").join(inside),
        Err(_) => bundle.clone(),
    })
}

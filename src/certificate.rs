//! Root and leaf certificate management for the HTTPS facade
//!
//! The manager discovers or mints a root CA and a leaf certificate for the
//! listening interfaces, remembers which of those files it created, and
//! deletes only those on teardown. It also appends the root to system CA
//! bundles and later cuts exactly that block back out.

use crate::error::{FacadeError, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SignatureAlgorithm,
    PKCS_ECDSA_P256_SHA256,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufReader, Write};
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// System CA bundle locations, relative to the filesystem root
pub const HOST_CA_BUNDLES: &[&str] = &[
    "etc/ssl/certs/ca-certificates.crt", // Debian/Ubuntu/Alpine
    "etc/pki/tls/certs/ca-bundle.crt",   // RHEL/Fedora
    "etc/ssl/cert.pem",                  // Alpine/macOS
];

const PASSWORD_ENV: &str = "PIPPROXY_KEY_PASSWORD";
const VALIDITY_YEARS: i32 = 10;
const ONE_SHOT_PASSWORD_LEN: usize = 32;

/// Where certificates live and how to open them
#[derive(Debug, Clone, Default)]
pub struct CertificateOptions {
    pub certpath: PathBuf,
    pub certroot: Option<PathBuf>,
    pub certroot_key: Option<PathBuf>,
    pub certroot_key_password: Option<String>,
    pub certfile: Option<PathBuf>,
    pub certfile_key: Option<PathBuf>,
    pub certfile_key_password: Option<String>,
    pub no_certroot: bool,
    /// Names and addresses the leaf certificate must cover
    pub hosts: Vec<String>,
}

#[derive(Debug)]
struct Artifact {
    path: PathBuf,
    preexisted: bool,
}

impl Artifact {
    fn new(path: PathBuf) -> Self {
        let preexisted = path.exists();
        Self { path, preexisted }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn remove_if_owned(&self) {
        if self.preexisted || !self.exists() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// A bundle file the root PEM was appended to
#[derive(Debug)]
struct InstalledBundle {
    path: PathBuf,
    start_line: usize,
    added_newline: bool,
}

/// Discovers, creates and tears down the facade's certificates
pub struct CertificateManager {
    root_cert: Artifact,
    root_key: Artifact,
    leaf_cert: Artifact,
    leaf_key: Artifact,
    root_key_password: Option<String>,
    leaf_key_password: Option<String>,
    no_certroot: bool,
    hosts: Vec<String>,
    root_pem: Option<String>,
    installed: Vec<InstalledBundle>,
}

impl CertificateManager {
    pub fn new(options: CertificateOptions) -> Result<Self> {
        fs::create_dir_all(&options.certpath)?;
        let dir = &options.certpath;
        let or_default = |path: Option<PathBuf>, name: &str| path.unwrap_or_else(|| dir.join(name));

        Ok(Self {
            root_cert: Artifact::new(or_default(options.certroot, "root.crt")),
            root_key: Artifact::new(or_default(options.certroot_key, "root.key")),
            leaf_cert: Artifact::new(or_default(options.certfile, "proxy.crt")),
            leaf_key: Artifact::new(or_default(options.certfile_key, "proxy.key")),
            root_key_password: options.certroot_key_password,
            leaf_key_password: options.certfile_key_password,
            no_certroot: options.no_certroot,
            hosts: options.hosts,
            root_pem: None,
            installed: Vec::new(),
        })
    }

    /// PEM text of the root, once `generate` has run and a root is managed
    pub fn root_pem(&self) -> Option<&str> {
        self.root_pem.as_deref()
    }

    /// What clients should trust: the root when one is managed, otherwise
    /// the provided leaf itself.
    pub fn client_trust_path(&self) -> &Path {
        match self.root_pem {
            Some(_) => &self.root_cert.path,
            None => &self.leaf_cert.path,
        }
    }

    /// Make sure a usable leaf certificate and key exist
    pub fn generate(&mut self) -> Result<()> {
        if self.no_certroot {
            if !(self.leaf_cert.exists() && self.leaf_key.exists()) {
                return Err(FacadeError::Configuration(format!(
                    "without a managed root, {} and {} must already exist",
                    self.leaf_cert.path.display(),
                    self.leaf_key.path.display()
                )));
            }
            info!("Using existing certificate {}", self.leaf_cert.path.display());
            return Ok(());
        }

        if !self.root_cert.exists() {
            let key = if self.root_key.exists() {
                load_key(&self.root_key.path, self.root_key_password.as_deref())?
            } else {
                // Only this process ever needs a generated root key.
                let password = self.root_key_password.get_or_insert_with(one_shot_password).clone();
                let key = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;
                store_key(&self.root_key.path, &key, Some(&password))?;
                key
            };
            let root = Certificate::from_params(root_params(key))?;
            fs::write(&self.root_cert.path, root.serialize_pem()?)?;
            info!("Created root certificate {}", self.root_cert.path.display());
        } else if !self.root_key.exists() && !(self.leaf_cert.exists() && self.leaf_key.exists()) {
            return Err(FacadeError::Configuration(format!(
                "root certificate {} has no key {}, so a leaf cannot be issued",
                self.root_cert.path.display(),
                self.root_key.path.display()
            )));
        }
        let root_pem = fs::read_to_string(&self.root_cert.path)?;

        if !self.leaf_cert.exists() {
            let key = if self.leaf_key.exists() {
                load_key(&self.leaf_key.path, self.leaf_key_password.as_deref())?
            } else {
                let key = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;
                store_key(&self.leaf_key.path, &key, None)?;
                key
            };

            let root_key = load_key(&self.root_key.path, self.root_key_password.as_deref())?;
            let root = Certificate::from_params(CertificateParams::from_ca_cert_pem(&root_pem, root_key)?)?;
            let leaf = Certificate::from_params(leaf_params(key, &self.hosts))?;
            fs::write(&self.leaf_cert.path, leaf.serialize_pem_with_signer(&root)?)?;
            info!(
                "Issued {} for {} signed by {}",
                self.leaf_cert.path.display(),
                self.hosts.join(", "),
                self.root_cert.path.display()
            );
        } else if !self.leaf_key.exists() {
            return Err(FacadeError::Configuration(format!(
                "certificate {} has no key {}",
                self.leaf_cert.path.display(),
                self.leaf_key.path.display()
            )));
        }

        self.root_pem = Some(root_pem);
        Ok(())
    }

    /// TLS server configuration for the leaf, HTTP/1.1 only, with the
    /// server's cipher preference winning.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let cert_pem = fs::read(&self.leaf_cert.path)?;
        let mut chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice())).collect::<std::io::Result<_>>()?;
        if let Some(root) = &self.root_pem {
            chain.extend(
                rustls_pemfile::certs(&mut BufReader::new(root.as_bytes())).collect::<std::io::Result<Vec<_>>>()?,
            );
        }
        if chain.is_empty() {
            return Err(FacadeError::Certificate(format!(
                "no certificate found in {}",
                self.leaf_cert.path.display()
            )));
        }

        let key_pem = read_key_pem(&self.leaf_key.path, self.leaf_key_password.as_deref())?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))?
            .ok_or_else(|| {
                FacadeError::Certificate(format!("no private key found in {}", self.leaf_key.path.display()))
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| FacadeError::Certificate(e.to_string()))?;
        config.ignore_client_order = true;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Append the root to every system bundle found under `root_dir`
    pub fn install_system_bundles(&mut self, root_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut installed = Vec::new();
        for bundle in HOST_CA_BUNDLES {
            let path = root_dir.join(bundle);
            let Ok(canonical) = fs::canonicalize(&path) else {
                continue;
            };
            if seen.insert(canonical.clone()) {
                self.install_bundle(&canonical)?;
                installed.push(canonical);
            }
        }
        Ok(installed)
    }

    /// Append the root PEM to one bundle file and remember where it went
    pub fn install_bundle(&mut self, path: &Path) -> Result<()> {
        let Some(root_pem) = self.root_pem.as_deref() else {
            return Ok(());
        };
        if self.installed.iter().any(|bundle| bundle.path == path) {
            return Ok(());
        }

        let mut content = fs::read_to_string(path)?;
        let added_newline = !content.is_empty() && !content.ends_with('\n');
        if added_newline {
            content.push('\n');
        }
        let start_line = content.split_inclusive('\n').count();
        content.push_str(root_pem);
        if !root_pem.ends_with('\n') {
            content.push('\n');
        }
        fs::write(path, content)?;

        info!("Added root certificate to {}", path.display());
        self.installed.push(InstalledBundle {
            path: path.to_path_buf(),
            start_line,
            added_newline,
        });
        Ok(())
    }

    /// Cut the root back out of every bundle it was added to
    pub fn restore_bundles(&mut self) {
        let Some(root_pem) = self.root_pem.clone() else {
            return;
        };
        let mut block: Vec<String> = root_pem.split_inclusive('\n').map(str::to_string).collect();
        if let Some(last) = block.last_mut().filter(|line| !line.ends_with('\n')) {
            last.push('\n');
        }

        for bundle in self.installed.drain(..) {
            match excise_block(&bundle, &block) {
                Ok(true) => info!("Removed root certificate from {}", bundle.path.display()),
                Ok(false) => warn!(
                    "Root certificate no longer present in {}, leaving it alone",
                    bundle.path.display()
                ),
                Err(e) => warn!("Failed to restore {}: {}", bundle.path.display(), e),
            }
        }
    }

    /// Delete every certificate and key this manager created
    pub fn delete(&mut self) {
        self.restore_bundles();
        for artifact in [&self.leaf_cert, &self.leaf_key, &self.root_cert, &self.root_key] {
            artifact.remove_if_owned();
        }
    }
}

fn excise_block(bundle: &InstalledBundle, block: &[String]) -> std::io::Result<bool> {
    let content = fs::read_to_string(&bundle.path)?;
    let mut lines: Vec<&str> = content.split_inclusive('\n').collect();

    let matches_at = |start: usize| {
        lines.len() >= start + block.len()
            && lines[start..start + block.len()].iter().zip(block).all(|(a, b)| *a == b.as_str())
    };
    let start = if matches_at(bundle.start_line) {
        bundle.start_line
    } else {
        match (0..lines.len()).find(|&start| matches_at(start)) {
            Some(start) => start,
            None => return Ok(false),
        }
    };
    let at_end = start + block.len() == lines.len();
    lines.drain(start..start + block.len());

    let mut restored: String = lines.concat();
    if bundle.added_newline && at_end {
        restored.pop();
    }
    fs::write(&bundle.path, restored)?;
    Ok(true)
}

fn signature_algorithm(key: &KeyPair) -> &'static SignatureAlgorithm {
    key.compatible_algs().next().unwrap_or(&PKCS_ECDSA_P256_SHA256)
}

fn validity(params: &mut CertificateParams) {
    let days = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() / 86_400)
        .unwrap_or(0);
    let year = 1970 + (days as f64 / 365.2425) as i32;
    params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
    params.not_after = rcgen::date_time_ymd(year + VALIDITY_YEARS, 1, 1);
}

fn root_params(key: KeyPair) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::new());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "pipproxy root CA");
    dn.push(DnType::OrganizationName, "pipproxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.alg = signature_algorithm(&key);
    params.key_pair = Some(key);
    validity(&mut params);
    params
}

fn leaf_params(key: KeyPair, hosts: &[String]) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::new());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hosts.first().map(String::as_str).unwrap_or("localhost"));
    params.distinguished_name = dn;

    let mut names: Vec<&str> = hosts.iter().map(String::as_str).collect();
    names.extend(["localhost", "127.0.0.1"]);
    for name in names {
        let san = match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(name.to_string()),
        };
        if !params.subject_alt_names.contains(&san) {
            params.subject_alt_names.push(san);
        }
    }

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    params.alg = signature_algorithm(&key);
    params.key_pair = Some(key);
    validity(&mut params);
    params
}

fn one_shot_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ONE_SHOT_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Read a PEM key, decrypting it when a password is configured
fn read_key_pem(path: &Path, password: Option<&str>) -> Result<String> {
    let pem = fs::read_to_string(path)?;
    match password {
        Some(password) => openssl_pkey(&pem, &["-passin", &format!("env:{}", PASSWORD_ENV)], password),
        None => Ok(pem),
    }
}

fn load_key(path: &Path, password: Option<&str>) -> Result<KeyPair> {
    let pem = read_key_pem(path, password)?;
    KeyPair::from_pem(&pem)
        .map_err(|e| FacadeError::Certificate(format!("unusable key {}: {}", path.display(), e)))
}

fn store_key(path: &Path, key: &KeyPair, password: Option<&str>) -> Result<()> {
    let pem = key.serialize_pem();
    let pem = match password {
        Some(password) => openssl_pkey(&pem, &["-aes256", "-passout", &format!("env:{}", PASSWORD_ENV)], password)?,
        None => pem,
    };
    write_restricted_file(path, &pem)?;
    debug!("Wrote key {}", path.display());
    Ok(())
}

/// Run `openssl pkey`, feeding the key on stdin and the password through
/// the environment so it never shows up in a process listing.
fn openssl_pkey(key_pem: &str, args: &[&str], password: &str) -> Result<String> {
    let mut child = Command::new("openssl")
        .arg("pkey")
        .args(args)
        .env(PASSWORD_ENV, password)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FacadeError::Certificate(format!("cannot run openssl: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(key_pem.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(FacadeError::Certificate(format!(
            "openssl pkey failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout).map_err(|e| FacadeError::Certificate(e.to_string()))
}

fn write_restricted_file(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

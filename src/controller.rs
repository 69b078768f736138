//! Request routing and context lifecycle
//!
//! Paths look like `/{context}/{package}/{filename}`. The controller picks
//! the context, asks the fetcher for a package list, a version list or a
//! file, and renders listings as minimal HTML. Pushing or popping a context
//! re-renders every registered client config file so installers follow the
//! active context.

use crate::cache::PackageCache;
use crate::clientconf::{ClientSettings, ConfigBackups};
use crate::config::ProxyConfig;
use crate::context::{Context, ContextRegistry};
use crate::error::Result;
use crate::image::{FacadeState, SharedState};
use crate::upstream::{PackageBody, UpstreamFetcher};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// What a request resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Packages { context: String },
    Versions { context: String, package: String },
    File { context: String, package: String, filename: String },
}

/// A routed answer, before it becomes an HTTP response
pub enum Reply {
    Html(String),
    File(PackageBody),
    NotFound(String),
}

#[derive(Debug, Clone)]
struct ClientTarget {
    base_url: Url,
    cert: PathBuf,
    timeout: u64,
}

#[derive(Debug, Default)]
struct Clients {
    backups: ConfigBackups,
    target: Option<ClientTarget>,
}

pub struct ProxyController {
    state: SharedState,
    fetcher: UpstreamFetcher,
    clients: Mutex<Clients>,
}

impl ProxyController {
    pub fn new(state: SharedState, fetcher: UpstreamFetcher) -> Self {
        Self {
            state,
            fetcher,
            clients: Mutex::new(Clients::default()),
        }
    }

    /// Build the controller, seed it from the cache and set up every
    /// configured context.
    pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
        let mut default = Context::new(&config.default_context);
        default.apply_update(&[], "", &config.indices)?;
        let state: SharedState = Arc::new(Mutex::new(FacadeState::new(ContextRegistry::new(default))));

        let cache = PackageCache::new(&config.cache)?;
        cache.seed(&state)?;
        let controller = Self::new(state.clone(), UpstreamFetcher::new(state, cache)?);

        controller.apply_constraining_indices(&config.constraining_indices).await?;
        {
            let mut guard = controller.state.lock();
            let default_name = guard.contexts.default_name().to_string();
            if let Some(default) = guard.contexts.get_mut(&default_name) {
                default.apply_update(&[], &config.constraint_text(), &[])?;
            }
        }
        for context in &config.contexts {
            controller.register_context(
                &context.name,
                Some(context.parent.as_deref().unwrap_or(&config.default_context)),
                &context.reset,
                &context.constraints.join(";"),
                &context.indices,
            )?;
        }
        Ok(controller)
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn fetcher(&self) -> &UpstreamFetcher {
        &self.fetcher
    }

    pub fn active_context(&self) -> String {
        self.state.lock().contexts.active_name().to_string()
    }

    /// Create or replace `name` from a snapshot of `parent` (the active
    /// context when `None`), then apply resets, constraints and indices.
    pub fn register_context(
        &self,
        name: &str,
        parent: Option<&str>,
        reset: &[String],
        constraints: &str,
        indices: &[Url],
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let parent = parent
            .map(str::to_string)
            .unwrap_or_else(|| guard.contexts.active_name().to_string());
        guard
            .contexts
            .create(name, Some(&parent))
            .apply_update(reset, constraints, indices)?;
        info!("Registered context {} (parent {})", name, parent);
        Ok(())
    }

    pub fn push_context(&self, name: &str) -> bool {
        let pushed = self.state.lock().contexts.push(name);
        if pushed {
            info!("Active context is now {}", name);
            self.refresh_clients();
        }
        pushed
    }

    /// Pop `name` (or the top). Misuse resets to the default context.
    pub fn pop_context(&self, name: Option<&str>) -> bool {
        let popped = self.state.lock().contexts.pop(name);
        info!("Active context is now {}", self.active_context());
        self.refresh_clients();
        popped
    }

    /// Pin the default context to exactly what each constraining index
    /// serves.
    pub async fn apply_constraining_indices(&self, indices: &[Url]) -> Result<usize> {
        let mut pinned = 0;
        for index in indices {
            let contents = self.fetcher.index_contents(index).await;

            let mut guard = self.state.lock();
            let default_name = guard.contexts.default_name().to_string();
            if let Some(default) = guard.contexts.get_mut(&default_name) {
                for (package, versions) in &contents {
                    default.pin_to_listing(package, versions)?;
                }
            }
            info!("Constrained {} packages to the contents of {}", contents.len(), index);
            pinned += contents.len();
        }
        Ok(pinned)
    }

    /// Start rendering client config files against `base_url`
    pub fn configure_clients(
        &self,
        backups: ConfigBackups,
        base_url: Url,
        cert: PathBuf,
        timeout: u64,
    ) -> Result<usize> {
        let mut clients = self.clients.lock();
        let target = ClientTarget {
            base_url,
            cert,
            timeout,
        };
        let settings = self.settings_for(&target);
        clients.backups = backups;
        clients.target = Some(target);
        clients.backups.update_all(&settings)
    }

    /// Restore every client config file touched so far
    pub fn restore_clients(&self) -> usize {
        let mut clients = self.clients.lock();
        clients.target = None;
        clients.backups.clean()
    }

    fn refresh_clients(&self) {
        let mut clients = self.clients.lock();
        let Some(target) = clients.target.clone() else {
            return;
        };
        let settings = self.settings_for(&target);
        if let Err(e) = clients.backups.update_all(&settings) {
            warn!("Failed to update client config files: {}", e);
        }
    }

    fn settings_for(&self, target: &ClientTarget) -> ClientSettings {
        let context = self.active_context();
        let index_url = target
            .base_url
            .join(&format!("{}/", context))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| format!("{}{}/", target.base_url, context));
        ClientSettings {
            index_url,
            cert: target.cert.clone(),
            timeout: target.timeout,
        }
    }

    /// Split a request path into at most three segments and pick a context.
    ///
    /// An unknown leading segment is logged and the active context serves
    /// the request instead.
    pub fn route(&self, path: &str) -> Route {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let guard = self.state.lock();

        let (context, rest) = match segments.split_first() {
            Some((first, rest)) if guard.contexts.contains(first) => (first.to_string(), rest),
            _ => {
                let active = guard.contexts.active_name().to_string();
                if !segments.is_empty() {
                    warn!("No context in {}, serving from {}", path, active);
                }
                let rest = if segments.len() > 2 {
                    &segments[segments.len() - 2..]
                } else {
                    &segments[..]
                };
                (active, rest)
            }
        };

        match rest {
            [] => Route::Packages { context },
            [package] => Route::Versions {
                context,
                package: package.to_string(),
            },
            [package, filename, ..] => Route::File {
                context,
                package: package.to_string(),
                filename: filename.to_string(),
            },
        }
    }

    /// Answer one GET
    pub async fn handle(&self, path: &str) -> Result<Reply> {
        match self.route(path) {
            Route::Packages { context } => {
                let indices = self
                    .state
                    .lock()
                    .contexts
                    .get(&context)
                    .map(|c| c.indices().to_vec())
                    .unwrap_or_default();
                let names = self.fetcher.list_packages(&indices).await;
                let links = names
                    .iter()
                    .map(|name| (format!("/{}/{}/", context, name), name.as_str()));
                Ok(Reply::Html(render_listing(&format!("Packages in {}", context), links)))
            }
            Route::Versions { context, package } => match self.fetcher.list_versions(&context, &package).await {
                Some(listing) => {
                    let links = listing.files.iter().map(|record| {
                        (
                            format!("/{}/{}/{}", context, listing.package, record.href()),
                            record.filename.as_str(),
                        )
                    });
                    Ok(Reply::Html(render_listing(&format!("Links for {}", listing.package), links)))
                }
                None => Ok(Reply::NotFound(format!("No package named {}", package))),
            },
            Route::File {
                context,
                package,
                filename,
            } => {
                let body = self.fetcher.get_package(&context, &package, &filename).await?;
                Ok(Reply::File(body))
            }
        }
    }
}

fn render_listing<'a, I>(title: &str, links: I) -> String
where
    I: IntoIterator<Item = (String, &'a str)>,
{
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>{0}</title></head><body>\n<h1>{0}</h1>\n",
        escape(title)
    );
    for (href, text) in links {
        html.push_str(&format!("<a href=\"{}\">{}</a><br/>\n", escape(&href), escape(text)));
    }
    html.push_str("</body></html>\n");
    html
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

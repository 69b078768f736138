//! Pulling listings and files from upstream package indices
//!
//! Every network operation here follows the same shape: decide what to
//! fetch under the lock, release it, fetch concurrently, then take the
//! lock again only to merge. The merge functions take `&mut FacadeState`
//! and never see a client, which keeps network I/O out of the critical
//! section by construction.

use crate::cache::{CacheWriter, PackageCache};
use crate::error::{FacadeError, Result};
use crate::filename::{normalize_name, parse, ParsedRecord};
use crate::image::{FacadeState, PackageStatus, SharedState};
use crate::version::PackageVersion;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::stream::{self, BoxStream, StreamExt};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

const CONSTRAINING_CONCURRENCY: usize = 16;

static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))[^>]*>"#).unwrap()
});

/// A package file body with its exact length
pub struct PackageBody {
    pub len: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

/// Files of one package visible to a context, in version order
#[derive(Debug, Clone)]
pub struct VersionListing {
    pub package: String,
    pub files: Vec<Arc<ParsedRecord>>,
}

/// Fetches listings and files from upstream indices into the shared image
#[derive(Clone)]
pub struct UpstreamFetcher {
    client: Client,
    state: SharedState,
    cache: PackageCache,
}

impl UpstreamFetcher {
    pub fn new(state: SharedState, cache: PackageCache) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pipproxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FacadeError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            state,
            cache,
        })
    }

    /// Package names reachable through `indices` or already cached.
    ///
    /// Each index's top-level listing is pulled at most once.
    pub async fn list_packages(&self, indices: &[Url]) -> BTreeSet<String> {
        let pending: Vec<Url> = {
            let guard = self.state.lock();
            indices
                .iter()
                .filter(|index| {
                    !guard
                        .status
                        .get(index.as_str())
                        .map_or(false, |status| status.fully_listed)
                })
                .cloned()
                .collect()
        };

        let fetches = pending.into_iter().map(|index| {
            let client = self.client.clone();
            tokio::spawn(async move {
                let page = fetch_page(&client, &index).await;
                (index, page)
            })
        });
        let results = join_all(fetches).await;

        let mut guard = self.state.lock();
        for result in results {
            match result {
                Ok((index, Ok(Some((page_url, html))))) => {
                    merge_package_listing(&mut guard, &index, &page_url, &html)
                }
                Ok((index, Ok(None))) => {
                    warn!("Index {} has no top-level listing (404)", index);
                    guard.index_status(&index).fully_listed = true;
                }
                Ok((_, Err(e))) => warn!("{}", e),
                Err(e) => warn!("Listing task failed: {}", e),
            }
        }

        let mut names = BTreeSet::new();
        for index in indices {
            if let Some(status) = guard.status.get(index.as_str()) {
                names.extend(status.packages.keys().cloned());
            }
        }
        for name in guard.image.names() {
            if guard
                .image
                .package(name)
                .map_or(false, |files| files.has_cached_files())
            {
                names.insert(name.to_string());
            }
        }
        names
    }

    /// Pull `package`'s version listing from every index that has not
    /// served it yet. Returns the versions merged per index.
    async fn fetch_versions(
        &self,
        package: &str,
        indices: &[Url],
    ) -> BTreeMap<String, Vec<PackageVersion>> {
        let name = normalize_name(package);

        let jobs: Vec<(Url, Url)> = {
            let mut guard = self.state.lock();
            let mut jobs = Vec::new();
            for index in indices {
                match guard.index_status(index).packages.get(&name) {
                    Some(status) if status.versions_listed => {}
                    Some(status) => jobs.push((index.clone(), status.url.clone())),
                    None => match index.join(&format!("{}/", name)) {
                        Ok(url) => jobs.push((index.clone(), url)),
                        Err(e) => warn!("Cannot build listing URL for {} on {}: {}", name, index, e),
                    },
                }
            }
            jobs
        };

        let fetches = jobs.into_iter().map(|(index, url)| {
            let client = self.client.clone();
            tokio::spawn(async move {
                let page = fetch_page(&client, &url).await;
                (index, url, page)
            })
        });
        let results = join_all(fetches).await;

        let mut pages = Vec::new();
        for result in results {
            match result {
                Ok((index, url, Err(e))) => {
                    debug!("{}; re-deriving listing path from {}", e, index);
                    if let Some(page) = self.retry_via_listing(&index, &name, &url).await {
                        pages.push(page);
                    }
                }
                Ok(page) => pages.push(page),
                Err(e) => warn!("Version listing task failed: {}", e),
            }
        }

        let mut merged = BTreeMap::new();
        let mut guard = self.state.lock();
        for (index, url, page) in pages {
            match page {
                Ok(Some((page_url, html))) => {
                    let versions = merge_version_listing(&mut guard, &name, &page_url, &html);
                    mark_versions_listed(&mut guard, &index, &name, url);
                    merged.insert(index.to_string(), versions);
                }
                Ok(None) => {
                    debug!("{} is not on {}", name, index);
                    mark_versions_listed(&mut guard, &index, &name, url);
                }
                Err(e) => warn!("{}", e),
            }
        }
        merged
    }

    async fn retry_via_listing(
        &self,
        index: &Url,
        name: &str,
        failed: &Url,
    ) -> Option<(Url, Url, Result<Option<(Url, String)>>)> {
        self.state.lock().index_status(index).fully_listed = false;
        self.list_packages(std::slice::from_ref(index)).await;

        let url = self
            .state
            .lock()
            .index_status(index)
            .packages
            .get(name)
            .map(|status| status.url.clone())?;
        if &url == failed {
            debug!("Listing of {} gave the same path for {}", index, name);
        }
        let page = fetch_page(&self.client, &url).await;
        Some((index.clone(), url, page))
    }

    /// Versions of `package` that `context` may see.
    ///
    /// `None` means no index and no cache knows the package.
    pub async fn list_versions(&self, context: &str, package: &str) -> Option<VersionListing> {
        let indices = self.context_indices(context);
        self.fetch_versions(package, &indices).await;

        let guard = self.state.lock();
        let files = guard.image.package(package).filter(|files| !files.is_empty())?;
        let context = guard
            .contexts
            .get(context)
            .unwrap_or_else(|| guard.contexts.active());

        let mut listing = Vec::new();
        for version in context.filter_versions(package, files.versions()) {
            listing.extend(files.files_for(version).map(|entry| entry.record.clone()));
        }
        Some(VersionListing {
            package: normalize_name(package),
            files: listing,
        })
    }

    /// Stream one file, from the cache if possible, else from a randomly
    /// chosen upstream source while writing it into the cache.
    pub async fn get_package(&self, context: &str, package: &str, filename: &str) -> Result<PackageBody> {
        let name = normalize_name(package);
        let not_available = || FacadeError::NotAvailable {
            package: name.clone(),
            filename: filename.to_string(),
        };

        self.fetch_versions(&name, &self.context_indices(context)).await;

        let (resolved, mut sources) = {
            let guard = self.state.lock();
            let files = guard.image.package(&name).ok_or_else(not_available)?;
            let resolved = files.resolve_filename(filename).ok_or_else(not_available)?;
            let sources = files
                .file(resolved)
                .map(|entry| entry.sources.clone())
                .unwrap_or_default();
            (resolved.to_string(), sources)
        };
        if resolved != filename {
            info!("Serving {} for requested {}", resolved, filename);
        }

        if let Some(cached) = self.cache.read(&self.state, &name, &resolved).await {
            debug!("Cache hit for {}", cached.path.display());
            return Ok(PackageBody {
                len: cached.len,
                stream: cached.into_stream(),
            });
        }

        sources.shuffle(&mut rand::thread_rng());
        for source in sources {
            let response = match self.client.get(source.clone()).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    warn!("{} returned HTTP {}", source, response.status());
                    continue;
                }
                Err(e) => {
                    warn!("Fetching {} failed: {}", source, e);
                    continue;
                }
            };

            match response.content_length() {
                Some(len) => {
                    let writer = match self.cache.writer(&name, &resolved).await {
                        Ok(writer) => Some(writer),
                        Err(e) => {
                            warn!("Not caching {}: {}", resolved, e);
                            None
                        }
                    };
                    info!("Fetching {} from {}", resolved, source);
                    return Ok(PackageBody {
                        len,
                        stream: tee(response, writer, self.state.clone()),
                    });
                }
                None => {
                    // No length to announce; land it in the cache first.
                    let body = response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
                    if let Err(e) = self.cache.write(&self.state, &name, &resolved, body).await {
                        warn!("Download of {} from {} failed: {}", resolved, source, e);
                        continue;
                    }
                    if let Some(cached) = self.cache.read(&self.state, &name, &resolved).await {
                        return Ok(PackageBody {
                            len: cached.len,
                            stream: cached.into_stream(),
                        });
                    }
                }
            }
        }

        Err(not_available())
    }

    /// Every package and version served by one index
    pub async fn index_contents(&self, index: &Url) -> BTreeMap<String, Vec<PackageVersion>> {
        let packages = {
            self.list_packages(std::slice::from_ref(index)).await;
            let mut guard = self.state.lock();
            guard
                .index_status(index)
                .packages
                .keys()
                .cloned()
                .collect::<Vec<_>>()
        };
        info!("Pulling {} version listings from {}", packages.len(), index);

        let key = &index.to_string();
        stream::iter(packages)
            .map(|package| async move {
                let mut merged = self.fetch_versions(&package, std::slice::from_ref(index)).await;
                (package, merged.remove(key).unwrap_or_default())
            })
            .buffer_unordered(CONSTRAINING_CONCURRENCY)
            .collect()
            .await
    }

    fn context_indices(&self, context: &str) -> Vec<Url> {
        let guard = self.state.lock();
        guard
            .contexts
            .get(context)
            .unwrap_or_else(|| guard.contexts.active())
            .indices()
            .to_vec()
    }
}

/// GET a listing page. `Ok(None)` is a 404; the URL returned is the final
/// one after redirects, which relative links resolve against.
async fn fetch_page(client: &Client, url: &Url) -> Result<Option<(Url, String)>> {
    debug!("GET {}", url);
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| FacadeError::upstream(url, e))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(FacadeError::upstream(url, format!("HTTP {}", status)));
    }

    let page_url = response.url().clone();
    let html = response
        .text()
        .await
        .map_err(|e| FacadeError::upstream(url, e))?;
    Ok(Some((page_url, html)))
}

/// Absolute link targets on a page, minus links back to the page itself
/// or any of its parent directories.
pub fn extract_links(page_url: &Url, html: &str) -> Vec<Url> {
    ANCHOR
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .filter_map(|href| page_url.join(&href.as_str().replace("&amp;", "&")).ok())
        .filter(|target| !is_backlink(page_url, target))
        .collect()
}

fn is_backlink(page_url: &Url, target: &Url) -> bool {
    page_url.scheme() == target.scheme()
        && page_url.host_str() == target.host_str()
        && page_url.port_or_known_default() == target.port_or_known_default()
        && is_same_or_parent_dir(page_url.path(), target.path())
}

/// `dir` names `page` itself or one of the directories above it
fn is_same_or_parent_dir(page: &str, dir: &str) -> bool {
    page == dir || (dir.ends_with('/') && page.starts_with(dir))
}

/// Last non-empty path segment, percent-decoded
fn last_segment(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|segment| !segment.is_empty()).last()?;
    match urlencoding::decode(segment) {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(e) => {
            debug!("Keeping undecodable segment {}: {}", segment, e);
            Some(segment.to_string())
        }
    }
}

fn merge_package_listing(state: &mut FacadeState, index: &Url, page_url: &Url, html: &str) {
    let status = state.index_status(index);
    let mut count = 0;
    for mut link in extract_links(page_url, html) {
        let Some(name) = last_segment(&link).map(|segment| normalize_name(&segment)) else {
            continue;
        };
        link.set_fragment(None);
        if !link.path().ends_with('/') {
            let path = format!("{}/", link.path());
            link.set_path(&path);
        }
        status
            .packages
            .entry(name)
            .and_modify(|known| known.url = link.clone())
            .or_insert(PackageStatus {
                versions_listed: false,
                url: link,
            });
        count += 1;
    }
    status.fully_listed = true;
    info!("Index {} lists {} packages", index, count);
}

fn merge_version_listing(
    state: &mut FacadeState,
    package: &str,
    page_url: &Url,
    html: &str,
) -> Vec<PackageVersion> {
    let mut versions = Vec::new();
    for mut link in extract_links(page_url, html) {
        let Some(filename) = last_segment(&link) else {
            continue;
        };
        let listed = match link.fragment() {
            Some(fragment) => format!("{}#{}", filename, fragment),
            None => filename,
        };
        link.set_fragment(None);

        match parse(&listed, Some(package)) {
            Ok(record) => {
                versions.push(record.version.clone());
                state.image.package_mut(package).insert_source(record, link);
            }
            Err(e) => debug!("Skipping {}: {}", link, e),
        }
    }
    debug!("Merged {} files for {} from {}", versions.len(), package, page_url);
    versions
}

fn mark_versions_listed(state: &mut FacadeState, index: &Url, package: &str, url: Url) {
    state
        .index_status(index)
        .packages
        .entry(package.to_string())
        .and_modify(|status| status.versions_listed = true)
        .or_insert(PackageStatus {
            versions_listed: true,
            url,
        });
}

/// Upstream body being relayed to the client and written to the cache
struct Tee {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    writer: Option<CacheWriter>,
    state: SharedState,
    done: bool,
}

impl Drop for Tee {
    fn drop(&mut self) {
        if !self.done {
            debug!("{}; abandoning partial download", FacadeError::ClientDisconnected);
        }
    }
}

fn tee(
    response: reqwest::Response,
    writer: Option<CacheWriter>,
    state: SharedState,
) -> BoxStream<'static, io::Result<Bytes>> {
    let tee = Tee {
        upstream: response.bytes_stream().boxed(),
        writer,
        state,
        done: false,
    };

    stream::unfold(tee, |mut tee| async move {
        if tee.done {
            return None;
        }
        match tee.upstream.next().await {
            Some(Ok(chunk)) => {
                if let Some(writer) = tee.writer.as_mut() {
                    if let Err(e) = writer.write(&chunk).await {
                        warn!("Cache write failed, continuing uncached: {}", e);
                        tee.writer = None;
                    }
                }
                Some((Ok(chunk), tee))
            }
            Some(Err(e)) => {
                tee.writer = None;
                tee.done = true;
                warn!("Upstream body failed mid-stream: {}", e);
                Some((Err(io::Error::new(io::ErrorKind::Other, e)), tee))
            }
            None => {
                tee.done = true;
                if let Some(writer) = tee.writer.take() {
                    if let Err(e) = writer.commit(&tee.state).await {
                        warn!("Failed to commit cache entry: {}", e);
                    }
                }
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(text: &str) -> Url {
        Url::parse(text).unwrap()
    }

    #[test]
    fn test_extract_links_drops_backlinks() {
        let page = url("https://mirror.example/simple/");
        let html = r#"
            <html><body>
            <a href="../">parent</a>
            <a href="./">self</a>
            <a href="/simple/">self absolute</a>
            <a href="pip/">pip</a>
            <a href='/simple/Six/'>Six</a>
            <A HREF=requests/>requests</A>
            </body></html>"#;
        let links: Vec<String> = extract_links(&page, html).iter().map(|u| u.to_string()).collect();
        assert_eq!(
            links,
            [
                "https://mirror.example/simple/pip/",
                "https://mirror.example/simple/Six/",
                "https://mirror.example/simple/requests/",
            ]
        );
    }

    #[test]
    fn test_extract_links_keeps_foreign_hosts_and_fragments() {
        let page = url("https://mirror.example/simple/pip/");
        let html = r#"<a href="https://files.example/packages/ab/pip-6.1.1.tar.gz#sha256=ff&amp;x=1">pip-6.1.1.tar.gz</a>"#;
        let links = extract_links(&page, html);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].host_str(), Some("files.example"));
        assert_eq!(links[0].fragment(), Some("sha256=ff&x=1"));
    }

    #[test]
    fn test_merge_version_listing() {
        use crate::context::{Context, ContextRegistry};
        let mut state = FacadeState::new(ContextRegistry::new(Context::new("default")));
        let page = url("https://mirror.example/simple/pip/");
        let html = r#"
            <a href="../../packages/pip-6.1.1.tar.gz#sha256=aa">pip-6.1.1.tar.gz</a>
            <a href="../../packages/pip-7.0.3-py2.py3-none-any.whl">wheel</a>
            <a href="../../packages/pip-7.0.3.exe">installer</a>"#;

        let versions = merge_version_listing(&mut state, "pip", &page, html);
        assert_eq!(versions.len(), 2);

        let files = state.image.package("pip").unwrap();
        let entry = files.file("pip-6.1.1.tar.gz").unwrap();
        assert_eq!(entry.record.fragment.as_deref(), Some("sha256=aa"));
        assert_eq!(entry.sources[0].as_str(), "https://mirror.example/packages/pip-6.1.1.tar.gz");
        assert!(files.file("pip-7.0.3.exe").is_none());
    }

    #[test]
    fn test_extract_links_keeps_sibling_prefixes() {
        let page = url("https://mirror.example/simple/pip/");
        let html = r#"<a href="/simple/pi">pi</a><a href="/simple/pip">self</a><a href="/simple/">up</a>"#;
        let links: Vec<String> = extract_links(&page, html).iter().map(|u| u.to_string()).collect();
        assert_eq!(links, ["https://mirror.example/simple/pi"]);
    }

    #[test]
    fn test_merge_version_listing_decodes_filenames() {
        use crate::context::{Context, ContextRegistry};
        let mut state = FacadeState::new(ContextRegistry::new(Context::new("default")));
        let page = url("https://mirror.example/simple/torch/");
        let html = r#"<a href="/whl/torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl#sha256=bb">torch</a>"#;

        let versions = merge_version_listing(&mut state, "torch", &page, html);
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_strict());
        assert_eq!(versions[0].to_string(), "2.0.0+cpu");

        let files = state.image.package("torch").unwrap();
        let entry = files.file("torch-2.0.0+cpu-cp311-cp311-linux_x86_64.whl").unwrap();
        assert_eq!(
            entry.sources[0].as_str(),
            "https://mirror.example/whl/torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl"
        );

        let mut constrained = Context::new("constrained");
        constrained.apply_update(&[], "torch>=2", &[]).unwrap();
        assert_eq!(constrained.filter_versions("torch", files.versions()).len(), 1);
    }

    #[test]
    fn test_merge_package_listing_normalizes_names() {
        use crate::context::{Context, ContextRegistry};
        let mut state = FacadeState::new(ContextRegistry::new(Context::new("default")));
        let index = url("https://mirror.example/simple/");
        let html = r#"<a href="Foo_Bar">Foo_Bar</a><a href="../">up</a>"#;

        merge_package_listing(&mut state, &index, &index, html);

        let status = state.status.get(index.as_str()).unwrap();
        assert!(status.fully_listed);
        assert_eq!(status.packages.len(), 1);
        assert_eq!(
            status.packages["foo-bar"].url.as_str(),
            "https://mirror.example/simple/Foo_Bar/"
        );
    }
}

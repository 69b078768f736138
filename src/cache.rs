//! On-disk package cache
//!
//! Files live at `<root>/<normalized package>/<filename>`. Writes go to a
//! hidden temp file in the same directory and are renamed into place only
//! after the whole body arrived, so a partial download never becomes the
//! authoritative copy. The directory doubles as a cold-start seed.

use crate::error::Result;
use crate::filename::{normalize_name, parse, ParsedRecord};
use crate::image::SharedState;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;

/// An opened cache entry ready to be streamed
pub struct CachedFile {
    pub path: PathBuf,
    pub len: u64,
    file: File,
}

impl CachedFile {
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        stream::unfold(Some(self.file), |file| async move {
            let mut file = file?;
            let mut buf = vec![0u8; READ_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(file)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

/// Package cache rooted at one directory
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, package: &str, filename: &str) -> PathBuf {
        self.root.join(normalize_name(package)).join(filename)
    }

    /// Parse every file already under the cache root
    pub fn scan(&self) -> Result<Vec<(ParsedRecord, PathBuf)>> {
        let mut found = Vec::new();
        for package_dir in fs::read_dir(&self.root)? {
            let package_dir = package_dir?;
            if !package_dir.file_type()?.is_dir() {
                continue;
            }
            let package = package_dir.file_name().to_string_lossy().to_string();

            for file in fs::read_dir(package_dir.path())? {
                let file = file?;
                let filename = file.file_name().to_string_lossy().to_string();
                if filename.starts_with('.') || !file.file_type()?.is_file() {
                    continue;
                }
                match parse(&filename, Some(&package)) {
                    Ok(record) => found.push((record, file.path())),
                    Err(e) => warn!("Skipping cached file {}: {}", file.path().display(), e),
                }
            }
        }
        Ok(found)
    }

    /// Pre-populate the image with everything already on disk
    pub fn seed(&self, state: &SharedState) -> Result<usize> {
        let found = self.scan()?;
        let count = found.len();

        let mut guard = state.lock();
        for (record, path) in found {
            let package = normalize_name(&record.package);
            guard.image.package_mut(&package).insert_cached(record, path);
        }
        drop(guard);

        info!("Seeded {} files from cache at {}", count, self.root.display());
        Ok(count)
    }

    /// Open the cached copy of a file.
    ///
    /// Any failure is a miss; the image forgets the cached path so the next
    /// request fetches the file again.
    pub async fn read(&self, state: &SharedState, package: &str, filename: &str) -> Option<CachedFile> {
        let path = state
            .lock()
            .image
            .package(package)
            .and_then(|files| files.file(filename))
            .and_then(|entry| entry.cached_path.clone())?;

        match open_cached(&path).await {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!("Cache read of {} failed, treating as miss: {}", path.display(), e);
                let mut guard = state.lock();
                if let Some(entry) = guard
                    .image
                    .existing_package_mut(package)
                    .and_then(|files| files.file_mut(filename))
                {
                    entry.cached_path = None;
                }
                None
            }
        }
    }

    /// Start writing a file into the cache
    pub async fn writer(&self, package: &str, filename: &str) -> io::Result<CacheWriter> {
        let dest = self.path_for(package, filename);
        let dir = dest.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let temp = dir.join(format!(".{}.{:08x}.part", filename, rand::random::<u32>()));
        let file = File::create(&temp).await?;
        Ok(CacheWriter {
            file: Some(file),
            temp,
            dest,
            package: package.to_string(),
            filename: filename.to_string(),
            committed: false,
        })
    }

    /// Write a whole stream into the cache and record it in the image
    pub async fn write<S>(
        &self,
        state: &SharedState,
        package: &str,
        filename: &str,
        body: S,
    ) -> io::Result<PathBuf>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut writer = self.writer(package, filename).await?;
        let mut body = std::pin::pin!(body);
        while let Some(chunk) = body.next().await {
            writer.write(&chunk?).await?;
        }
        writer.commit(state).await
    }
}

async fn open_cached(path: &Path) -> io::Result<CachedFile> {
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok(CachedFile {
        path: path.to_path_buf(),
        len,
        file,
    })
}

/// A cache file being written; removed on drop unless committed
pub struct CacheWriter {
    file: Option<File>,
    temp: PathBuf,
    dest: PathBuf,
    package: String,
    filename: String,
    committed: bool,
}

impl CacheWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "cache writer already closed")),
        }
    }

    /// Move the finished file into place and record it as cached
    pub async fn commit(mut self, state: &SharedState) -> io::Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&self.temp, &self.dest).await?;
        self.committed = true;

        let mut guard = state.lock();
        if let Some(entry) = guard
            .image
            .existing_package_mut(&self.package)
            .and_then(|files| files.file_mut(&self.filename))
        {
            entry.cached_path = Some(self.dest.clone());
        }
        drop(guard);

        debug!("Cached {}", self.dest.display());
        Ok(self.dest.clone())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            if let Err(e) = fs::remove_file(&self.temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial cache file {}: {}", self.temp.display(), e);
                }
            }
        }
    }
}

//! Durable cache store on the local file system.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<hash(name)>/cache.toml           name and creation time
//! <root>/<hash(name)>/entries/<hash(key)>.json   entry metadata
//! <root>/<hash(name)>/entries/<hash(key)>.body   entry payload
//! ```
//!
//! Every file is written to a temporary path and renamed into place, so a
//! reader sees either the previous or the new version. An entry exists once
//! its `.json` file exists; the payload is always written first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Cache, CacheStorage, EntryInfo, ensure_cacheable};
use crate::error::{Error, Result};
use crate::request::{Request, Response};

const CACHE_META: &str = "cache.toml";
const ENTRIES_DIR: &str = "entries";

/// Cache store persisted under a root directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
}

/// Handle to one on-disk cache.
#[derive(Debug, Clone)]
pub struct DiskCache {
    name: String,
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    name: String,
    created: DateTime<Utc>,
}

/// An encoded entry ready to be written.
struct PreparedEntry {
    meta_path: PathBuf,
    body_path: PathBuf,
    meta: Vec<u8>,
    body: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    request_url: String,
    status: u16,
    response_url: String,
    headers: Vec<(String, String)>,
    size: u64,
    stored_at: DateTime<Utc>,
}

fn hash_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Storage(format!("corrupt URL {raw}: {e}")))
}

/// Writes `contents` next to `path` and renames it into place.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Reads a file, mapping "not found" to `None`.
async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl DiskCacheStorage {
    /// Creates a store rooted at `root`. Nothing is touched until first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        self.root.join(&hash_hex(name)[..32])
    }

    async fn read_meta(dir: &Path) -> Result<Option<CacheMeta>> {
        let Some(raw) = read_optional(&dir.join(CACHE_META)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(raw)
            .map_err(|e| Error::Storage(format!("corrupt {}: {e}", dir.display())))?;
        Ok(Some(toml::from_str(&text)?))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    type Cache = DiskCache;

    async fn open(&self, name: &str) -> Result<DiskCache> {
        let dir = self.cache_dir(name);
        tokio::fs::create_dir_all(dir.join(ENTRIES_DIR)).await?;

        if Self::read_meta(&dir).await?.is_none() {
            let meta = CacheMeta {
                name: name.to_string(),
                created: Utc::now(),
            };
            let toml_str = toml::to_string(&meta)
                .map_err(|e| Error::Storage(format!("cannot encode cache metadata: {e}")))?;
            write_atomic(&dir.join(CACHE_META), toml_str.as_bytes()).await?;
            log::debug!("Created cache {name} at {}", dir.display());
        }

        Ok(DiskCache {
            name: name.to_string(),
            dir,
        })
    }

    async fn open_existing(&self, name: &str) -> Result<Option<DiskCache>> {
        let dir = self.cache_dir(name);
        Ok(Self::read_meta(&dir).await?.map(|_| DiskCache {
            name: name.to_string(),
            dir,
        }))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let is_trash = entry.file_name().to_string_lossy().starts_with('.');
            if is_trash || !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(meta) = Self::read_meta(&entry.path()).await? {
                metas.push(meta);
            }
        }

        metas.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        Ok(metas.into_iter().map(|m| m.name).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.cache_dir(name);
        // Move aside first so listings never see a half-removed cache.
        let trash = self
            .root
            .join(format!(".trash-{}", uuid::Uuid::new_v4().simple()));
        match tokio::fs::rename(&dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        tokio::fs::remove_dir_all(&trash).await?;
        Ok(true)
    }
}

impl DiskCache {
    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let base = self.dir.join(ENTRIES_DIR).join(hash_hex(key));
        (base.with_extension("json"), base.with_extension("body"))
    }

    /// Encodes one entry without touching the disk.
    fn prepare(&self, request: &Request, response: &Response) -> Result<PreparedEntry> {
        ensure_cacheable(request)?;
        let key = request.cache_key();
        let (meta_path, body_path) = self.entry_paths(&key);
        let meta = EntryMeta {
            key,
            request_url: request.url.to_string(),
            status: response.status,
            response_url: response.url.to_string(),
            headers: response.headers.clone(),
            size: response.len(),
            stored_at: Utc::now(),
        };
        Ok(PreparedEntry {
            meta_path,
            body_path,
            meta: serde_json::to_vec(&meta)?,
            body: response.body.clone(),
        })
    }

    async fn write(entry: &PreparedEntry) -> Result<()> {
        write_atomic(&entry.body_path, &entry.body).await?;
        write_atomic(&entry.meta_path, &entry.meta).await?;
        Ok(())
    }

    async fn read_entry_meta(path: &Path) -> Result<Option<EntryMeta>> {
        Ok(match read_optional(path).await? {
            Some(raw) => Some(serde_json::from_slice(&raw)?),
            None => None,
        })
    }
}

#[async_trait]
impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        if !request.is_cacheable() {
            return Ok(None);
        }
        let key = request.cache_key();
        let (meta_path, body_path) = self.entry_paths(&key);

        let Some(meta) = Self::read_entry_meta(&meta_path).await? else {
            return Ok(None);
        };
        if meta.key != key {
            return Err(Error::Storage(format!("key collision on {key}")));
        }
        let body = tokio::fs::read(&body_path).await?;
        if body.len() as u64 != meta.size {
            return Err(Error::Storage(format!(
                "truncated payload for {key}: {} of {} bytes",
                body.len(),
                meta.size
            )));
        }

        Ok(Some(Response {
            status: meta.status,
            url: parse_url(&meta.response_url)?,
            headers: meta.headers,
            body: Bytes::from(body),
        }))
    }

    async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        Self::write(&self.prepare(request, response)?).await
    }

    async fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
        let prepared = entries
            .iter()
            .map(|(request, response)| self.prepare(request, response))
            .collect::<Result<Vec<_>>>()?;
        for entry in &prepared {
            Self::write(entry).await?;
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>> {
        let mut read_dir = tokio::fs::read_dir(self.dir.join(ENTRIES_DIR)).await?;
        let mut out = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(meta) = Self::read_entry_meta(&path).await? {
                out.push(EntryInfo {
                    url: parse_url(&meta.request_url)?,
                    status: meta.status,
                    size: meta.size,
                    stored_at: meta.stored_at,
                });
            }
        }
        out.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
        Ok(out)
    }
}

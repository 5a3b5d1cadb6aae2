//! Model weight resolution with a local cache and an at-most-once remote fetch.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::WeightsConfig;

/// Files smaller than this are treated as truncated downloads.
const MIN_ARTIFACT_BYTES: u64 = 1024;

/// One lock per destination path, shared by every store in the process.
static FETCH_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("model weights not found at {path}")]
    Missing { path: PathBuf },

    #[error("model weights not found at {path} and no remote model store is configured")]
    NoRemote { path: PathBuf },

    #[error("invalid artifact name {0:?}")]
    InvalidName(String),

    #[error("fetch from {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("fetch from {url} returned HTTP {status}")]
    Http { url: String, status: u16 },

    #[error("artifact too large: {size} bytes, max {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("downloaded artifact too small ({size} bytes), likely truncated")]
    Truncated { size: u64 },

    #[error("checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch lock poisoned")]
    LockPoisoned,
}

/// A weight file, keyed in the remote store by repository id and filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub repo_id: String,
    pub filename: String,
    /// Explicit local file that bypasses the cache.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Lowercase hex SHA-256 checked after download.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelArtifact {
    pub fn new(repo_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            filename: filename.into(),
            local_path: None,
            sha256: None,
        }
    }

    #[must_use]
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    fn validate(&self) -> Result<(), WeightsError> {
        let bad_segment = |s: &str| s.is_empty() || s == "." || s == ".." || s.contains('\\');
        if self.repo_id.split('/').any(bad_segment) {
            return Err(WeightsError::InvalidName(self.repo_id.clone()));
        }
        if bad_segment(&self.filename) || self.filename.contains('/') {
            return Err(WeightsError::InvalidName(self.filename.clone()));
        }
        Ok(())
    }
}

/// Streams one artifact from a remote model store.
pub trait ArtifactFetcher: Send + Sync {
    /// Writes the artifact body into `dest` and returns the byte count.
    fn fetch(&self, artifact: &ModelArtifact, dest: &mut dyn Write) -> Result<u64, WeightsError>;
}

/// Resolves model weights to local files, fetching each at most once.
pub struct WeightStore {
    cache_dir: PathBuf,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    max_bytes: u64,
}

impl WeightStore {
    pub fn new(cache_dir: impl Into<PathBuf>, fetcher: Option<Arc<dyn ArtifactFetcher>>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetcher,
            max_bytes: u64::MAX,
        }
    }

    /// Builds a store with the HTTP fetcher when an endpoint is configured.
    pub fn from_config(config: &WeightsConfig) -> Result<Self, WeightsError> {
        let fetcher: Option<Arc<dyn ArtifactFetcher>> = match &config.endpoint {
            #[cfg(feature = "fetch")]
            Some(endpoint) => Some(Arc::new(HttpFetcher::new(endpoint, config)?)),
            #[cfg(not(feature = "fetch"))]
            Some(endpoint) => {
                tracing::warn!(%endpoint, "remote fetching disabled at build time");
                None
            }
            None => None,
        };

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            fetcher,
            max_bytes: config.max_download_bytes,
        })
    }

    pub fn cache_path(&self, artifact: &ModelArtifact) -> PathBuf {
        let mut path = self.cache_dir.clone();
        path.extend(artifact.repo_id.split('/'));
        path.push(&artifact.filename);
        path
    }

    /// Returns a local path holding the artifact.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit local path is missing, or the cached file
    /// is absent and cannot be fetched.
    #[instrument(skip(self), fields(repo = %artifact.repo_id, file = %artifact.filename))]
    pub fn resolve(&self, artifact: &ModelArtifact) -> Result<PathBuf, WeightsError> {
        if let Some(path) = &artifact.local_path {
            if path.is_file() {
                debug!(path = %path.display(), "using explicit weights");
                return Ok(path.clone());
            }
            return Err(WeightsError::Missing { path: path.clone() });
        }

        artifact.validate()?;
        let dest = self.cache_path(artifact);
        if dest.is_file() {
            debug!(path = %dest.display(), "weights cached, skipping download");
            return Ok(dest);
        }

        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| WeightsError::NoRemote { path: dest.clone() })?;

        let lock = path_lock(&dest)?;
        let _guard = lock.lock().map_err(|_| WeightsError::LockPoisoned)?;

        // Another caller may have finished while we waited.
        if dest.is_file() {
            debug!(path = %dest.display(), "weights fetched by concurrent caller");
            return Ok(dest);
        }

        self.fetch_into(fetcher.as_ref(), artifact, &dest)?;
        Ok(dest)
    }

    fn fetch_into(
        &self,
        fetcher: &dyn ArtifactFetcher,
        artifact: &ModelArtifact,
        dest: &Path,
    ) -> Result<(), WeightsError> {
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|source| WeightsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        info!(dest = %dest.display(), "fetching model weights");

        // Partial downloads never appear under the final name.
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|source| WeightsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut hashing = HashingWriter::new(temp.as_file_mut(), self.max_bytes);
        let fetched = fetcher.fetch(artifact, &mut hashing);
        let (size, digest) = hashing.finish()?;
        fetched?;

        if size < MIN_ARTIFACT_BYTES {
            return Err(WeightsError::Truncated { size });
        }

        if let Some(expected) = &artifact.sha256 {
            let actual = hex::encode(digest);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(WeightsError::ChecksumMismatch {
                    filename: artifact.filename.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("checksum verified");
        }

        temp.as_file().sync_all().map_err(|source| WeightsError::Io {
            path: temp.path().to_path_buf(),
            source,
        })?;
        temp.persist(dest).map_err(|e| WeightsError::Io {
            path: dest.to_path_buf(),
            source: e.error,
        })?;

        info!(dest = %dest.display(), size, "model weights saved");
        Ok(())
    }
}

fn path_lock(path: &Path) -> Result<Arc<Mutex<()>>, WeightsError> {
    let mut locks = FETCH_LOCKS.lock().map_err(|_| WeightsError::LockPoisoned)?;
    Ok(locks.entry(path.to_path_buf()).or_default().clone())
}

/// Counts, hashes and caps bytes on their way to disk.
struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Sha256,
    written: u64,
    max: u64,
}

impl<'a, W: Write> HashingWriter<'a, W> {
    fn new(inner: &'a mut W, max: u64) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
            max,
        }
    }

    fn finish(self) -> Result<(u64, Vec<u8>), WeightsError> {
        if self.written > self.max {
            return Err(WeightsError::TooLarge {
                size: self.written,
                max: self.max,
            });
        }
        Ok((self.written, self.hasher.finalize().to_vec()))
    }
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let next = self.written.saturating_add(buf.len() as u64);
        if next > self.max {
            self.written = next;
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("artifact exceeds {} bytes", self.max),
            ));
        }
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Fetches `<endpoint>/<repo_id>/resolve/main/<filename>` over HTTPS.
#[cfg(feature = "fetch")]
pub struct HttpFetcher {
    endpoint: String,
    client: reqwest::blocking::Client,
    max_bytes: u64,
}

#[cfg(feature = "fetch")]
impl HttpFetcher {
    pub fn new(endpoint: &str, config: &WeightsConfig) -> Result<Self, WeightsError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !endpoint.starts_with("https://") {
            return Err(WeightsError::Fetch {
                url: endpoint,
                reason: "only HTTPS endpoints are allowed".into(),
            });
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| WeightsError::Fetch {
                url: endpoint.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            endpoint,
            client,
            max_bytes: config.max_download_bytes,
        })
    }

    pub fn url_for(&self, artifact: &ModelArtifact) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.endpoint, artifact.repo_id, artifact.filename
        )
    }
}

#[cfg(feature = "fetch")]
impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, artifact: &ModelArtifact, dest: &mut dyn Write) -> Result<u64, WeightsError> {
        use std::io::Read;

        let url = self.url_for(artifact);
        let fetch_err = |reason: String| WeightsError::Fetch {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| fetch_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeightsError::Http {
                url,
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(WeightsError::TooLarge {
                    size: len,
                    max: self.max_bytes,
                });
            }
        }

        let mut body = response.take(self.max_bytes.saturating_add(1));
        std::io::copy(&mut body, dest).map_err(|e| fetch_err(e.to_string()))
    }
}

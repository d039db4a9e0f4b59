//! Artifact fetching with integrity verification.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tracing::{debug, info};

use crate::blob::BlobCache;
use kw_core::{Error, SourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A single file, usually an archive
    Blob,
    /// A verified copy of a directory
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub kind: ArtifactKind,
    /// Served from the cache without touching the source
    pub reused: bool,
}

pub struct Fetcher {
    client: reqwest::Client,
    cache: BlobCache,
}

impl Fetcher {
    pub fn new(cache: BlobCache) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("kegwright/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(cache, client)
    }

    pub fn with_client(cache: BlobCache, client: reqwest::Client) -> Self {
        Self { client, cache }
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    /// Produce a local copy of `source` whose digest equals `sha256`.
    ///
    /// Nothing outside the cache's temp area is written unless the digest
    /// matches.
    pub async fn fetch(&self, source: &SourceRef, sha256: &str) -> Result<FetchedArtifact, Error> {
        let sha256 = sha256.to_ascii_lowercase();

        if self.cache.has_blob(&sha256) {
            debug!(sha256, "artifact already cached");
            return Ok(self.artifact(&sha256, ArtifactKind::Blob, true));
        }
        if self.cache.has_tree(&sha256) {
            debug!(sha256, "directory artifact already cached");
            return Ok(self.artifact(&sha256, ArtifactKind::Tree, true));
        }

        let kind = match source.local_path() {
            Some(path) => self.fetch_local(path, &sha256, source).await?,
            None => {
                self.fetch_remote(source, &sha256).await?;
                ArtifactKind::Blob
            }
        };

        info!(source = %source.display_name(), sha256, "fetched artifact");
        Ok(self.artifact(&sha256, kind, false))
    }

    fn artifact(&self, sha256: &str, kind: ArtifactKind, reused: bool) -> FetchedArtifact {
        let path = match kind {
            ArtifactKind::Blob => self.cache.blob_path(sha256),
            ArtifactKind::Tree => self.cache.tree_path(sha256),
        };
        FetchedArtifact {
            path,
            sha256: sha256.to_string(),
            kind,
            reused,
        }
    }

    async fn fetch_local(
        &self,
        path: PathBuf,
        sha256: &str,
        source: &SourceRef,
    ) -> Result<ArtifactKind, Error> {
        let location = source.display_name();
        let meta = fs::metadata(&path).map_err(|e| Error::Fetch {
            location: location.clone(),
            message: e.to_string(),
        })?;

        let cache = self.cache.clone();
        let sha = sha256.to_string();
        let file_name = source.file_name();
        let is_dir = meta.is_dir();

        tokio::task::spawn_blocking(move || {
            if is_dir {
                cache.store_tree(&sha, &path).map(|_| ArtifactKind::Tree)
            } else {
                copy_file_into(&cache, &sha, &path, file_name).map(|_| ArtifactKind::Blob)
            }
        })
        .await
        .map_err(|e| Error::Fetch {
            location,
            message: format!("copy task failed: {e}"),
        })?
    }

    async fn fetch_remote(&self, source: &SourceRef, sha256: &str) -> Result<PathBuf, Error> {
        let SourceRef::Url(url) = source else {
            return Err(Error::Fetch {
                location: source.display_name(),
                message: "not a remote source".to_string(),
            });
        };
        let fetch_err = |message: String| Error::Fetch {
            location: url.clone(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }

        let mut writer = self
            .cache
            .start_write(sha256)
            .map_err(|e| fetch_err(format!("failed to create temp file: {e}")))?;

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_err(format!("failed to read body: {e}")))?;
            writer
                .write_all(&chunk)
                .map_err(|e| fetch_err(format!("failed to write chunk: {e}")))?;
            downloaded += chunk.len() as u64;
        }
        debug!(url = %url, bytes = downloaded, "download complete");

        writer.commit(source.file_name())
    }
}

fn copy_file_into(
    cache: &BlobCache,
    sha256: &str,
    path: &Path,
    file_name: Option<String>,
) -> Result<PathBuf, Error> {
    let fetch_err = |message: String| Error::Fetch {
        location: path.display().to_string(),
        message,
    };

    let mut file = File::open(path).map_err(|e| fetch_err(e.to_string()))?;
    let mut writer = cache
        .start_write(sha256)
        .map_err(|e| fetch_err(format!("failed to create temp file: {e}")))?;
    io::copy(&mut file, &mut writer).map_err(|e| fetch_err(format!("failed to copy: {e}")))?;
    writer.commit(file_name)
}

//! HTTP client for the object channel.

use std::path::{Path, PathBuf};

use reqwest::RequestBuilder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use l4d2_bridge_transfer::TransferError;

use crate::error::DataChannelError;
use crate::store::FileMeta;
use crate::{HEADER_FILE_SHA256, HTTP_CONNECT_TIMEOUT};

/// A file written to disk by [`ObjectClient::download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Deserialize)]
struct ListResponse {
    files: Vec<FileMeta>,
}

/// Talks to the object channel routes of a hub.
#[derive(Debug, Clone)]
pub struct ObjectClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ObjectClient {
    /// `base_url` is the mount point, e.g. `http://hub:8766/v1/files`.
    pub fn new(base_url: &str, token: &str) -> Result<Self, DataChannelError> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, base_url, token))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str, token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves a relative URL from a notice against the base origin.
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        let origin_end = self
            .base_url
            .find("://")
            .and_then(|scheme| {
                self.base_url[scheme + 3..]
                    .find('/')
                    .map(|slash| scheme + 3 + slash)
            })
            .unwrap_or(self.base_url.len());
        format!("{}{}", &self.base_url[..origin_end], url)
    }

    /// Streams a local file to the hub and returns its registry entry.
    pub async fn upload(&self, path: &Path, file_name: &str) -> Result<FileMeta, DataChannelError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        debug!(file = %file_name, size, "uploading to object channel");
        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .query(&[("file_name", file_name)])
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        let response = check_status(response).await?;
        let meta: FileMeta = response.json().await?;
        info!(file_id = %meta.file_id, file = %meta.file_name, size = meta.size, "uploaded");
        Ok(meta)
    }

    /// Downloads a registered file by id into `dest`.
    pub async fn download(
        &self,
        file_id: &str,
        dest: &Path,
    ) -> Result<DownloadedFile, DataChannelError> {
        let request = self
            .http
            .get(format!("{}/download", self.base_url))
            .query(&[("file_id", file_id)]);
        self.fetch(request, dest).await
    }

    /// Downloads from an absolute or base-relative URL into `dest`.
    pub async fn fetch_url(&self, url: &str, dest: &Path) -> Result<DownloadedFile, DataChannelError> {
        let request = self.http.get(self.resolve(url));
        self.fetch(request, dest).await
    }

    pub async fn list(&self) -> Result<Vec<FileMeta>, DataChannelError> {
        let response = self
            .http
            .get(format!("{}/list", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = check_status(response).await?;
        let list: ListResponse = response.json().await?;
        Ok(list.files)
    }

    async fn fetch(
        &self,
        request: RequestBuilder,
        dest: &Path,
    ) -> Result<DownloadedFile, DataChannelError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let mut response = check_status(response).await?;
        let expected = response
            .headers()
            .get(HEADER_FILE_SHA256)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            size += chunk.len() as u64;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);

        let sha256 = hex::encode(hasher.finalize());
        if let Some(expected) = expected {
            if expected != sha256 {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(TransferError::ChecksumMismatch {
                    expected,
                    actual: sha256,
                }
                .into());
            }
        }
        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            size,
            sha256,
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DataChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(DataChannelError::Status {
        status: status.as_u16(),
        message,
    })
}

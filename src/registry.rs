//! Model acquisition from a ModelScope-compatible hub
//!
//! Lists every file of a model revision and downloads it into
//! `<cache_dir>/<model_id>/`. Each file is streamed into a `.tmp` sibling and
//! renamed when complete, so an interrupted pull never leaves a truncated
//! file under its final name. Files already present with the listed size are
//! skipped.

use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{GatewayError, Result};

/// Public ModelScope hub
pub const DEFAULT_ENDPOINT: &str = "https://www.modelscope.cn";

/// Environment variable holding the access token
pub const TOKEN_ENV: &str = "MODELSCOPE_API_TOKEN";

/// Registry connection and target settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Hub base URL
    pub endpoint: String,
    /// Access token sent as a bearer credential
    pub token: Option<String>,
    /// Root of the local model cache
    pub cache_dir: PathBuf,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            cache_dir: PathBuf::from("./local-model"),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl RegistryConfig {
    /// Set the hub endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the access token
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Set the local cache root
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }
}

/// One file of a model repository
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoFile {
    /// Path relative to the repository root
    #[serde(rename = "Path")]
    pub path: String,
    /// `blob` for files, `tree` for directories
    #[serde(rename = "Type", default)]
    pub kind: String,
    /// Size in bytes
    #[serde(rename = "Size", default)]
    pub size: u64,
}

impl RepoFile {
    fn is_blob(&self) -> bool {
        self.kind.is_empty() || self.kind == "blob"
    }
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(rename = "Code", default)]
    code: Option<i64>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Data")]
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(rename = "Files", default)]
    files: Vec<RepoFile>,
}

/// Totals of a pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Files fetched
    pub downloaded: usize,
    /// Files already present
    pub skipped: usize,
    /// Bytes fetched
    pub bytes: u64,
    /// Local model directory
    pub model_dir: PathBuf,
}

/// Client for one hub
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl ModelRegistry {
    /// Create a registry client
    ///
    /// # Errors
    ///
    /// `ConnectionError` if the HTTP client cannot be built
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("infergate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Local directory a model is stored in
    ///
    /// # Errors
    ///
    /// `RegistryError` when `model_id` is absolute or climbs out of the cache
    pub fn model_dir(&self, model_id: &str) -> Result<PathBuf> {
        let relative = contained_path(model_id).ok_or_else(|| {
            GatewayError::RegistryError(format!("Unsafe model id: {model_id}"))
        })?;
        Ok(self.config.cache_dir.join(relative))
    }

    fn base(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List every file of `model_id` at `revision`
    ///
    /// # Errors
    ///
    /// `ConnectionError` on transport failure, `ModelNotFound` on 404,
    /// `RegistryError` for other failures or an unexpected body
    pub async fn list_files(&self, model_id: &str, revision: &str) -> Result<Vec<RepoFile>> {
        let url = format!("{}/api/v1/models/{model_id}/repo/files", self.base());
        let response = self
            .authorized(self.client.get(&url))
            .query(&[("Revision", revision), ("Recursive", "true")])
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::ModelNotFound(format!("{model_id}@{revision}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::RegistryError(format!(
                "HTTP {status} listing {model_id}: {body}"
            )));
        }

        let envelope: ListEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::RegistryError(format!("Invalid file listing: {e}")))?;
        parse_listing(envelope, model_id)
    }

    /// Download one file to `dest`, skipping it when the size already matches
    ///
    /// Returns the number of bytes fetched (0 when skipped).
    ///
    /// # Errors
    ///
    /// Transport, HTTP status or filesystem failures
    pub async fn download_file(
        &self,
        model_id: &str,
        revision: &str,
        file: &RepoFile,
        dest: &Path,
    ) -> Result<Option<u64>> {
        if let Ok(meta) = fs::metadata(dest).await {
            if meta.is_file() && meta.len() == file.size {
                tracing::debug!(path = %file.path, "Already present, skipping");
                return Ok(None);
            }
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_err(parent, &e))?;
        }

        let url = format!("{}/api/v1/models/{model_id}/repo", self.base());
        let mut response = self
            .authorized(self.client.get(&url))
            .query(&[("Revision", revision), ("FilePath", file.path.as_str())])
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::RegistryError(format!(
                "HTTP {} downloading {}",
                response.status(),
                file.path
            )));
        }

        let tmp = tmp_path(dest);
        let written = match stream_to_file(&mut response, &tmp).await {
            Ok(written) => written,
            Err(e) => {
                discard(&tmp).await;
                return Err(e);
            },
        };

        if file.size > 0 && written != file.size {
            discard(&tmp).await;
            return Err(GatewayError::RegistryError(format!(
                "Size mismatch for {}: expected {} bytes, received {written}",
                file.path, file.size
            )));
        }
        if let Err(e) = fs::rename(&tmp, dest).await {
            discard(&tmp).await;
            return Err(io_err(dest, &e));
        }
        Ok(Some(written))
    }

    /// Download every file of `model_id` at `revision`
    ///
    /// # Errors
    ///
    /// The first listing, download or filesystem failure
    pub async fn pull(&self, model_id: &str, revision: &str) -> Result<PullSummary> {
        let model_dir = self.model_dir(model_id)?;
        let files = self.list_files(model_id, revision).await?;
        tracing::info!(model = model_id, revision, files = files.len(), "Pulling model");

        let mut summary = PullSummary {
            model_dir: model_dir.clone(),
            ..PullSummary::default()
        };
        for file in &files {
            let dest = model_dir.join(safe_relative_path(&file.path)?);
            match self.download_file(model_id, revision, file, &dest).await? {
                Some(bytes) => {
                    tracing::info!(path = %file.path, bytes, "Downloaded");
                    summary.downloaded += 1;
                    summary.bytes += bytes;
                },
                None => summary.skipped += 1,
            }
        }
        Ok(summary)
    }
}

fn parse_listing(envelope: ListEnvelope, model_id: &str) -> Result<Vec<RepoFile>> {
    if let Some(code) = envelope.code {
        if code != 200 && code != 0 {
            return Err(GatewayError::RegistryError(format!(
                "Hub returned code {code} for {model_id}: {}",
                envelope.message.unwrap_or_default()
            )));
        }
    }
    let data = envelope.data.ok_or_else(|| {
        GatewayError::RegistryError(format!("File listing for {model_id} has no data"))
    })?;
    Ok(data.files.into_iter().filter(RepoFile::is_blob).collect())
}

/// Repository path as a relative local path; rejects escapes from the model dir
///
/// # Errors
///
/// `RegistryError` for absolute paths, `..` components or empty paths
pub fn safe_relative_path(repo_path: &str) -> Result<PathBuf> {
    if repo_path.trim_start_matches('/').is_empty() {
        return Err(GatewayError::RegistryError(
            "Empty file path in listing".to_string(),
        ));
    }
    contained_path(repo_path.trim_start_matches('/')).ok_or_else(|| {
        GatewayError::RegistryError(format!("Unsafe file path in listing: {repo_path}"))
    })
}

/// Plain components only; `None` for `..`, roots, prefixes or an empty path
fn contained_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {},
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

async fn stream_to_file(response: &mut reqwest::Response, tmp: &Path) -> Result<u64> {
    let mut out = fs::File::create(tmp).await.map_err(|e| io_err(tmp, &e))?;
    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| GatewayError::ConnectionError(format!("Download error: {e}")))?
    {
        out.write_all(&chunk).await.map_err(|e| io_err(tmp, &e))?;
        written += chunk.len() as u64;
    }
    out.flush().await.map_err(|e| io_err(tmp, &e))?;
    Ok(written)
}

/// Remove a partial download
async fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %tmp.display(), error = %e, "Failed to remove partial download");
        }
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

fn io_err(path: &Path, e: &std::io::Error) -> GatewayError {
    GatewayError::IoError {
        message: format!("{}: {e}", path.display()),
    }
}

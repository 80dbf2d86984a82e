//! Update client: report local fingerprints, download and apply changes

use crate::protocol::{base_url, encode_request, REQUEST_FIELD};
use bytes::Bytes;
use filetime::FileTime;
use flate2::read::GzDecoder;
use reqwest::header::CONTENT_ENCODING;
use reqwest::{StatusCode, Url};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use treesync_config::{ClientConfig, ConfigLoader, CLIENT_STATE_FILE};
use treesync_sync::{
    apply_patch, clean_temp_files, file_time, hash_bytes, replace_file, safe_relative_path,
    FingerprintIndex, HideFile, IgnoreSet, PlatformHide,
};
use treesync_types::{
    ApplyFailure, DiffEntry, Error, Result, TransferMode, UpdateRequest, UpdateResponse,
};

/// Number of files downloaded at once in per-file mode
pub const DOWNLOAD_CONCURRENCY: usize = 8;

/// Result of one client run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The local tree already matches the server
    UpToDate,
    /// Changes exist but were not applied (check-only runs)
    Available {
        /// Number of changed files
        files: usize,
        /// Total size of the changed files in bytes
        bytes: u64,
    },
    /// Changes were downloaded and applied
    Updated {
        /// Number of files written
        files: usize,
    },
}

/// Client side of the update protocol for one directory
pub struct UpdateClient {
    config: ClientConfig,
    ignore: IgnoreSet,
    http: reqwest::Client,
    base: Url,
    hide: Arc<dyn HideFile>,
}

impl std::fmt::Debug for UpdateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateClient")
            .field("config", &self.config)
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl UpdateClient {
    /// Create a client for a validated configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let ignore = IgnoreSet::new(config.effective_ignore())?;
        let base = Url::parse(&base_url(&config.host))
            .map_err(|e| Error::config(format!("invalid host '{}': {}", config.host, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::config(format!("invalid host '{}'", config.host)));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::network(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            ignore,
            http,
            base,
            hide: Arc::new(PlatformHide::default()),
        })
    }

    /// Use another hidden-file implementation
    pub fn with_hide(mut self, hide: Arc<dyn HideFile>) -> Self {
        self.hide = hide;
        self
    }

    /// Configuration of this client
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ask the server which files differ from the local tree
    pub async fn check(&self) -> Result<UpdateResponse> {
        let dir = self.config.dir.clone();
        let ignore = self.ignore.clone();
        let index = tokio::task::spawn_blocking(move || {
            FingerprintIndex::build_or_empty(&dir, &ignore, true)
        })
        .await
        .map_err(|e| Error::other(format!("indexing task failed: {}", e)))??;

        info!(
            "Reporting {} local file(s) to {}",
            index.len(),
            self.base.as_str()
        );
        self.request_update(&index.into_request(self.config.transfer))
            .await
    }

    /// Bring the local tree up to date, or only report when `check_only` is set
    ///
    /// Leftover temp files of an earlier run are removed first. The state
    /// file is written back after every run that was not check-only.
    pub async fn run(&self) -> Result<UpdateOutcome> {
        match clean_temp_files(&self.config.dir) {
            Ok(0) => {}
            Ok(removed) => debug!("Removed {} leftover temp file(s)", removed),
            Err(e) => warn!("Could not clean temp files: {}", e),
        }

        let response = self.check().await?;

        if response.is_up_to_date() {
            info!("App '{}' is up to date", self.config.app);
            if !self.config.check_only {
                self.save_state()?;
            }
            return Ok(UpdateOutcome::UpToDate);
        }

        if self.config.check_only {
            return Ok(UpdateOutcome::Available {
                files: response.diff.len(),
                bytes: response.total_size(),
            });
        }

        let files = if response.patch_file.is_empty() {
            if self.config.transfer == TransferMode::Archive {
                warn!("Server sent no patch archive, downloading file by file");
            }
            self.download_files(&response).await?
        } else {
            self.download_archive(&response).await?
        };

        self.save_state()?;
        info!("Updated {} file(s) in {}", files, self.config.dir.display());
        Ok(UpdateOutcome::Updated { files })
    }

    async fn request_update(&self, request: &UpdateRequest) -> Result<UpdateResponse> {
        let url = self.endpoint(&["hasupdate", &self.config.app])?;
        let body = encode_request(request)?;

        let response = self
            .http
            .post(url)
            .form(&[(REQUEST_FIELD, body)])
            .send()
            .await
            .map_err(|e| Error::network(format!("update check failed: {}", e)))?;
        let response = ensure_success(response).await?;

        response
            .json::<UpdateResponse>()
            .await
            .map_err(|e| Error::protocol(format!("invalid update response: {}", e)))
    }

    async fn download_archive(&self, update: &UpdateResponse) -> Result<usize> {
        let url = self
            .base
            .join(&update.patch_file)
            .map_err(|e| Error::protocol(format!("invalid patch file '{}': {}", update.patch_file, e)))?;
        debug!("Downloading patch archive {}", url);

        let archive = fetch(&self.http, url).await?;
        if archive.len() as u64 != update.patch_size {
            return Err(Error::protocol(format!(
                "patch archive is {} bytes, expected {}",
                archive.len(),
                update.patch_size
            )));
        }

        let target = self.config.dir.clone();
        let diff = update.diff.clone();
        let ignore = self.ignore.clone();
        let hide = Arc::clone(&self.hide);
        tokio::task::spawn_blocking(move || {
            apply_patch(&target, archive.as_ref(), &diff, &ignore, hide.as_ref())
        })
        .await
        .map_err(|e| Error::other(format!("apply task failed: {}", e)))?
        .map_err(Error::from)
    }

    async fn download_files(&self, update: &UpdateResponse) -> Result<usize> {
        // Nothing is fetched unless every path stays inside the target
        let checked = update
            .diff
            .iter()
            .map(|(key, entry)| safe_relative_path(Path::new(key)).map(|relative| (relative, entry)))
            .collect::<Result<Vec<_>>>()?;

        let permits = Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY));
        let mut tasks = JoinSet::new();

        for (relative, entry) in checked {
            let dest = self.config.dir.join(&relative);
            if self.ignore.is_ignored(&relative) && dest.exists() {
                debug!("Keeping local copy of ignored {}", relative);
                continue;
            }

            let url = {
                let mut segments = vec!["app", self.config.app.as_str()];
                segments.extend(relative.split('/'));
                self.endpoint(&segments)?
            };

            let download = FileDownload {
                relative,
                dest,
                entry: entry.clone(),
            };
            let http = self.http.clone();
            let hide = Arc::clone(&self.hide);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::other(format!("download slots closed: {}", e)))?;
                download.run(&http, url, hide).await
            });
        }

        let mut applied = 0;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| Error::other(format!("download task failed: {}", e)));
            match result.and_then(|written| written) {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Download failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(error) => Err(ApplyFailure::new(applied, error).into()),
            None => Ok(applied),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::config(format!("invalid host '{}'", self.config.host)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn state_path(&self) -> PathBuf {
        self.config.dir.join(CLIENT_STATE_FILE)
    }

    fn save_state(&self) -> Result<()> {
        let path = self.state_path();
        std::fs::create_dir_all(&self.config.dir)
            .map_err(|e| Error::write(&self.config.dir, e))?;

        if path.exists() {
            if let Err(e) = self.hide.unhide(&path) {
                debug!("Could not unhide {}: {}", path.display(), e);
            }
        }
        ConfigLoader::save_client_state(&self.config.to_state(), &path)?;
        if let Err(e) = self.hide.hide(&path) {
            debug!("Could not hide {}: {}", path.display(), e);
        }
        filetime::set_file_mtime(&path, FileTime::now()).map_err(|e| Error::write(&path, e))?;
        Ok(())
    }
}

/// One changed file fetched through the per-file endpoint
struct FileDownload {
    relative: String,
    dest: PathBuf,
    entry: DiffEntry,
}

impl FileDownload {
    async fn run(self, http: &reqwest::Client, url: Url, hide: Arc<dyn HideFile>) -> Result<()> {
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::network(format!("download of '{}' failed: {}", self.relative, e)))?;
        let response = ensure_success(response).await?;
        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"));
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::network(format!("download of '{}' failed: {}", self.relative, e)))?;

        tokio::task::spawn_blocking(move || self.write(&body, gzipped, hide.as_ref()))
            .await
            .map_err(|e| Error::other(format!("write task failed: {}", e)))?
    }

    fn write(&self, body: &[u8], gzipped: bool, hide: &dyn HideFile) -> Result<()> {
        let content = if gzipped {
            gunzip(body).map_err(|e| {
                Error::protocol(format!("corrupt download of '{}': {}", self.relative, e))
            })?
        } else {
            body.to_vec()
        };

        let actual = hash_bytes(&content);
        if actual != self.entry.new_hash {
            return Err(Error::hash_mismatch(&self.relative, &self.entry.new_hash, &actual));
        }

        replace_file(
            &self.dest,
            &content,
            self.entry.mode,
            file_time(&self.entry.mod_time),
            hide,
        )?;
        debug!("Wrote {} ({} bytes)", self.relative, content.len());
        Ok(())
    }
}

fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut content = Vec::new();
    GzDecoder::new(body).read_to_end(&mut content)?;
    Ok(content)
}

async fn fetch(http: &reqwest::Client, url: Url) -> Result<Bytes> {
    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::network(format!("download of {} failed: {}", url, e)))?;
    ensure_success(response)
        .await?
        .bytes()
        .await
        .map_err(|e| Error::network(format!("download of {} failed: {}", url, e)))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    Err(Error::network(format!(
        "{} answered {}: {}",
        url,
        status,
        body.trim()
    )))
}

/// Whether `dir` has a state file from an earlier run
pub fn has_state_file<P: AsRef<Path>>(dir: P) -> bool {
    dir.as_ref().join(CLIENT_STATE_FILE).is_file()
}

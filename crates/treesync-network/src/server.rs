//! Update server: diffing, packing and serving app trees over HTTP

use crate::protocol::{
    decode_request, patch_file_url, APP_FILE_ROUTE, HAS_UPDATE_ROUTE, PATCH_FILE_ROUTE,
    REQUEST_FIELD,
};
use axum::extract::{Form, Path as UrlPath, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use treesync_config::ServerConfig;
use treesync_sync::{
    hash_bytes, safe_relative_path, ChangeDebouncer, ChangeEvent, ChangeKind, DiffResolver,
    HashMemo, HotCache, IgnoreSet, PatchArchiver, TreeWatcher,
};
use treesync_types::{Error, Result, TransferMode, UpdateRequest, UpdateResponse};

/// One application published by the server
#[derive(Debug, Clone)]
pub struct PublishedApp {
    /// Root of the authoritative tree
    pub dir: PathBuf,
    /// Server files never offered to clients
    pub ignore: IgnoreSet,
}

/// Server-side composition of diffing, packing and caching
///
/// Built once at start-up and shared by every request handler and the cache
/// invalidation consumer.
#[derive(Debug)]
pub struct SyncCoordinator {
    apps: HashMap<String, PublishedApp>,
    cache: Arc<HotCache>,
    memo: Arc<HashMemo>,
    archiver: PatchArchiver,
    file_ttl: Duration,
}

impl SyncCoordinator {
    /// Build the coordinator for every app in `config`
    pub fn new(config: &ServerConfig) -> Result<Self> {
        if config.apps.is_empty() {
            return Err(Error::config("no apps are configured"));
        }

        let current_dir = std::env::current_dir()?;
        let mut apps = HashMap::new();
        for (name, app) in &config.apps {
            let dir = if app.dir.is_absolute() {
                app.dir.clone()
            } else {
                current_dir.join(&app.dir)
            };
            apps.insert(
                name.clone(),
                PublishedApp {
                    dir,
                    ignore: IgnoreSet::new(&app.ignore)?,
                },
            );
        }

        let cache = Arc::new(HotCache::with_sweep_period(
            config.cache.items_limit,
            config.cache.sweep_period(),
        ));
        let archiver =
            PatchArchiver::new(Arc::clone(&cache), &config.cache_dir).with_ttl(config.cache.ttl());

        Ok(Self {
            apps,
            cache,
            memo: Arc::new(HashMemo::new()),
            archiver,
            file_ttl: config.cache.ttl(),
        })
    }

    /// Published app by name
    pub fn app(&self, name: &str) -> Option<&PublishedApp> {
        self.apps.get(name)
    }

    /// Hot cache shared by archives and per-file downloads
    pub fn cache(&self) -> &Arc<HotCache> {
        &self.cache
    }

    /// Hash memo of app files
    pub fn memo(&self) -> &Arc<HashMemo> {
        &self.memo
    }

    /// App roots that exist and can be watched
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for (name, app) in &self.apps {
            if app.dir.is_dir() {
                roots.push(app.dir.clone());
            } else {
                warn!("App '{}' dir {} does not exist, not watching", name, app.dir.display());
            }
        }
        roots
    }

    /// Diff `request` against the app tree and pack the result for archive clients
    ///
    /// An unknown app gets an empty response, which clients read as "up to date".
    pub fn check_update(&self, app: &str, request: &UpdateRequest) -> Result<UpdateResponse> {
        let Some(published) = self.apps.get(app) else {
            warn!("Update check for unknown app '{}'", app);
            return Ok(UpdateResponse::default());
        };

        let diff = DiffResolver::new(&published.dir)
            .with_ignore(published.ignore.clone())
            .with_memo(Arc::clone(&self.memo))
            .resolve(&request.hashes)?;

        let mut response = UpdateResponse {
            diff,
            ..UpdateResponse::default()
        };

        if !response.diff.is_empty() && request.transfer_mode() == TransferMode::Archive {
            let patch = self.archiver.pack(&published.dir, &response.diff)?;
            response.patch_file = patch_file_url(&patch.name);
            response.patch_size = patch.size();
        }

        info!(
            "App '{}': {} of {} reported file(s) need an update",
            app,
            response.diff.len(),
            request.hashes.len()
        );
        Ok(response)
    }

    /// Bytes of a previously built patch archive
    pub fn patch_archive(&self, name: &str) -> Result<Option<Bytes>> {
        self.archiver.load(name)
    }

    /// Gzip-encoded content of one app file, `None` when it is not served
    pub fn app_file(&self, app: &str, relative: &str) -> Result<Option<Bytes>> {
        let Some(published) = self.apps.get(app) else {
            return Ok(None);
        };
        let Ok(relative) = safe_relative_path(Path::new(relative.trim_start_matches('/'))) else {
            return Ok(None);
        };
        if published.ignore.is_ignored(&relative) {
            return Ok(None);
        }

        let path = published.dir.join(&relative);
        if !path.is_file() {
            return Ok(None);
        }

        if let Some(bytes) = self.cache.get(&cache_key(&path)) {
            return Ok(Some(bytes));
        }
        self.cache_file(&path).map(Some)
    }

    /// Hash, gzip and cache the file at `path`
    pub fn cache_file(&self, path: &Path) -> Result<Bytes> {
        let content = std::fs::read(path).map_err(|e| Error::read(path, e))?;
        let metadata = std::fs::metadata(path).map_err(|e| Error::read(path, e))?;
        let modified = metadata.modified().map_err(|e| Error::read(path, e))?;

        let hash = hash_bytes(&content);
        self.memo.store(path, metadata.len(), modified, hash.clone());
        debug!("File {} hash: {}", path.display(), hash);

        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs() as u32);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut encoder: GzEncoder<Vec<u8>> = GzBuilder::new()
            .filename(file_name)
            .mtime(mtime)
            .write(Vec::new(), Compression::default());
        encoder.write_all(&content)?;
        let compressed = Bytes::from(encoder.finish()?);

        self.cache
            .put(cache_key(path), compressed.clone(), self.file_ttl);
        Ok(compressed)
    }

    /// Keep caches coherent with one filesystem change
    pub fn handle_change(&self, event: &ChangeEvent) {
        self.memo.remove(&event.path);
        let key = cache_key(&event.path);

        match event.kind {
            ChangeKind::Write => {
                if self.cache.contains(&key) {
                    if let Err(e) = self.cache_file(&event.path) {
                        warn!("Dropping cached {}: {}", event.path.display(), e);
                        self.cache.delete(&key);
                    }
                }
            }
            ChangeKind::Rename | ChangeKind::Remove => {
                if self.cache.delete(&key) {
                    debug!("Invalidated cached {}", event.path.display());
                }
            }
            ChangeKind::Create | ChangeKind::Metadata => {}
        }
    }
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Apply debounced changes to the coordinator's caches until `events` closes
pub fn spawn_invalidation(
    coordinator: Arc<SyncCoordinator>,
    mut events: mpsc::Receiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!("Change {:?} on {}", event.kind, event.path.display());
            let coordinator = Arc::clone(&coordinator);
            if let Err(e) =
                tokio::task::spawn_blocking(move || coordinator.handle_change(&event)).await
            {
                error!("Cache invalidation task failed: {}", e);
            }
        }
        debug!("Change stream closed, invalidation stopped");
    })
}

/// Error response of a handler
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: Error,
}

impl ApiError {
    fn bad_request(error: Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
        }
    }

    fn internal(error: Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.error);
        } else {
            warn!("Request rejected: {}", self.error);
        }
        (self.status, self.error.to_string()).into_response()
    }
}

async fn blocking<T, F>(work: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::internal(Error::other(format!("worker task failed: {}", e))))?
        .map_err(ApiError::internal)
}

async fn has_update(
    State(coordinator): State<Arc<SyncCoordinator>>,
    UrlPath(app): UrlPath<String>,
    Form(form): Form<HashMap<String, String>>,
) -> std::result::Result<Json<UpdateResponse>, ApiError> {
    let raw = form.get(REQUEST_FIELD).map_or("", String::as_str);
    let request = decode_request(raw).map_err(ApiError::bad_request)?;

    let response = blocking(move || coordinator.check_update(&app, &request)).await?;
    Ok(Json(response))
}

async fn patch_file(
    State(coordinator): State<Arc<SyncCoordinator>>,
    UrlPath(file): UrlPath<String>,
) -> std::result::Result<Response, ApiError> {
    let archive = blocking(move || coordinator.patch_archive(&file)).await?;
    Ok(match archive {
        Some(bytes) => ([(header::CONTENT_TYPE, "application/gzip")], bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "file not found").into_response(),
    })
}

async fn app_file(
    State(coordinator): State<Arc<SyncCoordinator>>,
    UrlPath((app, path)): UrlPath<(String, String)>,
) -> std::result::Result<Response, ApiError> {
    let content = blocking(move || coordinator.app_file(&app, &path)).await?;
    Ok(match content {
        Some(bytes) => {
            let mut response = bytes.into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        None => (StatusCode::NOT_FOUND, "file not found").into_response(),
    })
}

async fn request_span(request: Request, next: Next) -> Response {
    let span = info_span!(
        "request",
        id = %uuid::Uuid::new_v4(),
        method = %request.method(),
        uri = %request.uri(),
    );
    async move {
        let response = next.run(request).await;
        debug!("Responded {}", response.status());
        response
    }
    .instrument(span)
    .await
}

/// HTTP routes of the update protocol
pub fn router(coordinator: Arc<SyncCoordinator>) -> Router {
    Router::new()
        .route(HAS_UPDATE_ROUTE, post(has_update))
        .route(PATCH_FILE_ROUTE, get(patch_file))
        .route(APP_FILE_ROUTE, get(app_file))
        .layer(middleware::from_fn(request_span))
        .with_state(coordinator)
}

/// Serve `coordinator` on an already bound listener until `shutdown` resolves
pub async fn serve_on<F>(
    listener: TcpListener,
    coordinator: Arc<SyncCoordinator>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::network(format!("server error: {}", e)))
}

/// Run the update server described by `config` until `shutdown` resolves
///
/// Watches every existing app root when watching is enabled, so cached files
/// are refreshed or dropped as the trees change.
pub async fn serve<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let coordinator = Arc::new(SyncCoordinator::new(&config)?);

    let _watcher = if config.watch.enabled {
        let (changes, debounced) = ChangeDebouncer::spawn(config.watch.minimal_pass());
        let watcher = TreeWatcher::start(coordinator.watch_roots(), changes)?;
        spawn_invalidation(Arc::clone(&coordinator), debounced);
        Some(watcher)
    } else {
        None
    };

    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|e| Error::network(format!("cannot listen on {}: {}", config.listen, e)))?;
    info!(
        "Serving {} app(s) on {}",
        config.apps.len(),
        listener.local_addr()?
    );

    serve_on(listener, coordinator, shutdown).await
}

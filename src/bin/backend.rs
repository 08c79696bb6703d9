#![forbid(unsafe_code)]

//! Axum backend for the DotByte movie library.
//!
//! Serves the catalog over JSON, streams video files with HTTP range support
//! so players can seek, and runs URL downloads as background transfer tasks
//! whose progress lands in the catalog through a single store-updater task.
//! The web dashboard is a separate project; everything it needs lives behind
//! `/api`.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use dotbyte_tools::catalog::{
    CatalogReader, CatalogStore, DownloadJob, DownloadPatch, DownloadStatus, Movie, MoviePatch,
    NewMovie, is_video_file,
};
use dotbyte_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use dotbyte_tools::security::ensure_not_root;
use futures_util::StreamExt;
use mime_guess::MimeGuess;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    signal,
    sync::mpsc,
};
use tokio_util::io::ReaderStream;
use url::Url;
use uuid::Uuid;

// Upload subdirectories under the media root. URL downloads land in the root
// itself, which is where the dashboard expects them.
const MOVIES_SUBDIR: &str = "movies";
const TV_SHOWS_SUBDIR: &str = "tv-shows";

/// Name used when a download URL carries no usable path segment.
const FALLBACK_DOWNLOAD_NAME: &str = "downloaded_video.mp4";

// Uploads may be full-length features; cap them at 50 GB.
const UPLOAD_BODY_LIMIT: usize = 50 * 1024 * 1024 * 1024;

/// Minimum spacing between persisted progress ticks for one transfer.
/// Without it every network chunk would become a row update.
const PROGRESS_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct BackendArgs {
    movies_dir: PathBuf,
    database: PathBuf,
    dotbyte_port: u16,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut movies_dir_override: Option<PathBuf> = None;
        let mut database_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<String> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--movies-dir=") {
                movies_dir_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--database=") {
                database_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(value.to_string());
                continue;
            }

            match arg.as_str() {
                "--movies-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--movies-dir requires a value"))?;
                    movies_dir_override = Some(PathBuf::from(value));
                }
                "--database" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--database requires a value"))?;
                    database_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(value);
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        let runtime = resolve_runtime_paths(RuntimeOverrides {
            movies_dir: movies_dir_override,
            database: database_override,
            dotbyte_port: port_override,
            dotbyte_host: host_override,
            env_path: None,
        })?;
        let listen_host = parse_host_arg(&runtime.dotbyte_host)?;

        Ok(Self {
            movies_dir: runtime.movies_dir,
            database: runtime.database,
            dotbyte_port: runtime.dotbyte_port,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value.parse::<u16>().context("port must be a number in 0-65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("host must be an IPv4 or IPv6 address (--host / DOTBYTE_HOST)")
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: String,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize)]
struct PopularQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_movies: i64,
    total_views: i64,
    active_downloads: i64,
    completed_downloads: i64,
    storage_used: String,
}

/// One write applied to the catalog by the store-updater task. Transfer
/// tasks never touch the database themselves; they only send these.
struct StoreUpdate {
    job_id: String,
    patch: DownloadPatch,
    /// Movie to register once the patch lands; set by the completion update.
    register: Option<NewMovie>,
}

/// Owns the background transfer tasks for URL downloads. Cloning shares the
/// same task registry and update channel.
#[derive(Clone)]
struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

struct DownloadManagerInner {
    client: reqwest::Client,
    media_root: PathBuf,
    updates: mpsc::UnboundedSender<StoreUpdate>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl DownloadManager {
    fn new(media_root: PathBuf, updates: mpsc::UnboundedSender<StoreUpdate>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dotbyte-backend/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client for downloads")?;
        Ok(Self {
            inner: Arc::new(DownloadManagerInner {
                client,
                media_root,
                updates,
                cancel_flags: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Spawns a background transfer for a freshly created job row. Returns
    /// immediately; all further state flows through the update channel.
    fn start_transfer(&self, job: &DownloadJob) {
        let cancel = Arc::new(AtomicBool::new(false));
        self.inner
            .cancel_flags
            .lock()
            .insert(job.id.clone(), cancel.clone());

        let inner = self.inner.clone();
        let job_id = job.id.clone();
        let url = job.url.clone();
        let filename = job.filename.clone();
        tokio::spawn(async move {
            if let Err(err) = run_transfer(&inner, &job_id, &url, &filename, &cancel).await {
                eprintln!("Warning: download {job_id} failed: {err:#}");
                inner.send_update(StoreUpdate {
                    job_id: job_id.clone(),
                    patch: DownloadPatch {
                        status: Some(DownloadStatus::Failed),
                        ..DownloadPatch::default()
                    },
                    register: None,
                });
            }
            inner.cancel_flags.lock().remove(&job_id);
        });
    }

    /// Signals the transfer task for `job_id` to stop, if one is still
    /// running. The task notices at its next chunk boundary.
    fn cancel(&self, job_id: &str) {
        if let Some(flag) = self.inner.cancel_flags.lock().get(job_id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn active_transfers(&self) -> usize {
        self.inner.cancel_flags.lock().len()
    }
}

impl DownloadManagerInner {
    fn send_update(&self, update: StoreUpdate) {
        // The updater only goes away during shutdown; there is nothing left
        // to record then.
        let _ = self.updates.send(update);
    }
}

/// The single writer of job rows after creation. Patches are applied in
/// arrival order, so one job's updates can never interleave.
async fn run_store_updater(
    store: Arc<CatalogStore>,
    mut updates: mpsc::UnboundedReceiver<StoreUpdate>,
) {
    while let Some(update) = updates.recv().await {
        if let Err(err) = store
            .apply_download_patch(&update.job_id, &update.patch)
            .await
        {
            eprintln!(
                "Warning: failed to update download {}: {err:#}",
                update.job_id
            );
        }
        if let Some(new_movie) = update.register {
            if let Err(err) = store.create_movie(new_movie).await {
                eprintln!("Warning: failed to register downloaded movie: {err:#}");
            }
        }
    }
}

/// Fetches one URL into the media root, reporting progress through the
/// update channel. A cancelled transfer returns Ok too: the job row is
/// already gone and nothing more should be written about it.
async fn run_transfer(
    inner: &DownloadManagerInner,
    job_id: &str,
    url: &str,
    filename: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    inner.send_update(StoreUpdate {
        job_id: job_id.to_owned(),
        patch: DownloadPatch {
            status: Some(DownloadStatus::Downloading),
            speed: Some("Connecting...".to_string()),
            eta: Some("Calculating...".to_string()),
            ..DownloadPatch::default()
        },
        register: None,
    });

    let response = inner
        .client
        .get(url)
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?;
    if !response.status().is_success() {
        bail!("{url} answered {}", response.status());
    }
    let total = response.content_length().filter(|len| *len > 0);
    if let Some(total) = total {
        inner.send_update(StoreUpdate {
            job_id: job_id.to_owned(),
            patch: DownloadPatch {
                file_size: Some(total as i64),
                ..DownloadPatch::default()
            },
            register: None,
        });
    }

    tokio::fs::create_dir_all(&inner.media_root)
        .await
        .with_context(|| format!("creating {}", inner.media_root.display()))?;
    let (dest, mut file) =
        claim_destination(&inner.media_root, &sanitize_file_name(filename)).await?;

    let mut stream = response.bytes_stream();
    let started = Instant::now();
    let mut last_tick = Instant::now();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        if cancel.load(Ordering::Relaxed) {
            // The job was deleted; leave the partial file and go quiet.
            return Ok(());
        }
        let chunk = chunk.with_context(|| format!("reading body from {url}"))?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", dest.display()))?;
        downloaded += chunk.len() as u64;

        if last_tick.elapsed() >= PROGRESS_TICK {
            last_tick = Instant::now();
            inner.send_update(StoreUpdate {
                job_id: job_id.to_owned(),
                patch: progress_patch(downloaded, total, started.elapsed()),
                register: None,
            });
        }
    }
    file.flush()
        .await
        .with_context(|| format!("flushing {}", dest.display()))?;

    inner.send_update(StoreUpdate {
        job_id: job_id.to_owned(),
        patch: DownloadPatch {
            status: Some(DownloadStatus::Completed),
            progress: Some(100),
            downloaded_size: Some(downloaded as i64),
            speed: Some("Completed".to_string()),
            eta: Some("Done".to_string()),
            ..DownloadPatch::default()
        },
        register: Some(NewMovie {
            title: title_from_path(&dest),
            description: Some(format!("Downloaded from: {url}")),
            file_path: dest.to_string_lossy().into_owned(),
            thumbnail_path: None,
            duration: None,
            file_size: Some(downloaded as i64),
            genre: None,
        }),
    });

    Ok(())
}

/// Builds the per-tick display fields. Percentage and ETA need the total
/// size; when the remote never declared one they stay unset and the stored
/// progress remains at zero.
fn progress_patch(downloaded: u64, total: Option<u64>, elapsed: Duration) -> DownloadPatch {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        downloaded as f64 / secs
    } else {
        0.0
    };
    let mut patch = DownloadPatch {
        downloaded_size: Some(downloaded as i64),
        speed: Some(format_speed(rate)),
        ..DownloadPatch::default()
    };
    if let Some(total) = total {
        let percent = (downloaded as f64 / total as f64 * 100.0).round() as i64;
        patch.progress = Some(percent.min(100));
        if rate > 0.0 {
            let remaining = total.saturating_sub(downloaded) as f64 / rate;
            patch.eta = Some(format_eta(remaining));
        }
    }
    patch
}

/// Shared state injected into every handler.
///
/// `store` performs all catalog writes, `reader` is the cheap cloneable
/// handle for query-only paths, and `downloads` owns the transfer tasks.
#[derive(Clone)]
struct AppState {
    store: Arc<CatalogStore>,
    reader: CatalogReader,
    media_root: Arc<PathBuf>,
    downloads: DownloadManager,
}

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        movies_dir,
        database,
        dotbyte_port,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    std::fs::create_dir_all(&movies_dir)
        .with_context(|| format!("creating media root {}", movies_dir.display()))?;

    let store = Arc::new(
        CatalogStore::open(&database)
            .await
            .context("initializing catalog store")?,
    );
    let reader = CatalogReader::new(&database)
        .await
        .context("initializing catalog reader")?;

    // Jobs still marked active belonged to a previous process; their
    // transfer tasks are gone for good.
    let swept = store.fail_orphaned_downloads().await?;
    if swept > 0 {
        println!("Marked {swept} orphaned download job(s) as failed.");
    }

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_store_updater(store.clone(), updates_rx));
    let downloads = DownloadManager::new(movies_dir.clone(), updates_tx)?;

    let state = AppState {
        store,
        reader,
        media_root: Arc::new(movies_dir),
        downloads,
    };

    let app = build_router(state);

    let addr = SocketAddr::new(listen_host, dotbyte_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("DotByte API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/movies", get(list_movies).post(create_movie))
        .route("/api/movies/popular", get(popular_movies))
        .route("/api/movies/scan", post(scan_movies))
        .route(
            "/api/movies/{id}",
            get(get_movie).patch(update_movie).delete(delete_movie),
        )
        .route("/api/movies/{id}/view", post(record_view))
        .route("/api/videos/{id}", get(stream_movie))
        .route(
            "/api/upload",
            post(upload_video).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/downloads", get(list_downloads).post(submit_download))
        .route("/api/downloads/{id}", delete(delete_download))
        .route("/api/stats", get(library_stats))
        .fallback(endpoint_not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    // A failed handler registration only costs the graceful drain; Ctrl+C
    // still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Warning: could not install Ctrl+C handler: {err}");
    }
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn list_movies(State(state): State<AppState>) -> ApiResult<Json<Vec<Movie>>> {
    let movies = state
        .reader
        .list_movies()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(movies))
}

async fn get_movie(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Movie>> {
    let movie = state
        .reader
        .get_movie(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("Movie not found"))?;
    Ok(Json(movie))
}

async fn create_movie(
    State(state): State<AppState>,
    Json(payload): Json<NewMovie>,
) -> ApiResult<(StatusCode, Json<Movie>)> {
    if payload.title.trim().is_empty() {
        return Err(ApiError::bad_request("movie title must not be empty"));
    }
    if payload.file_path.trim().is_empty() {
        return Err(ApiError::bad_request("movie filePath must not be empty"));
    }
    let movie = state
        .store
        .create_movie(payload)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok((StatusCode::CREATED, Json(movie)))
}

async fn update_movie(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(patch): Json<MoviePatch>,
) -> ApiResult<Json<Movie>> {
    if patch
        .title
        .as_deref()
        .is_some_and(|title| title.trim().is_empty())
    {
        return Err(ApiError::bad_request("movie title must not be empty"));
    }
    if patch
        .file_path
        .as_deref()
        .is_some_and(|path| path.trim().is_empty())
    {
        return Err(ApiError::bad_request("movie filePath must not be empty"));
    }
    let movie = state
        .store
        .update_movie(&id, &patch)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("Movie not found"))?;
    Ok(Json(movie))
}

async fn delete_movie(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let deleted = state
        .store
        .delete_movie(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !deleted {
        return Err(ApiError::not_found("Movie not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn record_view(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let counted = state
        .store
        .increment_views(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !counted {
        return Err(ApiError::not_found("Movie not found"));
    }
    Ok(Json(json!({ "message": "View recorded" })))
}

async fn popular_movies(
    State(state): State<AppState>,
    Query(params): Query<PopularQuery>,
) -> ApiResult<Json<Vec<Movie>>> {
    let limit = params.limit.filter(|value| *value >= 0).unwrap_or(10);
    let movies = state
        .reader
        .popular_movies(limit)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(movies))
}

/// Reconciles the media root with the catalog and returns every movie whose
/// backing file was seen under it.
async fn scan_movies(State(state): State<AppState>) -> ApiResult<Json<Vec<Movie>>> {
    let movies = state
        .store
        .scan_movie_directory(&state.media_root)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(movies))
}

async fn library_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let stats = state
        .reader
        .library_stats()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(StatsResponse {
        total_movies: stats.total_movies,
        total_views: stats.total_views,
        active_downloads: stats.active_downloads,
        completed_downloads: stats.completed_downloads,
        storage_used: format_storage(stats.storage_bytes),
    }))
}

async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Vec<DownloadJob>>> {
    let jobs = state
        .reader
        .list_downloads()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(jobs))
}

/// Validates the URL, persists a pending job and spawns the transfer. The
/// response never waits on the network.
async fn submit_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<(StatusCode, Json<DownloadJob>)> {
    let url = validate_download_url(&payload.url)
        .map_err(|err| ApiError::bad_request(format!("invalid download URL: {err}")))?;
    let filename = payload
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| filename_from_url(&url));

    let job = state
        .store
        .create_download(url.as_str(), &filename)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    state.downloads.start_transfer(&job);
    Ok((StatusCode::CREATED, Json(job)))
}

/// Removes the job row and signals its transfer task to stop. The
/// downloaded file and any movie already registered from it are left alone.
async fn delete_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let deleted = state
        .store
        .delete_download(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !deleted {
        return Err(ApiError::not_found("Download not found"));
    }
    state.downloads.cancel(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_movie(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let movie = state
        .reader
        .get_movie(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("Video file not found"))?;
    serve_video(Path::new(&movie.file_path), &headers).await
}

/// Streams a file honoring a single `Range: bytes=` header. The total size
/// always comes from the live file, never from catalog metadata, and the
/// body is produced chunk by chunk so multi-gigabyte files never sit in
/// memory.
async fn serve_video(path: &Path, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("Video file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("Video file not found"))?;
    let size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            if let Ok(value) = format!("bytes */{}", size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = format!("bytes {}-{}/{}", start, end, size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let mut response = Body::from_stream(stream).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, video_content_type(path));

    Ok(response)
}

/// Parses `bytes=<start>-[<end>]` and the suffix form `bytes=-N`. Anything
/// unparseable yields None, which callers treat as "serve the whole file":
/// garbled range headers from real players must not break playback.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means the final N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        let start = size.saturating_sub(suffix_len);
        return Some((start, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    if end_str.is_empty() {
        // Open-ended; a start past the file size is reported by the caller
        // as unsatisfiable, not treated as malformed.
        return Some((start, size.saturating_sub(1)));
    }
    let end: u64 = end_str.parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end))
}

fn video_content_type(path: &Path) -> HeaderValue {
    MimeGuess::from_path(path)
        .first()
        .and_then(|mime| HeaderValue::from_str(mime.as_ref()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("video/mp4"))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ContentKind {
    Movies,
    TvShows,
}

impl ContentKind {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "tv-shows" | "tv-show" => Self::TvShows,
            _ => Self::Movies,
        }
    }

    fn subdir(self) -> &'static str {
        match self {
            Self::Movies => MOVIES_SUBDIR,
            Self::TvShows => TV_SHOWS_SUBDIR,
        }
    }

    fn singular(self) -> &'static str {
        match self {
            Self::Movies => "movie",
            Self::TvShows => "tv-show",
        }
    }

    fn genre(self) -> Option<String> {
        match self {
            Self::Movies => None,
            Self::TvShows => Some("TV Show".to_string()),
        }
    }
}

struct StagedUpload {
    original_name: String,
    part_path: PathBuf,
    bytes: u64,
}

/// Accepts a multipart form with a `video` file field and an optional
/// `content_type` field. The file is streamed into a hidden part file while
/// the form is read (the field order is up to the client), then moved to
/// its final name once the target subdirectory is known.
async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Movie>)> {
    let mut kind = ContentKind::Movies;
    let mut staged: Option<StagedUpload> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart payload: {err}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("content_type") => {
                let value = field.text().await.map_err(|err| {
                    ApiError::bad_request(format!("reading content_type field: {err}"))
                })?;
                kind = ContentKind::parse(&value);
            }
            Some("video") => {
                let original_name = field
                    .file_name()
                    .map(str::to_owned)
                    .ok_or_else(|| ApiError::bad_request("video field must carry a file name"))?;
                if !is_video_file(Path::new(&original_name)) {
                    return Err(ApiError::bad_request(
                        "Invalid file type. Only video files are allowed.",
                    ));
                }
                if let Some(old) = staged.take() {
                    let _ = tokio::fs::remove_file(&old.part_path).await;
                }
                staged = Some(stage_upload(&state.media_root, &mut field, original_name).await?);
            }
            _ => {}
        }
    }

    let Some(staged) = staged else {
        return Err(ApiError::bad_request("No file uploaded"));
    };

    let target_dir = state.media_root.join(kind.subdir());
    tokio::fs::create_dir_all(&target_dir)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    let file_name = sanitize_file_name(&staged.original_name);
    let (dest, placeholder) = claim_destination(&target_dir, &file_name)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    drop(placeholder);
    tokio::fs::rename(&staged.part_path, &dest)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let movie = state
        .store
        .create_movie(NewMovie {
            title: title_from_path(Path::new(&staged.original_name)),
            description: Some(format!(
                "Uploaded {}: {}",
                kind.singular(),
                staged.original_name
            )),
            file_path: dest.to_string_lossy().into_owned(),
            thumbnail_path: None,
            duration: None,
            file_size: Some(staged.bytes as i64),
            genre: kind.genre(),
        })
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok((StatusCode::CREATED, Json(movie)))
}

/// Streams an upload field into a uniquely named part file under the media
/// root, so a dropped connection never leaves a half-written file behind a
/// real movie name.
async fn stage_upload(
    media_root: &Path,
    field: &mut Field<'_>,
    original_name: String,
) -> ApiResult<StagedUpload> {
    let part_path = media_root.join(format!(".upload-{}.part", Uuid::new_v4()));
    let mut file = File::create(&part_path)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    let mut bytes: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::bad_request(format!("reading upload: {err}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?;
        bytes += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(StagedUpload {
        original_name,
        part_path,
        bytes,
    })
}

/// Replaces every character outside `[A-Za-z0-9._-]` with an underscore.
/// Leading and trailing dots are stripped so "." and ".." can never reach
/// the filesystem.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        FALLBACK_DOWNLOAD_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Creates the destination file, appending `-1`, `-2`, ... before the
/// extension until a free name is found. `create_new` makes the claim
/// atomic, so two concurrent writers cannot end up with the same path.
async fn claim_destination(dir: &Path, file_name: &str) -> Result<(PathBuf, File)> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name);
    let ext = Path::new(file_name).extension().and_then(|ext| ext.to_str());

    for attempt in 0..10_000u32 {
        let candidate = if attempt == 0 {
            file_name.to_string()
        } else {
            match ext {
                Some(ext) => format!("{stem}-{attempt}.{ext}"),
                None => format!("{stem}-{attempt}"),
            }
        };
        let path = dir.join(candidate);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("creating {}", path.display()));
            }
        }
    }
    bail!("no free name for {file_name} in {}", dir.display())
}

fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn validate_download_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).context("not an absolute URL")?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("only http and https URLs are supported");
    }
    Ok(url)
}

/// Picks the final path segment of the URL as the file name, falling back
/// to a generic one for URLs like `https://example.com/`.
fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .unwrap_or_else(|| FALLBACK_DOWNLOAD_NAME.to_string())
}

fn format_speed(bytes_per_sec: f64) -> String {
    format!("{:.2} MB/s", bytes_per_sec / (1024.0 * 1024.0))
}

fn format_eta(seconds: f64) -> String {
    format!("{}s", seconds.round() as u64)
}

fn format_storage(bytes: i64) -> String {
    format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

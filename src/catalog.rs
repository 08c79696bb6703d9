//! Catalog persistence layer for DotByte: movie records and download jobs.
//!
//! All structs in this module mirror how catalog rows are stored in SQLite and
//! exposed to the API. Field names serialize in camelCase because that is what
//! the dashboard and the mobile app consume.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

/// File extensions the platform treats as playable video, lowercase.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm"];

/// Returns true when the path's extension marks it as a video file.
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

/// Rows stored in the `movies` table. `file_path` is the only field the
/// streaming route needs; everything else is display metadata for the UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    pub views: i64,
    pub rating: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    pub created_at: String,
}

/// Caller-supplied fields for a new movie row. The store assigns the id,
/// the view counter, the initial rating and the creation timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMovie {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub file_path: String,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub genre: Option<String>,
}

/// Partial update for a movie row. Unset fields leave the stored column
/// untouched; a patch cannot null a column.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoviePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub duration: Option<i64>,
    pub file_size: Option<i64>,
    pub rating: Option<String>,
    pub genre: Option<String>,
}

/// Lifecycle of a download job. Transitions only ever move forward;
/// `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            other => bail!("unknown download status {other:?}"),
        }
    }

    /// Whether a stored job in state `self` may move to `next`. Staying in
    /// the same state is always fine (progress ticks while downloading).
    pub fn allows(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (current, candidate) if current == candidate => true,
            (Pending, Downloading | Completed | Failed) => true,
            (Downloading, Completed | Failed) => true,
            _ => false,
        }
    }
}

/// Rows stored in the `downloads` table, polled by the dashboard while a
/// transfer runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub status: DownloadStatus,
    pub progress: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    pub downloaded_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    pub created_at: String,
}

/// Partial update for a download job, produced by the transfer task and
/// applied by the store-updater. Unset fields leave the column untouched.
#[derive(Debug, Clone, Default)]
pub struct DownloadPatch {
    pub status: Option<DownloadStatus>,
    pub progress: Option<i64>,
    pub file_size: Option<i64>,
    pub downloaded_size: Option<i64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Aggregate numbers for the dashboard stats panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryStats {
    pub total_movies: i64,
    pub total_views: i64,
    pub storage_bytes: i64,
    pub active_downloads: i64,
    pub completed_downloads: i64,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS movies (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            file_path TEXT NOT NULL,
            thumbnail_path TEXT,
            duration INTEGER,
            file_size INTEGER,
            views INTEGER NOT NULL DEFAULT 0,
            rating TEXT NOT NULL DEFAULT '0',
            genre TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            filename TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            file_size INTEGER,
            downloaded_size INTEGER NOT NULL DEFAULT 0,
            speed TEXT,
            eta TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_movies_file_path ON movies(file_path);
        CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection that performs write
/// operations. Everything that mutates catalog state goes through here.
#[derive(Debug)]
pub struct CatalogStore {
    conn: Connection,
}

impl CatalogStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a new movie row and returns the stored record. The id, view
    /// counter, rating and timestamp are assigned here.
    pub async fn create_movie(&self, new: NewMovie) -> Result<Movie> {
        let movie = Movie {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            file_path: new.file_path,
            thumbnail_path: new.thumbnail_path,
            duration: new.duration,
            file_size: new.file_size,
            views: 0,
            rating: "0".to_string(),
            genre: new.genre,
            created_at: Utc::now().to_rfc3339(),
        };

        self.conn
            .execute(
                r#"
                INSERT INTO movies (
                    id, title, description, file_path, thumbnail_path,
                    duration, file_size, views, rating, genre, created_at
                ) VALUES (
                    :id, :title, :description, :file_path, :thumbnail_path,
                    :duration, :file_size, :views, :rating, :genre, :created_at
                )
                "#,
                params![
                    movie.id.as_str(),
                    movie.title.as_str(),
                    movie.description.as_deref(),
                    movie.file_path.as_str(),
                    movie.thumbnail_path.as_deref(),
                    movie.duration,
                    movie.file_size,
                    movie.views,
                    movie.rating.as_str(),
                    movie.genre.as_deref(),
                    movie.created_at.as_str(),
                ],
            )
            .await?;

        Ok(movie)
    }

    /// Applies a `MoviePatch` and returns the updated row, or `None` when the
    /// movie does not exist.
    pub async fn update_movie(&self, id: &str, patch: &MoviePatch) -> Result<Option<Movie>> {
        let affected = self
            .conn
            .execute(
                r#"
                UPDATE movies SET
                    title = COALESCE(:title, title),
                    description = COALESCE(:description, description),
                    file_path = COALESCE(:file_path, file_path),
                    thumbnail_path = COALESCE(:thumbnail_path, thumbnail_path),
                    duration = COALESCE(:duration, duration),
                    file_size = COALESCE(:file_size, file_size),
                    rating = COALESCE(:rating, rating),
                    genre = COALESCE(:genre, genre)
                WHERE id = :id
                "#,
                params![
                    patch.title.as_deref(),
                    patch.description.as_deref(),
                    patch.file_path.as_deref(),
                    patch.thumbnail_path.as_deref(),
                    patch.duration,
                    patch.file_size,
                    patch.rating.as_deref(),
                    patch.genre.as_deref(),
                    id,
                ],
            )
            .await?;

        if affected == 0 {
            return Ok(None);
        }
        self.fetch_movie(id).await
    }

    /// Removes a movie row. Never touches the file on disk.
    pub async fn delete_movie(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM movies WHERE id = ?1", params![id])
            .await?;
        Ok(affected > 0)
    }

    /// Bumps the view counter for a movie, returning false when the id is
    /// unknown. Triggered explicitly by clients, never by the streaming route.
    pub async fn increment_views(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE movies SET views = views + 1 WHERE id = ?1",
                params![id],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Inserts a new download job in `pending` with zeroed counters.
    pub async fn create_download(&self, url: &str, filename: &str) -> Result<DownloadJob> {
        let job = DownloadJob {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            filename: filename.to_string(),
            status: DownloadStatus::Pending,
            progress: 0,
            file_size: None,
            downloaded_size: 0,
            speed: None,
            eta: None,
            created_at: Utc::now().to_rfc3339(),
        };

        self.conn
            .execute(
                r#"
                INSERT INTO downloads (
                    id, url, filename, status, progress,
                    file_size, downloaded_size, speed, eta, created_at
                ) VALUES (
                    :id, :url, :filename, :status, :progress,
                    :file_size, :downloaded_size, :speed, :eta, :created_at
                )
                "#,
                params![
                    job.id.as_str(),
                    job.url.as_str(),
                    job.filename.as_str(),
                    job.status.as_str(),
                    job.progress,
                    job.file_size,
                    job.downloaded_size,
                    job.speed.as_deref(),
                    job.eta.as_deref(),
                    job.created_at.as_str(),
                ],
            )
            .await?;

        Ok(job)
    }

    /// Applies a `DownloadPatch` and returns the updated row, or `None` when
    /// the job no longer exists (it may have been deleted mid-transfer).
    ///
    /// Status changes are checked against the forward-only lifecycle; a patch
    /// that would regress or leave a final state is an error.
    pub async fn apply_download_patch(
        &self,
        id: &str,
        patch: &DownloadPatch,
    ) -> Result<Option<DownloadJob>> {
        let Some(current) = self.fetch_download(id).await? else {
            return Ok(None);
        };
        if let Some(next) = patch.status {
            if !current.status.allows(next) {
                bail!(
                    "download {id}: refusing status change {} -> {}",
                    current.status.as_str(),
                    next.as_str()
                );
            }
        }

        self.conn
            .execute(
                r#"
                UPDATE downloads SET
                    status = COALESCE(:status, status),
                    progress = COALESCE(:progress, progress),
                    file_size = COALESCE(:file_size, file_size),
                    downloaded_size = COALESCE(:downloaded_size, downloaded_size),
                    speed = COALESCE(:speed, speed),
                    eta = COALESCE(:eta, eta)
                WHERE id = :id
                "#,
                params![
                    patch.status.map(|status| status.as_str()),
                    patch.progress,
                    patch.file_size,
                    patch.downloaded_size,
                    patch.speed.as_deref(),
                    patch.eta.as_deref(),
                    id,
                ],
            )
            .await?;

        self.fetch_download(id).await
    }

    /// Removes a download job row. The downloaded file and any movie created
    /// from it stay untouched.
    pub async fn delete_download(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM downloads WHERE id = ?1", params![id])
            .await?;
        Ok(affected > 0)
    }

    /// Marks every job still `pending` or `downloading` as `failed`. Run at
    /// backend startup: those jobs belonged to a previous process and their
    /// transfer tasks no longer exist.
    pub async fn fail_orphaned_downloads(&self) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                r#"
                UPDATE downloads
                SET status = 'failed', speed = NULL, eta = NULL
                WHERE status IN ('pending', 'downloading')
                "#,
                params![],
            )
            .await?;
        Ok(affected)
    }

    /// Reconciles the movie directory with the catalog: walks `movies_dir`
    /// recursively, inserts a movie for every video file not yet tracked, and
    /// returns all movies whose backing file was seen during the walk
    /// (pre-existing and newly discovered). Creates the directory if missing.
    pub async fn scan_movie_directory(&self, movies_dir: &Path) -> Result<Vec<Movie>> {
        std::fs::create_dir_all(movies_dir)
            .with_context(|| format!("creating movie directory {}", movies_dir.display()))?;

        let mut discovered = Vec::new();
        for entry in WalkDir::new(movies_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() || !is_video_file(entry.path()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let file_path = entry.path().to_string_lossy().into_owned();

            if let Some(existing) = self.movie_by_path(&file_path).await? {
                discovered.push(existing);
                continue;
            }

            let title = entry
                .path()
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.file_name().to_string_lossy().into_owned());
            let movie = self
                .create_movie(NewMovie {
                    description: Some(format!("Auto-discovered: {title}")),
                    title,
                    file_path,
                    thumbnail_path: None,
                    duration: None,
                    file_size: Some(meta.len() as i64),
                    genre: None,
                })
                .await?;
            discovered.push(movie);
        }

        Ok(discovered)
    }

    async fn fetch_movie(&self, id: &str) -> Result<Option<Movie>> {
        fetch_movie_with(&self.conn, id).await
    }

    async fn movie_by_path(&self, file_path: &str) -> Result<Option<Movie>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, description, file_path, thumbnail_path,
                       duration, file_size, views, rating, genre, created_at
                FROM movies
                WHERE file_path = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([file_path]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_movie(&row)?))
        } else {
            Ok(None)
        }
    }

    async fn fetch_download(&self, id: &str) -> Result<Option<DownloadJob>> {
        fetch_download_with(&self.conn, id).await
    }
}

/// Lightweight cloneable reader for query paths. Handlers that never write
/// hold one of these instead of the store.
#[derive(Clone)]
pub struct CatalogReader {
    conn: Connection,
}

impl CatalogReader {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = Builder::new_local(path.as_ref())
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.as_ref().display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// All movies, newest first.
    pub async fn list_movies(&self) -> Result<Vec<Movie>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, description, file_path, thumbnail_path,
                       duration, file_size, views, rating, genre, created_at
                FROM movies
                ORDER BY created_at DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut movies = Vec::new();
        while let Some(row) = rows.next().await? {
            movies.push(row_to_movie(&row)?);
        }
        Ok(movies)
    }

    pub async fn get_movie(&self, id: &str) -> Result<Option<Movie>> {
        fetch_movie_with(&self.conn, id).await
    }

    /// Most-viewed movies, capped at `limit`.
    pub async fn popular_movies(&self, limit: i64) -> Result<Vec<Movie>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, title, description, file_path, thumbnail_path,
                       duration, file_size, views, rating, genre, created_at
                FROM movies
                ORDER BY views DESC, rowid ASC
                LIMIT ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([limit]).await?;
        let mut movies = Vec::new();
        while let Some(row) = rows.next().await? {
            movies.push(row_to_movie(&row)?);
        }
        Ok(movies)
    }

    /// All download jobs, newest first.
    pub async fn list_downloads(&self) -> Result<Vec<DownloadJob>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, url, filename, status, progress,
                       file_size, downloaded_size, speed, eta, created_at
                FROM downloads
                ORDER BY created_at DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_download(&row)?);
        }
        Ok(jobs)
    }

    pub async fn get_download(&self, id: &str) -> Result<Option<DownloadJob>> {
        fetch_download_with(&self.conn, id).await
    }

    /// Aggregates for the stats panel in two queries.
    pub async fn library_stats(&self) -> Result<LibraryStats> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT COUNT(*), COALESCE(SUM(views), 0), COALESCE(SUM(file_size), 0)
                FROM movies
                "#,
                params![],
            )
            .await?;
        let movie_row = rows.next().await?.context("missing movie totals row")?;

        let mut rows = self
            .conn
            .query(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN status = 'downloading' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)
                FROM downloads
                "#,
                params![],
            )
            .await?;
        let download_row = rows.next().await?.context("missing download totals row")?;

        Ok(LibraryStats {
            total_movies: movie_row.get(0)?,
            total_views: movie_row.get(1)?,
            storage_bytes: movie_row.get(2)?,
            active_downloads: download_row.get(0)?,
            completed_downloads: download_row.get(1)?,
        })
    }
}

async fn fetch_movie_with(conn: &Connection, id: &str) -> Result<Option<Movie>> {
    let stmt = conn
        .prepare(
            r#"
            SELECT id, title, description, file_path, thumbnail_path,
                   duration, file_size, views, rating, genre, created_at
            FROM movies
            WHERE id = ?1
            "#,
        )
        .await?;

    let mut rows = stmt.query([id]).await?;
    if let Some(row) = rows.next().await? {
        Ok(Some(row_to_movie(&row)?))
    } else {
        Ok(None)
    }
}

async fn fetch_download_with(conn: &Connection, id: &str) -> Result<Option<DownloadJob>> {
    let stmt = conn
        .prepare(
            r#"
            SELECT id, url, filename, status, progress,
                   file_size, downloaded_size, speed, eta, created_at
            FROM downloads
            WHERE id = ?1
            "#,
        )
        .await?;

    let mut rows = stmt.query([id]).await?;
    if let Some(row) = rows.next().await? {
        Ok(Some(row_to_download(&row)?))
    } else {
        Ok(None)
    }
}

/// Converts a SQL row into a `Movie`.
fn row_to_movie(row: &Row) -> Result<Movie> {
    // Column order must match the SELECT statements above.
    Ok(Movie {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        file_path: row.get(3)?,
        thumbnail_path: row.get(4)?,
        duration: row.get(5)?,
        file_size: row.get(6)?,
        views: row.get(7)?,
        rating: row.get(8)?,
        genre: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Converts a SQL row into a `DownloadJob`, parsing the status text.
fn row_to_download(row: &Row) -> Result<DownloadJob> {
    let status: String = row.get(3)?;
    Ok(DownloadJob {
        id: row.get(0)?,
        url: row.get(1)?,
        filename: row.get(2)?,
        status: DownloadStatus::parse(&status)?,
        progress: row.get(4)?,
        file_size: row.get(5)?,
        downloaded_size: row.get(6)?,
        speed: row.get(7)?,
        eta: row.get(8)?,
        created_at: row.get(9)?,
    })
}

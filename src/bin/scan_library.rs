#![forbid(unsafe_code)]

//! Helper binary that reconciles the movie directory with the catalog.
//! Useful after copying files onto the box by hand or from a cron job;
//! the backend exposes the same scan over HTTP.

use anyhow::{Context, Result, bail};
use dotbyte_tools::{
    catalog::{CatalogReader, CatalogStore, Movie},
    config::{RuntimeOverrides, resolve_runtime_paths},
    security::ensure_not_root,
};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
struct ScanArgs {
    movies_dir: PathBuf,
    database: PathBuf,
}

impl ScanArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut movies_dir_override: Option<PathBuf> = None;
        let mut database_override: Option<PathBuf> = None;
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

            match arg.as_str() {
                "--movies-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--movies-dir requires a value"))?;
                    movies_dir_override = Some(PathBuf::from(value));
                }
                "--database" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--database requires a value"))?;
                    database_override = Some(PathBuf::from(value));
                }
                _ => {
                    bail!("unknown argument: {arg}");
                }
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            movies_dir: movies_dir_override,
            database: database_override,
            ..RuntimeOverrides::default()
        })?;

        Ok(Self {
            movies_dir: runtime_paths.movies_dir,
            database: runtime_paths.database,
        })
    }
}

/// What a single reconciliation run saw: every tracked file under the root
/// plus the rows that were created for files not in the catalog before.
#[derive(Debug)]
struct ScanOutcome {
    tracked: usize,
    added: Vec<Movie>,
}

async fn run_scan(
    store: &CatalogStore,
    reader: &CatalogReader,
    movies_dir: &Path,
) -> Result<ScanOutcome> {
    let known: HashSet<String> = reader
        .list_movies()
        .await?
        .into_iter()
        .map(|movie| movie.id)
        .collect();

    let discovered = store.scan_movie_directory(movies_dir).await?;
    let tracked = discovered.len();
    let added = discovered
        .into_iter()
        .filter(|movie| !known.contains(&movie.id))
        .collect();

    Ok(ScanOutcome { tracked, added })
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("scan_library")?;

    let ScanArgs {
        movies_dir,
        database,
    } = ScanArgs::parse()?;

    let store = CatalogStore::open(&database)
        .await
        .context("initializing catalog store")?;
    let reader = CatalogReader::new(&database)
        .await
        .context("initializing catalog reader")?;

    println!("Movie library: {}", movies_dir.display());
    println!("Catalog database: {}", database.display());

    let outcome = run_scan(&store, &reader, &movies_dir).await?;

    if outcome.tracked == 0 {
        println!("No video files found under {}.", movies_dir.display());
        return Ok(());
    }

    println!(
        "Tracked {} video file(s) under the library root.",
        outcome.tracked
    );
    if outcome.added.is_empty() {
        println!("Catalog already up to date.");
    } else {
        println!("Added {} new movie(s) to the catalog:", outcome.added.len());
        for movie in &outcome.added {
            println!("  - {}", movie.title);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        f();
        env::set_current_dir(cwd).unwrap();
    }

    #[test]
    fn scan_args_default_paths() {
        let mut parsed = None;
        with_env_file(
            &[
                ("DOTBYTE_MOVIES_DIR", "/films"),
                ("DOTBYTE_DATABASE", "/var/lib/dotbyte.db"),
            ],
            || {
                parsed = Some(ScanArgs::from_slice(&[]).unwrap());
            },
        );
        let args = parsed.unwrap();
        assert_eq!(args.movies_dir, PathBuf::from("/films"));
        assert_eq!(args.database, PathBuf::from("/var/lib/dotbyte.db"));
    }

    #[test]
    fn scan_args_override_paths() {
        let mut parsed = None;
        with_env_file(&[("DOTBYTE_MOVIES_DIR", "/films")], || {
            parsed = Some(
                ScanArgs::from_slice(&["--movies-dir", "/data/movies", "--database=/tmp/cat.db"])
                    .unwrap(),
            );
        });
        let args = parsed.unwrap();
        assert_eq!(args.movies_dir, PathBuf::from("/data/movies"));
        assert_eq!(args.database, PathBuf::from("/tmp/cat.db"));
    }

    #[test]
    fn scan_args_reject_unknown_flag() {
        let mut failed = false;
        with_env_file(&[], || {
            failed = ScanArgs::from_slice(&["--frobnicate"]).is_err();
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn run_scan_adds_files_once() -> Result<()> {
        let temp = tempdir()?;
        let db_path = temp.path().join("catalog.db");
        let media = temp.path().join("movies");
        fs::create_dir_all(media.join("tv-shows"))?;
        fs::write(media.join("First.mp4"), vec![0u8; 512])?;
        fs::write(media.join("tv-shows/Pilot.mkv"), vec![0u8; 256])?;
        fs::write(media.join("notes.txt"), b"not a movie")?;

        let store = CatalogStore::open(&db_path).await?;
        let reader = CatalogReader::new(&db_path).await?;

        let first_run = run_scan(&store, &reader, &media).await?;
        assert_eq!(first_run.tracked, 2);
        assert_eq!(first_run.added.len(), 2);
        let mut titles: Vec<_> = first_run
            .added
            .iter()
            .map(|movie| movie.title.as_str())
            .collect();
        titles.sort_unstable();
        assert_eq!(titles, ["First", "Pilot"]);

        // A second run sees the same files but adds nothing.
        let second_run = run_scan(&store, &reader, &media).await?;
        assert_eq!(second_run.tracked, 2);
        assert!(second_run.added.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn run_scan_skips_rows_created_elsewhere() -> Result<()> {
        let temp = tempdir()?;
        let db_path = temp.path().join("catalog.db");
        let media = temp.path().join("movies");
        fs::create_dir_all(&media)?;
        fs::write(media.join("Existing.mp4"), vec![0u8; 128])?;
        fs::write(media.join("Fresh.mp4"), vec![0u8; 128])?;

        let store = CatalogStore::open(&db_path).await?;
        let reader = CatalogReader::new(&db_path).await?;
        store
            .create_movie(dotbyte_tools::catalog::NewMovie {
                title: "Existing".into(),
                description: None,
                file_path: media.join("Existing.mp4").to_string_lossy().into_owned(),
                thumbnail_path: None,
                duration: None,
                file_size: Some(128),
                genre: None,
            })
            .await?;

        let outcome = run_scan(&store, &reader, &media).await?;
        assert_eq!(outcome.tracked, 2);
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.added[0].title, "Fresh");
        Ok(())
    }
}

#![forbid(unsafe_code)]

//! Runtime configuration for the DotByte binaries.
//!
//! Values are resolved with the precedence explicit override > process
//! environment > `.env` file > built-in default, so a deployment can pin
//! everything in its environment while local runs work with no setup at all.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOTBYTE_PORT: u16 = 5000;
pub const DEFAULT_DOTBYTE_HOST: &str = "127.0.0.1";
pub const DEFAULT_MOVIES_DIR: &str = "movies";
pub const DEFAULT_DATABASE: &str = "dotbyte.db";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub movies_dir: PathBuf,
    pub database: PathBuf,
    pub dotbyte_port: u16,
    pub dotbyte_host: String,
}

/// Flag-level overrides collected by the binaries. Anything left `None`
/// falls through to the process environment, the `.env` file and finally
/// the built-in default.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub movies_dir: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub dotbyte_port: Option<u16>,
    pub dotbyte_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_paths() -> Result<RuntimePaths> {
    resolve_runtime_paths(RuntimeOverrides::default())
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(resolve_from(overrides, &file_vars, process_env))
}

/// Core resolution with the process-environment lookup injected, so tests
/// never have to mutate real environment variables.
fn resolve_from(
    overrides: RuntimeOverrides,
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimePaths {
    let pick = |key: &str| env_lookup(key).or_else(|| file_vars.get(key).cloned());

    let movies_dir = overrides.movies_dir.unwrap_or_else(|| {
        pick("DOTBYTE_MOVIES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOVIES_DIR))
    });
    let database = overrides.database.unwrap_or_else(|| {
        pick("DOTBYTE_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE))
    });
    let dotbyte_port = overrides
        .dotbyte_port
        .or_else(|| pick("DOTBYTE_PORT")?.parse::<u16>().ok())
        .unwrap_or(DEFAULT_DOTBYTE_PORT);
    let dotbyte_host = overrides
        .dotbyte_host
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.trim().to_string())
        .or_else(|| pick("DOTBYTE_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DOTBYTE_HOST.to_string());

    RuntimePaths {
        movies_dir,
        database,
        dotbyte_port,
        dotbyte_host,
    }
}

/// Process-environment lookup; blank values count as unset.
fn process_env(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses a `.env` file into a key/value map. Accepts `KEY=VALUE` lines with
/// an optional `export ` prefix and single or double quotes around the value;
/// comments and lines without `=` are skipped. A missing file is an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }
    Ok(vars)
}

/// Removes one matching pair of surrounding quotes, double or single.
fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    fn resolve_file_only(contents: &str) -> RuntimePaths {
        let file = env_file(contents);
        let vars = read_env_file(file.path()).unwrap();
        resolve_from(RuntimeOverrides::default(), &vars, |_| None)
    }

    #[test]
    fn file_values_resolve() {
        let runtime = resolve_file_only(
            "DOTBYTE_MOVIES_DIR=\"/films\"\nDOTBYTE_DATABASE=\"/var/lib/dotbyte.db\"\nDOTBYTE_PORT=\"4242\"\nDOTBYTE_HOST=\"0.0.0.0\"\n",
        );
        assert_eq!(runtime.movies_dir, PathBuf::from("/films"));
        assert_eq!(runtime.database, PathBuf::from("/var/lib/dotbyte.db"));
        assert_eq!(runtime.dotbyte_port, 4242);
        assert_eq!(runtime.dotbyte_host, "0.0.0.0");
    }

    #[test]
    fn everything_defaults_on_empty_sources() {
        let runtime = resolve_file_only("");
        assert_eq!(runtime.movies_dir, PathBuf::from(DEFAULT_MOVIES_DIR));
        assert_eq!(runtime.database, PathBuf::from(DEFAULT_DATABASE));
        assert_eq!(runtime.dotbyte_port, DEFAULT_DOTBYTE_PORT);
        assert_eq!(runtime.dotbyte_host, DEFAULT_DOTBYTE_HOST);
    }

    #[test]
    fn process_environment_beats_file() {
        let mut vars = HashMap::new();
        vars.insert("DOTBYTE_MOVIES_DIR".to_string(), "/from-file".to_string());
        let runtime = resolve_from(RuntimeOverrides::default(), &vars, |key| {
            (key == "DOTBYTE_MOVIES_DIR").then(|| "/from-env".to_string())
        });
        assert_eq!(runtime.movies_dir, PathBuf::from("/from-env"));
    }

    #[test]
    fn overrides_beat_environment_and_file() {
        let mut vars = HashMap::new();
        vars.insert("DOTBYTE_MOVIES_DIR".to_string(), "/from-file".to_string());
        vars.insert("DOTBYTE_PORT".to_string(), "7000".to_string());
        let runtime = resolve_from(
            RuntimeOverrides {
                movies_dir: Some(PathBuf::from("/flagged")),
                dotbyte_port: Some(9000),
                dotbyte_host: Some("flag-host".into()),
                ..RuntimeOverrides::default()
            },
            &vars,
            |key| (key == "DOTBYTE_DATABASE").then(|| "/env-db".to_string()),
        );
        assert_eq!(runtime.movies_dir, PathBuf::from("/flagged"));
        assert_eq!(runtime.database, PathBuf::from("/env-db"));
        assert_eq!(runtime.dotbyte_port, 9000);
        assert_eq!(runtime.dotbyte_host, "flag-host");
    }

    #[test]
    fn blank_host_override_falls_through_to_file() {
        let mut vars = HashMap::new();
        vars.insert("DOTBYTE_HOST".to_string(), "192.168.1.10".to_string());
        let runtime = resolve_from(
            RuntimeOverrides {
                dotbyte_host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
            &vars,
            |_| None,
        );
        assert_eq!(runtime.dotbyte_host, "192.168.1.10");
    }

    #[test]
    fn unparseable_port_falls_back_to_default() {
        let runtime = resolve_file_only("DOTBYTE_PORT=\"not-a-port\"\n");
        assert_eq!(runtime.dotbyte_port, DEFAULT_DOTBYTE_PORT);
    }

    #[test]
    fn env_file_parser_accepts_exports_quotes_and_comments() {
        let file = env_file(
            r#"
            export DOTBYTE_MOVIES_DIR="/media/movies"
            DOTBYTE_DATABASE='/srv/dotbyte.db'
            DOTBYTE_HOST =  "0.0.0.0"
            DOTBYTE_PORT=9090
            # comment
            NO_EQUALS_SIGN
            "#,
        );
        let vars = read_env_file(file.path()).unwrap();
        assert_eq!(vars.get("DOTBYTE_MOVIES_DIR").unwrap(), "/media/movies");
        assert_eq!(vars.get("DOTBYTE_DATABASE").unwrap(), "/srv/dotbyte.db");
        assert_eq!(vars.get("DOTBYTE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("DOTBYTE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("NO_EQUALS_SIGN"));
    }

    #[test]
    fn env_file_parser_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("absent.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn strip_quotes_requires_matching_pair() {
        assert_eq!(strip_quotes("\"quoted\""), "quoted");
        assert_eq!(strip_quotes("'quoted'"), "quoted");
        assert_eq!(strip_quotes("\"mismatched'"), "\"mismatched'");
        assert_eq!(strip_quotes("plain"), "plain");
    }
}

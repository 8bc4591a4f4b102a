//! Persistent settings and the foreign runtime configuration derived from them.
//!
//! [`Config`] is a key-value store backed by SQLite. [`EngineConfig`] is what
//! the Julia runtime needs to start; it is resolved from the environment first,
//! then the store, then built-in defaults.

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::consts::DEFAULT_JULIA;

pub const KEY_EXECUTABLE: &str = "julia.executable";
pub const KEY_PROJECT: &str = "julia.project";
pub const KEY_THREADS: &str = "julia.threads";

pub const ENV_EXECUTABLE: &str = "IESOPT_JULIA";
pub const ENV_PROJECT: &str = "IESOPT_JULIA_PROJECT";
pub const ENV_THREADS: &str = "IESOPT_JULIA_THREADS";

/// Persistent key-value configuration store.
pub struct Config {
    conn: Mutex<Connection>,
}

impl Config {
    /// Open or create the config table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path).context("failed to open config database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create config table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("config database lock poisoned"))
    }

    /// Get a config value by key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a config value (upsert).
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a config key.
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(())
    }

    /// All entries, ordered by key.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key ASC")?;
        let entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// How to start the Julia process hosting the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub executable: PathBuf,
    /// Julia project (environment) to activate; must provide IESopt and JSON.
    pub project: Option<PathBuf>,
    pub threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_JULIA),
            project: None,
            threads: None,
        }
    }
}

impl EngineConfig {
    /// Resolve from the process environment and the given store.
    pub fn load(store: &Config) -> Result<Self> {
        Self::resolve(Some(store), |key| std::env::var(key).ok())
    }

    /// Resolve from the process environment only.
    pub fn from_env() -> Result<Self> {
        Self::resolve(None, |key| std::env::var(key).ok())
    }

    /// Resolve with `env` taking precedence over `store`.
    pub fn resolve(store: Option<&Config>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |env_key: &str, store_key: &str| -> Result<Option<String>> {
            if let Some(value) = env(env_key).filter(|v| !v.is_empty()) {
                return Ok(Some(value));
            }
            match store {
                Some(store) => store.get(store_key),
                None => Ok(None),
            }
        };

        let mut config = Self::default();
        if let Some(executable) = lookup(ENV_EXECUTABLE, KEY_EXECUTABLE)? {
            config.executable = PathBuf::from(executable);
        }
        config.project = lookup(ENV_PROJECT, KEY_PROJECT)?.map(PathBuf::from);
        if let Some(threads) = lookup(ENV_THREADS, KEY_THREADS)? {
            let threads: usize = threads
                .trim()
                .parse()
                .with_context(|| format!("invalid julia thread count `{threads}`"))?;
            if threads == 0 {
                anyhow::bail!("julia thread count must be at least 1");
            }
            config.threads = Some(threads);
        }
        Ok(config)
    }
}

//! Typed settings loaded from `.env` / environment variables

use std::env;
use std::time::Duration;

use crate::error::{Result, ServerError};

/// Number of worker threads draining the request queue.
///
/// Static by design: the worker pool never scales at runtime.
pub const WORKER_COUNT: usize = 75;

/// Address the server endpoint binds to. Fixed; `--listen` on the
/// binary exists only for local runs and tests.
pub const LISTEN_ADDR: &str = "0.0.0.0:5555";

/// Database and queue settings.
///
/// All `DB_*` keys are required; a missing or unparsable key fails the
/// load (startup-fatal; there is no sensible degraded mode without a
/// reachable database).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_host: String,
    pub db_username: String,
    pub db_password: String,
    pub db_database_name: String,
    pub db_pool_size: usize,
    pub db_heartbeat_interval: u64,
    /// Optional request-queue bound; `None` keeps the historical
    /// unbounded queue.
    pub queue_capacity: Option<usize>,
}

impl AppConfig {
    /// Load settings, reading a `.env` file from the working directory
    /// first (ignored if absent) and the process environment second.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load settings from an explicit `.env` file path.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        dotenvy::from_path(path)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_env()
    }

    fn from_env() -> Result<Self> {
        Ok(Self {
            db_host: required("DB_HOST")?,
            db_username: required("DB_USERNAME")?,
            db_password: required("DB_PASSWORD")?,
            db_database_name: required("DB_DATABASE_NAME")?,
            db_pool_size: parsed("DB_POOL_SIZE")?,
            db_heartbeat_interval: parsed("DB_HEARTBEAT_INTERVAL")?,
            queue_capacity: optional_capacity("QUEUE_CAPACITY")?,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.db_heartbeat_interval)
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| ServerError::Config(format!("missing {}", key)))
}

fn parsed<T: std::str::FromStr>(key: &str) -> Result<T> {
    required(key)?
        .parse()
        .map_err(|_| ServerError::Config(format!("invalid {}", key)))
}

/// `QUEUE_CAPACITY` unset or `0` means unbounded.
fn optional_capacity(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => {
            let n: usize = raw
                .parse()
                .map_err(|_| ServerError::Config(format!("invalid {}", key)))?;
            Ok(if n == 0 { None } else { Some(n) })
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    // Env mutation is process-global; keep every test behind one lock.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const KEYS: &[&str] = &[
        "DB_HOST",
        "DB_USERNAME",
        "DB_PASSWORD",
        "DB_DATABASE_NAME",
        "DB_POOL_SIZE",
        "DB_HEARTBEAT_INTERVAL",
        "QUEUE_CAPACITY",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    fn set_minimal_env() {
        env::set_var("DB_HOST", "db:5432");
        env::set_var("DB_USERNAME", "app");
        env::set_var("DB_PASSWORD", "secret");
        env::set_var("DB_DATABASE_NAME", "testdb");
        env::set_var("DB_POOL_SIZE", "25");
        env::set_var("DB_HEARTBEAT_INTERVAL", "60");
    }

    #[test]
    fn test_load_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_minimal_env();

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.db_host, "db:5432");
        assert_eq!(config.db_pool_size, 25);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.queue_capacity, None);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_minimal_env();
        env::remove_var("DB_PASSWORD");

        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DB_PASSWORD"));
    }

    #[test]
    fn test_invalid_int_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_minimal_env();
        env::set_var("DB_POOL_SIZE", "many");

        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DB_POOL_SIZE"));
    }

    #[test]
    fn test_queue_capacity_zero_means_unbounded() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        set_minimal_env();
        env::set_var("QUEUE_CAPACITY", "0");
        assert_eq!(AppConfig::from_env().unwrap().queue_capacity, None);

        env::set_var("QUEUE_CAPACITY", "1024");
        assert_eq!(AppConfig::from_env().unwrap().queue_capacity, Some(1024));
    }

    #[test]
    fn test_load_from_dotenv_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "DB_HOST=localhost").unwrap();
        writeln!(file, "DB_USERNAME=root").unwrap();
        writeln!(file, "DB_PASSWORD=password").unwrap();
        writeln!(file, "DB_DATABASE_NAME=testdb").unwrap();
        writeln!(file, "DB_POOL_SIZE=75").unwrap();
        writeln!(file, "DB_HEARTBEAT_INTERVAL=60").unwrap();

        let config = AppConfig::from_path(&path).unwrap();
        assert_eq!(config.db_username, "root");
        assert_eq!(config.db_pool_size, 75);
    }
}

//! Configuration management for the tus server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// `DATABASE_URL` value selecting the in-memory session store
pub const MEMORY_STORE: &str = "memory";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL, used to build `Location`
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// 0 disables the ceiling
    pub max_size: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                public_url: "http://localhost:3000".to_string(),
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("./uploads"),
            },
            database: DatabaseConfig {
                url: MEMORY_STORE.to_string(),
            },
            upload: UploadConfig {
                max_size: 0,
                cleanup_interval_secs: 300,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: var_or("SERVER_HOST", defaults.server.host)?,
                port: parse_or("SERVER_PORT", defaults.server.port)?,
                public_url: var_or("PUBLIC_URL", defaults.server.public_url)?,
            },
            storage: StorageConfig {
                upload_dir: var_or(
                    "UPLOAD_DIR",
                    defaults.storage.upload_dir.to_string_lossy().into_owned(),
                )?
                .into(),
            },
            database: DatabaseConfig {
                url: var_or("DATABASE_URL", defaults.database.url)?,
            },
            upload: UploadConfig {
                max_size: parse_or("TUS_MAX_SIZE", defaults.upload.max_size)?,
                cleanup_interval_secs: parse_or(
                    "CLEANUP_INTERVAL_SECS",
                    defaults.upload.cleanup_interval_secs,
                )?,
            },
        })
    }

    /// Whether sessions live in memory rather than SQLite
    pub fn uses_memory_store(&self) -> bool {
        self.database.url == MEMORY_STORE
    }

    /// Absolute URL of the upload collection
    pub fn uploads_url(&self) -> String {
        format!("{}/files", self.server.public_url.trim_end_matches('/'))
    }
}

fn var_or(name: &str, default: String) -> Result<String, env::VarError> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e),
    }
}

fn parse_or<T>(name: &str, default: T) -> Result<T, env::VarError>
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => Ok(value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {}={:?}, using {}", name, value, default);
            default
        })),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e),
    }
}

use std::{env, str::FromStr};

use crate::errors::AppError;

const MIN_SESSION_KEY_LEN: usize = 64;

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,
    pub session_key: Vec<u8>,
    pub cookie_secure: bool,
    pub hash_memory_kib: u32,
    pub hash_iterations: u32,
    pub hash_parallelism: u32,
    pub partition_base_url: String,
    pub partition_key: String,
    pub recent_projects_limit: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        let session_key = env::var("SESSION_KEY").map_err(|_| {
            AppError::Config("SESSION_KEY environment variable not set".to_owned())
        })?;
        if session_key.len() < MIN_SESSION_KEY_LEN {
            return Err(AppError::Config(format!(
                "SESSION_KEY must be at least {MIN_SESSION_KEY_LEN} bytes"
            )));
        }

        Ok(Self {
            database_url: var_or("DATABASE_URL", "sqlite://bidhub.db".to_owned())?,
            bind_addr: var_or("BIND_ADDR", "0.0.0.0".to_owned())?,
            port: var_or("PORT", 8080)?,
            session_key: session_key.into_bytes(),
            cookie_secure: var_or("COOKIE_SECURE", true)?,
            hash_memory_kib: var_or("HASH_MEMORY_KIB", 19_456)?,
            hash_iterations: var_or("HASH_ITERATIONS", 2)?,
            hash_parallelism: var_or("HASH_PARALLELISM", 1)?,
            partition_base_url: var_or("PARTITION_BASE_URL", "sqlite://partitions".to_owned())?,
            partition_key: var_or("PARTITION_KEY", String::new())?,
            recent_projects_limit: var_or("RECENT_PROJECTS_LIMIT", 10)?,
        })
    }
}

/// Reads `key` from the environment, falling back to `default` when unset.
fn var_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("invalid value for {key}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(AppError::Config(format!("{key}: {e}"))),
    }
}

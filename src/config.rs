//! Configuration management for the sync server

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Tunables for the sync engine
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum rows returned per entity type in a single pull
    pub pull_page_size: u32,
    /// Sessions idle for longer than this are pruned by housekeeping
    pub session_retention_days: i64,
    /// Seconds between housekeeping passes
    pub housekeeping_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            pull_page_size: 500,
            session_retention_days: 30,
            housekeeping_interval_secs: 3600,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./sync.db".to_string(),
                max_connections: 5,
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = SyncConfig::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            },
            sync: SyncConfig {
                pull_page_size: env::var("SYNC_PULL_PAGE_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|size| *size > 0)
                    .unwrap_or(defaults.pull_page_size),
                session_retention_days: env::var("SYNC_SESSION_RETENTION_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.session_retention_days),
                housekeeping_interval_secs: env::var("SYNC_HOUSEKEEPING_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.housekeeping_interval_secs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sync_settings() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.sync.pull_page_size, 500);
        assert_eq!(config.sync.session_retention_days, 30);
    }
}

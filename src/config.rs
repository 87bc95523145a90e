use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub caldav: CalDavConfig,
    pub sync_retry: SyncRetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalDavConfig {
    /// Per-request timeout for PUT/DELETE calls. Clamped to 10..=30 seconds.
    pub request_timeout_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncRetryConfig {
    /// Whether the periodic retry sweep runs at all. Manual retries work regardless.
    pub enabled: bool,
    /// How often (seconds) the sweep looks for retryable rows.
    pub poll_interval_seconds: u64,
    /// Rows whose `retry_count` reached this value are left `failed` for good.
    pub max_retries: u32,
    /// Minimum wait after an attempt before the row is eligible again; doubled per prior attempt.
    pub backoff_floor_seconds: u64,
    /// Cap for the exponential backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Maximum rows handled by one sweep.
    pub batch_size: u32,
    /// Days a `removed` row is kept for audit before the worker purges it. 0 keeps them forever.
    pub removed_retention_days: u32,
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => true,
        "0" | "false" | "no" => false,
        _ => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let request_timeout_seconds: u64 = env::var("CALDAV_REQUEST_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("CALDAV_REQUEST_TIMEOUT_SECONDS".to_string()))?;

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/calendar_sync.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            caldav: CalDavConfig {
                request_timeout_seconds: request_timeout_seconds.clamp(10, 30),
                user_agent: env::var("CALDAV_USER_AGENT")
                    .unwrap_or_else(|_| format!("meal-calendar-sync/{}", env!("CARGO_PKG_VERSION"))),
            },
            sync_retry: SyncRetryConfig {
                enabled: env::var("SYNC_RETRY_ENABLED")
                    .map(|v| parse_bool(&v, true))
                    .unwrap_or(true),
                poll_interval_seconds: env::var("SYNC_RETRY_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300u64),
                max_retries: env::var("SYNC_RETRY_MAX_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3u32),
                backoff_floor_seconds: env::var("SYNC_RETRY_BACKOFF_FLOOR_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60u64),
                max_backoff_seconds: env::var("SYNC_RETRY_MAX_BACKOFF_SECONDS")
                    .unwrap_or_else(|_| "21600".to_string())
                    .parse()
                    .unwrap_or(21600u64),
                batch_size: env::var("SYNC_RETRY_BATCH_SIZE")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()
                    .unwrap_or(100u32),
                removed_retention_days: env::var("SYNC_REMOVED_RETENTION_DAYS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30u32),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/calendar_sync.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            caldav: CalDavConfig {
                request_timeout_seconds: 20,
                user_agent: format!("meal-calendar-sync/{}", env!("CARGO_PKG_VERSION")),
            },
            sync_retry: SyncRetryConfig {
                enabled: true,
                poll_interval_seconds: 300,
                max_retries: 3,
                backoff_floor_seconds: 60,
                max_backoff_seconds: 21600,
                batch_size: 100,
                removed_retention_days: 30,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("YES", false));
        assert!(parse_bool("1", false));
        assert!(!parse_bool("false", true));
        assert!(!parse_bool("no", true));
        // Unknown values fall back to the default
        assert!(parse_bool("maybe", true));
        assert!(!parse_bool("maybe", false));
    }

    #[test]
    fn default_retry_policy_is_bounded() {
        let cfg = Config::default();
        assert_eq!(cfg.sync_retry.max_retries, 3);
        assert!(cfg.sync_retry.backoff_floor_seconds <= cfg.sync_retry.max_backoff_seconds);
        assert!((10..=30).contains(&cfg.caldav.request_timeout_seconds));
    }
}

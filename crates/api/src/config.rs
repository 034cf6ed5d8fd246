use fleetwatch_core::device::{
    DEFAULT_KEEPALIVE_SECS, DEFAULT_RETENTION_HOURS, DEFAULT_STORE_TIMEOUT_SECS,
};

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `9521`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    /// Empty by default: devices and scrapers are not browsers.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Grace period for device sessions to drain on shutdown (default: `5`).
    pub shutdown_timeout_secs: u64,
    /// Read deadline for device connections, refreshed by every ping (default: `30`).
    pub keepalive_secs: u64,
    /// Upper bound on a single store call (default: `5`).
    pub store_timeout_secs: u64,
    /// Telemetry older than this is purged by the retention job (default: `72`).
    pub retention_hours: i64,
    /// `job` label on exported gauges (default: `fleetwatch`).
    pub metrics_job_name: String,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                    |
    /// |-----------------------------|----------------------------|
    /// | `HOST`                      | `0.0.0.0`                  |
    /// | `PORT`                      | `9521`                     |
    /// | `CORS_ORIGINS`              | (none)                     |
    /// | `REQUEST_TIMEOUT_SECS`      | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`     | `5`                        |
    /// | `KEEPALIVE_SECS`            | `30`                       |
    /// | `STORE_TIMEOUT_SECS`        | `5`                        |
    /// | `TELEMETRY_RETENTION_HOURS` | `72`                       |
    /// | `METRICS_JOB_NAME`          | `fleetwatch`               |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "9521".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins = std::env::var("CORS_ORIGINS")
            .map(|v| parse_origins(&v))
            .unwrap_or_default();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let keepalive_secs: u64 = std::env::var("KEEPALIVE_SECS")
            .map(|v| v.parse().expect("KEEPALIVE_SECS must be a valid u64"))
            .unwrap_or(DEFAULT_KEEPALIVE_SECS);

        let store_timeout_secs: u64 = std::env::var("STORE_TIMEOUT_SECS")
            .map(|v| v.parse().expect("STORE_TIMEOUT_SECS must be a valid u64"))
            .unwrap_or(DEFAULT_STORE_TIMEOUT_SECS);

        let retention_hours: i64 = std::env::var("TELEMETRY_RETENTION_HOURS")
            .map(|v| v.parse().expect("TELEMETRY_RETENTION_HOURS must be a valid i64"))
            .unwrap_or(DEFAULT_RETENTION_HOURS);

        let metrics_job_name =
            std::env::var("METRICS_JOB_NAME").unwrap_or_else(|_| "fleetwatch".into());

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            keepalive_secs,
            store_timeout_secs,
            retention_hours,
            metrics_job_name,
        }
    }
}

/// Split a comma-separated origin list, dropping blanks.
fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `DATABASE_URL` (required).
    pub url: String,
    /// `DATABASE_NAME`, overriding the database named in the URL.
    pub name: Option<String>,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let name = std::env::var("DATABASE_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty());
        Self { url, name }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Log sink settings.
///
/// `RUST_LOG` takes precedence over `LOG_LEVEL` when set.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `LOG_LEVEL` (default: `info`).
    pub level: String,
    /// `LOG_FORMAT`: `pretty` (default) or `json`.
    pub format: LogFormat,
    /// `LOG_FILE`: when set, logs are also appended here as JSON lines.
    pub file: Option<String>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());

        let format = match std::env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => panic!("LOG_FORMAT must be 'pretty' or 'json', got '{other}'"),
        };

        let file = std::env::var("LOG_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            level,
            format,
            file,
        }
    }
}

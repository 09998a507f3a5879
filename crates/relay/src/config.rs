// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own sizing variables (see
// `db::pool::PoolConfig`).

use std::{net::SocketAddr, time::Duration};

use crate::storage::{StorageConfig, DEFAULT_MIN_SNAPSHOT_BYTES};

const DEV_JWT_SECRET: &str = "tandem_local_development_jwt_secret_must_be_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the token issuer.
    pub jwt_secret: String,
    /// PostgreSQL connection string. Without it the relay runs on in-memory
    /// backends.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `tandem_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Debounce window between snapshot saves of a dirty session.
    pub persist_interval: Duration,
    /// Deadline for every storage backend call.
    pub storage_timeout: Duration,
    /// Snapshots shorter than this are never written.
    pub min_snapshot_bytes: usize,
    /// Age after which a cached role is re-resolved before a mutation.
    pub role_revalidate_after: Duration,
    /// How long a fresh socket may take to send its `join` frame.
    pub join_timeout: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_RELAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_RELAY_PORT` | `8080` |
    /// | `TANDEM_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `TANDEM_RELAY_DATABASE_URL` | *(none)* |
    /// | `TANDEM_RELAY_LOG_FILTER` | `info` |
    /// | `TANDEM_RELAY_LOG_FORMAT` | `text` |
    /// | `TANDEM_RELAY_PERSIST_INTERVAL_MS` | `2000` |
    /// | `TANDEM_RELAY_STORAGE_TIMEOUT_MS` | `5000` |
    /// | `TANDEM_RELAY_MIN_SNAPSHOT_BYTES` | `20` |
    /// | `TANDEM_RELAY_ROLE_REVALIDATE_SECS` | `30` |
    /// | `TANDEM_RELAY_JOIN_TIMEOUT_MS` | `10000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "TANDEM_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("TANDEM_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("TANDEM_RELAY_DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        let log_filter = env("TANDEM_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TANDEM_RELAY_LOG_FORMAT") {
            Ok(value) if value.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            log_filter,
            log_format,
            persist_interval: Duration::from_millis(parse_or(
                &env,
                "TANDEM_RELAY_PERSIST_INTERVAL_MS",
                2_000,
            )),
            storage_timeout: Duration::from_millis(parse_or(
                &env,
                "TANDEM_RELAY_STORAGE_TIMEOUT_MS",
                5_000,
            )),
            min_snapshot_bytes: parse_or(
                &env,
                "TANDEM_RELAY_MIN_SNAPSHOT_BYTES",
                DEFAULT_MIN_SNAPSHOT_BYTES,
            ),
            role_revalidate_after: Duration::from_secs(parse_or(
                &env,
                "TANDEM_RELAY_ROLE_REVALIDATE_SECS",
                30,
            )),
            join_timeout: Duration::from_millis(parse_or(&env, "TANDEM_RELAY_JOIN_TIMEOUT_MS", 10_000)),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig { min_snapshot_bytes: self.min_snapshot_bytes, timeout: self.storage_timeout }
    }
}

/// Unparsable and zero values are treated as unset.
fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialEq + Default,
{
    env(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value != T::default())
        .unwrap_or(default)
}

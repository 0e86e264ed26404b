use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3040)
    pub port: u16,
    /// Database file path (default: ./notewire.db)
    pub database_path: PathBuf,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Quiet period before a document's pending edits are persisted
    /// (default: 2s)
    pub save_debounce: Duration,
    /// Backoff before the single persistence retry (default: 5s)
    pub save_retry_backoff: Duration,
    /// Operation-log length that triggers compaction (default: 1000)
    pub compaction_threshold: usize,
    /// Max time a normal/low-priority broadcast may wait in the
    /// batcher (default: 50ms)
    pub batch_max_wait: Duration,
    /// Max queued messages per room before an early flush (default: 50)
    pub batch_max_size: usize,
    /// Idle time before an unused document is evicted from memory
    /// (default: 300s)
    pub doc_idle_timeout: Duration,
    /// Interval of the idle-document sweep task (default: 60s)
    pub sweep_interval: Duration,
    /// Consecutive malformed frames tolerated before the connection is
    /// closed (default: 5)
    pub protocol_strike_limit: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3040".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path =
            PathBuf::from(env::var("DATABASE_PATH").unwrap_or_else(|_| "./notewire.db".to_string()));

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            database_path,
            cors_origins,
            save_debounce: Duration::from_millis(env_u64("SAVE_DEBOUNCE_MS", 2000)),
            save_retry_backoff: Duration::from_millis(env_u64("SAVE_RETRY_BACKOFF_MS", 5000)),
            compaction_threshold: env_u64("COMPACTION_THRESHOLD", 1000) as usize,
            batch_max_wait: Duration::from_millis(env_u64("BATCH_MAX_WAIT_MS", 50)),
            batch_max_size: env_u64("BATCH_MAX_SIZE", 50) as usize,
            doc_idle_timeout: Duration::from_secs(env_u64("DOC_IDLE_TIMEOUT_SECS", 300)),
            sweep_interval: Duration::from_secs(env_u64("SWEEP_INTERVAL_SECS", 60)),
            protocol_strike_limit: env_u64("PROTOCOL_STRIKE_LIMIT", 5) as u32,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}

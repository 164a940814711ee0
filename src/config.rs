//! Runtime settings, read once at startup from the environment.
//!
//! Every tunable the pipeline depends on lives here so nothing is hard-coded
//! at call sites: the poll cadence, the transient-retry ceiling, and the dose
//! variance threshold are deployment decisions, not code.

use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "BioVault";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    "info,biovault=debug".to_string()
}

/// Get the application data directory (~/BioVault/ unless DATA_DIR overrides).
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join("BioVault")
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Directory where uploaded document bytes are stored.
    pub upload_dir: PathBuf,
    /// HTTP bind address.
    pub bind_addr: String,
    /// Agent polling cadence.
    pub poll_interval: Duration,
    /// Transient-failure retry ceiling per document.
    pub max_stage_attempts: i64,
    /// Relative dose variance that raises a CRITICAL flag (0.10 = 10%).
    pub dose_variance_threshold: f64,
    /// Outbound alert webhook. Empty disables delivery.
    pub webhook_url: Option<String>,
    /// Vision extraction service.
    pub extraction_base_url: String,
    pub extraction_api_key: String,
    pub extraction_model: String,
    /// Text standardization service.
    pub standardization_base_url: String,
    pub standardization_api_key: String,
    pub standardization_model: String,
    /// Bounded timeout for a single adapter call.
    pub adapter_timeout: Duration,
}

impl Settings {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let data_dir = app_data_dir();
        Self {
            db_path: env_var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("biovault.db")),
            upload_dir: env_var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("uploads")),
            bind_addr: env_var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECONDS", 30)),
            max_stage_attempts: env_parse("MAX_STAGE_ATTEMPTS", 3),
            dose_variance_threshold: env_parse("DOSE_VARIANCE_THRESHOLD", 0.10),
            webhook_url: env_var("WEBHOOK_URL").filter(|v| !v.is_empty()),
            extraction_base_url: env_var("EXTRACTION_BASE_URL")
                .unwrap_or_else(|| "https://api.minimax.io/v1".to_string()),
            extraction_api_key: env_var("EXTRACTION_API_KEY").unwrap_or_default(),
            extraction_model: env_var("EXTRACTION_MODEL")
                .unwrap_or_else(|| "MiniMax-Text-01".to_string()),
            standardization_base_url: env_var("STANDARDIZATION_BASE_URL")
                .unwrap_or_else(|| "https://api.akashml.com/v1".to_string()),
            standardization_api_key: env_var("STANDARDIZATION_API_KEY").unwrap_or_default(),
            standardization_model: env_var("STANDARDIZATION_MODEL")
                .unwrap_or_else(|| "MiniMaxAI/MiniMax-M2.5".to_string()),
            adapter_timeout: Duration::from_secs(env_parse("ADAPTER_TIMEOUT_SECONDS", 60)),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

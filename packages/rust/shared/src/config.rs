//! Application configuration for Licitai.
//!
//! User config lives at `~/.licitai/licitai.toml`.
//! CLI flags override config file values, which override defaults.
//! API keys are never stored here; each provider section names the
//! environment variable that holds its key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LicitaiError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "licitai.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".licitai";

/// Brazilian federative units, the default collection regions.
pub const ALL_REGIONS: [&str; 27] = [
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB", "PR",
    "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

// ---------------------------------------------------------------------------
// Config structs (matching licitai.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pncp: PncpConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub reporter: ReporterConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. A leading `~/` expands to the home directory.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.licitai/licitai.db".into()
}

/// `[pncp]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PncpConfig {
    #[serde(default = "default_pncp_base_url")]
    pub base_url: String,

    /// Items requested per page (`tamanhoPagina`).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request timeout.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for PncpConfig {
    fn default() -> Self {
        Self {
            base_url: default_pncp_base_url(),
            page_size: default_page_size(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_pncp_base_url() -> String {
    "https://pncp.gov.br/pncp-consulta".into()
}
fn default_page_size() -> u32 {
    50
}
fn default_http_timeout() -> u64 {
    30
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay doubles after each failed attempt.
    Exponential,
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay(),
            backoff: Backoff::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1000
}

/// `[collector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// UF codes to iterate.
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,

    /// `codigoModalidadeContratacao` values to iterate.
    #[serde(default = "default_modalities")]
    pub modalities: Vec<u32>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            modalities: default_modalities(),
        }
    }
}

fn default_regions() -> Vec<String> {
    ALL_REGIONS.iter().map(|r| (*r).to_string()).collect()
}
fn default_modalities() -> Vec<u32> {
    vec![1, 7]
}

/// `[generator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Upper bound on tasks written per transaction.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
        }
    }
}

fn default_max_batch() -> usize {
    499
}

/// `[workers]` section, shared by every stage worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Tasks claimed per cycle, also the per-cycle concurrency bound.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum orphaned tasks reset per cycle.
    #[serde(default = "default_reclaim_limit")]
    pub reclaim_limit: usize,

    /// Sleep when the source queue is empty.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,

    /// Sleep between cycles that found work.
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,

    /// Sleep after a cycle-level failure (store unreachable, etc.).
    #[serde(default = "default_idle_secs")]
    pub error_backoff_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            reclaim_limit: default_reclaim_limit(),
            idle_secs: default_idle_secs(),
            cycle_secs: default_cycle_secs(),
            error_backoff_secs: default_idle_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_reclaim_limit() -> usize {
    10
}
fn default_idle_secs() -> u64 {
    60
}
fn default_cycle_secs() -> u64 {
    5
}

/// `[classifier]` section (Gemini generateContent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Name of the env var holding the API key.
    #[serde(default = "default_classifier_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_classifier_model")]
    pub model: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_classifier_key_env(),
            endpoint: default_classifier_endpoint(),
            model: default_classifier_model(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_classifier_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_classifier_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}
fn default_classifier_model() -> String {
    "gemini-1.5-flash".into()
}

/// `[search]` section (Serper web search).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Name of the env var holding the API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Hits requested per query.
    #[serde(default = "default_results_per_query")]
    pub results_per_query: u32,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            endpoint: default_search_endpoint(),
            results_per_query: default_results_per_query(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_search_key_env() -> String {
    "SERPER_API_KEY".into()
}
fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".into()
}
fn default_results_per_query() -> u32 {
    5
}

/// `[reporter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "resultados".into()
}

// ---------------------------------------------------------------------------
// Retry policy (runtime, derived from [retry])
// ---------------------------------------------------------------------------

/// Attempt budget and delay schedule for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
            backoff: config.backoff,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.licitai/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LicitaiError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.licitai/licitai.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LicitaiError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LicitaiError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LicitaiError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LicitaiError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LicitaiError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| LicitaiError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read an API key from the named env var. Fails fast when unset or empty.
pub fn resolve_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(LicitaiError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

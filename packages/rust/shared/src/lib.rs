//! Shared types, error model, and configuration for Licitai.
//!
//! This crate is the foundation depended on by all other Licitai crates.
//! It provides:
//! - [`LicitaiError`], the unified error type
//! - Domain types ([`ProcurementRecord`], [`SearchDefinition`], [`Task`], [`TaskStatus`])
//! - Configuration ([`AppConfig`], [`RetryPolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ALL_REGIONS, AppConfig, Backoff, ClassifierConfig, CollectorConfig, GeneratorConfig,
    PncpConfig, ReporterConfig, RetryConfig, RetryPolicy, SearchConfig, StoreConfig,
    WorkersConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{LicitaiError, Result};
pub use types::{
    AnalysisResult, Contact, ProcurementRecord, SearchDefinition, Stage, StageOutput, Task, TaskId,
    TaskStatus,
};

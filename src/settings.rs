use std::path::Path;

use anyhow::{Context, Result};
use flowrun_executor::ExecutorConfig;
use flowrun_queue::QueueConfig;
use flowrun_registry::RegistryConfig;
use flowrun_worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  #[default]
  Pretty,
  Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  pub level: String,
  pub format: LogFormat,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      format: LogFormat::Pretty,
    }
  }
}

/// Everything a flowrun process can be configured with, read from the JSON
/// file given with `--config`. Missing sections keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub queue: QueueConfig,
  pub registry: RegistryConfig,
  pub executor: ExecutorConfig,
  pub worker: WorkerConfig,
  pub logging: LoggingConfig,
}

impl Settings {
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let Some(path) = path else {
      return Ok(Self::default());
    };

    let content = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
      .with_context(|| format!("failed to parse config file: {}", path.display()))
  }

  /// Install the log subscriber. `RUST_LOG` wins over the configured level.
  pub fn init_logging(&self, verbose: bool) -> Result<()> {
    let level = if verbose {
      "debug"
    } else {
      self.logging.level.as_str()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr);

    match self.logging.format {
      LogFormat::Pretty => builder.with_target(false).try_init(),
      LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
  }
}

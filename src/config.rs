//! TOML configuration for the shard worker.
//!
//! Layered model: compiled-in defaults, then an optional TOML file, then a
//! small set of environment overrides that deployment tooling commonly sets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SHARDRUNNER_CONFIG";

/// Standard system location checked when no explicit path is given.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/shardrunner/shardrunner.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded worker configuration");
        Ok(config)
    }

    /// Resolve the configuration the binary should run with.
    ///
    /// An explicit path must load; otherwise `SHARDRUNNER_CONFIG`, then the
    /// system path, then defaults. Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        // Pin the generated ID so every component sees the same one.
        if config.worker.id.is_none() {
            config.worker.id = Some(generate_worker_id());
        }
        Ok(config)
    }

    /// Try the env-var path, then the system path, then fall back to defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SHARDRUNNER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("WORKER_ID").filter(|v| !v.is_empty()) {
            self.worker.id = Some(id);
        }
        if let Some(url) = lookup("RESULTS_SERVICE_URL") {
            self.collector.base_url = url;
        }
        if let Some(addr) = lookup("RESULTS_STREAM_ADDR") {
            self.collector.stream_addr = Some(addr);
        }
        if let Some(url) = lookup("ARTIFACT_SERVICE_URL") {
            self.collector.artifact_url = Some(url);
        }
        if let Some(key) = lookup("SHARDRUNNER_API_KEY") {
            self.collector.api_key = Some(key);
        }
        if let Some(raw) = lookup("SHARDRUNNER_BATCH_SIZE") {
            self.worker.batch_size = raw
                .parse()
                .with_context(|| format!("invalid SHARDRUNNER_BATCH_SIZE: {raw}"))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.worker.batch_size == 0 {
            anyhow::bail!("worker.batch_size must be at least 1");
        }
        if self.collector.stream_queue_depth == 0 {
            anyhow::bail!("collector.stream_queue_depth must be at least 1");
        }
        if self.runner.program.trim().is_empty() {
            anyhow::bail!("runner.program must not be empty");
        }
        Ok(())
    }

    /// The configured worker ID, or a freshly generated `worker-xxxxxxxx`.
    pub fn worker_id(&self) -> String {
        match &self.worker.id {
            Some(id) => id.clone(),
            None => generate_worker_id(),
        }
    }
}

/// Random worker identifier used when none is configured.
pub fn generate_worker_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &raw[..8])
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Stable worker identifier. Generated at startup when absent.
    pub id: Option<String>,
    /// Result records per `test:batch` message.
    pub batch_size: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: None,
            batch_size: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Results Collector endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Base URL for the HTTP API (`/shards`, `/healing/events`).
    pub base_url: String,
    /// `host:port` of the result stream endpoint. Streaming is disabled when unset.
    pub stream_addr: Option<String>,
    /// Base URL for artifact uploads. Defaults to `base_url`.
    pub artifact_url: Option<String>,
    /// Bearer token sent with artifact uploads.
    pub api_key: Option<String>,
    /// Per-request timeout for HTTP calls.
    pub request_timeout_ms: u64,
    /// Limit on connecting to the stream endpoint and sending `hello`.
    pub stream_connect_timeout_ms: u64,
    /// How long closing the stream may wait for queued frames to be written.
    pub stream_close_timeout_ms: u64,
    /// Frames buffered for the stream writer. A full queue drops the stream.
    pub stream_queue_depth: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3023/api/v1".to_string(),
            stream_addr: Some("127.0.0.1:3025".to_string()),
            artifact_url: None,
            api_key: None,
            request_timeout_ms: 10_000,
            stream_connect_timeout_ms: 5_000,
            stream_close_timeout_ms: 5_000,
            stream_queue_depth: 1024,
        }
    }
}

impl CollectorConfig {
    pub fn artifact_base(&self) -> &str {
        self.artifact_url.as_deref().unwrap_or(&self.base_url)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// External test runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Executable to spawn.
    pub program: String,
    /// Leading arguments, placed before the test files.
    pub args: Vec<String>,
    /// Working directory for the runner. Inherits the worker's when unset.
    pub workdir: Option<PathBuf>,
    /// Extra environment for the runner process.
    pub env: BTreeMap<String, String>,
    /// Pass `--workers=1` so parallelism comes only from sharding.
    pub single_worker: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            workdir: None,
            env: BTreeMap::new(),
            single_worker: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub upload_artifacts: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            upload_artifacts: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Healing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    pub enabled: bool,
    /// Remember healed selectors for the lifetime of the session.
    pub cache: bool,
    pub data_test_form: DataTestForm,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache: true,
            data_test_form: DataTestForm::Matched,
        }
    }
}

/// Which attribute the data-test strategy puts in its candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTestForm {
    /// The attribute that actually carried the matching value.
    Matched,
    /// Always `[data-test="..."]`, for consumers of the legacy event format.
    Canonical,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.worker.batch_size, 10);
        assert!(cfg.worker.id.is_none());
        assert_eq!(cfg.runner.program, "npx");
        assert!(cfg.runner.single_worker);
        assert!(cfg.healing.enabled);
        assert_eq!(cfg.healing.data_test_form, DataTestForm::Matched);
        assert_eq!(cfg.collector.artifact_base(), cfg.collector.base_url);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[worker]
batch_size = 25

[healing]
data_test_form = "canonical"
"#;
        let cfg: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.worker.batch_size, 25);
        assert_eq!(cfg.healing.data_test_form, DataTestForm::Canonical);
        assert!(cfg.healing.cache);
        assert_eq!(cfg.collector.request_timeout_ms, 10_000);
        assert_eq!(cfg.collector.stream_connect_timeout_ms, 5_000);
        assert_eq!(cfg.collector.stream_queue_depth, 1024);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shardrunner.toml");
        std::fs::write(
            &path,
            r#"
[worker]
id = "worker-fixed"

[runner]
program = "node"
args = ["run-tests.js"]
"#,
        )
        .unwrap();

        let cfg = WorkerConfig::load(&path).unwrap();
        assert_eq!(cfg.worker_id(), "worker-fixed");
        assert_eq!(cfg.runner.program, "node");
        assert_eq!(cfg.runner.args, vec!["run-tests.js".to_string()]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[worker]\nbatch_size = 0\n").unwrap();
        assert!(WorkerConfig::load(&path).is_err());
    }

    #[test]
    fn test_zero_stream_queue_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[collector]\nstream_queue_depth = 0\n").unwrap();
        assert!(WorkerConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(WorkerConfig::load(Path::new("/nonexistent/shardrunner.toml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WORKER_ID", "worker-env"),
            ("RESULTS_SERVICE_URL", "http://collector:9000/api/v1"),
            ("ARTIFACT_SERVICE_URL", "http://artifacts:9001/api/v1"),
            ("SHARDRUNNER_BATCH_SIZE", "3"),
        ]
        .into_iter()
        .collect();

        let mut cfg = WorkerConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.worker_id(), "worker-env");
        assert_eq!(cfg.worker.batch_size, 3);
        assert_eq!(cfg.collector.base_url, "http://collector:9000/api/v1");
        assert_eq!(cfg.collector.artifact_base(), "http://artifacts:9001/api/v1");
    }

    #[test]
    fn test_bad_batch_size_env_errors() {
        let mut cfg = WorkerConfig::default();
        let res = cfg.apply_env_overrides(|k| {
            (k == "SHARDRUNNER_BATCH_SIZE").then(|| "lots".to_string())
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_generated_worker_id_shape() {
        let id = generate_worker_id();
        assert!(id.starts_with("worker-"));
        assert_eq!(id.len(), "worker-".len() + 8);
        assert_ne!(id, generate_worker_id());
    }
}

//! `stepflow.toml` configuration.
//!
//! Every section is optional; an empty file yields the engine defaults, the
//! built-in catalog and file checkpoints under `./data/checkpoints`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepflow_builtins::{default_analyzer, register_builtins, register_scripted, ScriptedSpec};
use stepflow_orchestrator::{CapabilityRegistry, EngineConfig, KeywordIntentAnalyzer};
use stepflow_session::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

/// Top-level `stepflow.toml` contents.
#[derive(Debug, Deserialize, Default)]
pub struct StepflowConfig {
    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Where checkpoints are stored.
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    /// Register the echo capability and the default catalog.
    #[serde(default = "default_true")]
    pub builtins: bool,
    /// Scripted capabilities; a name already registered is replaced.
    #[serde(default)]
    pub capabilities: Vec<ScriptedSpec>,
    /// Keyword rules; the default catalog's analyzer when absent.
    #[serde(default)]
    pub analyzer: Option<KeywordIntentAnalyzer>,
}

/// Checkpoint storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// JSON files under `dir`.
    #[default]
    File,
    /// Lost when the process exits.
    Memory,
    /// A single SQLite database; needs the `sqlite` feature.
    Sqlite,
}

/// The `[checkpoints]` section.
#[derive(Debug, Deserialize)]
pub struct CheckpointConfig {
    /// Storage backend.
    #[serde(default)]
    pub backend: Backend,
    /// Root directory of the file backend.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Database path of the sqlite backend.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            dir: default_checkpoint_dir(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/checkpoints")
}
fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./data/stepflow.db")
}

impl StepflowConfig {
    /// Read `path`, or fall back to defaults when `required` is false and the
    /// file does not exist.
    pub async fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        if !required && !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default_with_builtins());
        }
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Self::parse(&raw)
    }

    /// Parse and validate TOML text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.engine.validate()?;
        Ok(config)
    }

    fn default_with_builtins() -> Self {
        Self {
            builtins: true,
            ..Self::default()
        }
    }

    /// The registry: builtins when enabled, then scripted capabilities.
    pub fn registry(&self) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        if self.builtins {
            register_builtins(&mut registry);
        }
        register_scripted(&mut registry, self.capabilities.clone());
        registry
    }

    /// The configured analyzer, or the default catalog's.
    pub fn analyzer(&self) -> KeywordIntentAnalyzer {
        self.analyzer.clone().unwrap_or_else(default_analyzer)
    }

    /// Open the configured checkpoint backend.
    pub async fn checkpoint_store(&self) -> anyhow::Result<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self.checkpoints.backend {
            Backend::File => Arc::new(FileCheckpointStore::new(self.checkpoints.dir.clone()).await?),
            Backend::Memory => Arc::new(MemoryCheckpointStore::new()),
            #[cfg(feature = "sqlite")]
            Backend::Sqlite => Arc::new(stepflow_session::SqliteCheckpointStore::open(
                &self.checkpoints.sqlite_path,
            )?),
            #[cfg(not(feature = "sqlite"))]
            Backend::Sqlite => {
                anyhow::bail!("the sqlite backend requires building with `--features sqlite`")
            }
        };
        Ok(store)
    }
}

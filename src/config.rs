//! Configuration management for the Ingot dispatch core

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use crate::error::{IngotError, IngotResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Name given to the worker thread
    pub worker_name: String,
    /// Upper bound on live backend bytes, unlimited when `None`
    pub memory_limit: Option<usize>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            worker_name: "ingot-interpreter".to_string(),
            memory_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fail when a backend returns a different number of results than the
    /// operator declares
    pub check_output_arity: bool,
    /// Serve FastpathCopy operators without a backend round-trip
    pub fastpath_copy: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            check_output_arity: true,
            fastpath_copy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_thread_names: true,
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> IngotResult<tracing::Level> {
        self.level
            .parse::<tracing::Level>()
            .map_err(|_| IngotError::ConfigurationError(format!("unknown log level '{}'", self.level)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngotConfig {
    pub interpreter: InterpreterConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

impl IngotConfig {
    pub fn validate(&self) -> IngotResult<()> {
        self.logging.max_level()?;
        if self.interpreter.worker_name.is_empty() {
            return Err(IngotError::ConfigurationError("worker_name must not be empty".to_string()));
        }
        if self.interpreter.memory_limit == Some(0) {
            return Err(IngotError::ConfigurationError("memory_limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration manager with change notification
pub struct ConfigManager {
    config: Arc<RwLock<IngotConfig>>,
    config_file: Option<PathBuf>,
    watchers: Vec<tokio::sync::watch::Sender<IngotConfig>>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(IngotConfig::default())),
            config_file: None,
            watchers: Vec::new(),
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> IngotResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: IngotConfig = serde_json::from_str(&content)?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!("Configuration loaded from {:?}", path);
        self.notify_watchers();

        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> IngotResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> IngotConfig {
        self.config.read().clone()
    }

    pub fn update_config<F>(&mut self, f: F) -> IngotResult<()>
    where
        F: FnOnce(&mut IngotConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;

        self.notify_watchers();

        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }

        Ok(())
    }

    pub fn watch_config(&mut self) -> tokio::sync::watch::Receiver<IngotConfig> {
        let (sender, receiver) = tokio::sync::watch::channel(self.get_config());
        self.watchers.push(sender);
        receiver
    }

    fn notify_watchers(&mut self) {
        let config = self.get_config();
        self.watchers.retain_mut(|sender| sender.send(config.clone()).is_ok());
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the process-wide configuration
pub fn get_config() -> IngotConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the process-wide configuration
pub fn update_config<F>(f: F) -> IngotResult<()>
where
    F: FnOnce(&mut IngotConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

pub fn load_config_from_file(path: &Path) -> IngotResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

pub fn watch_config() -> tokio::sync::watch::Receiver<IngotConfig> {
    CONFIG_MANAGER.write().watch_config()
}

/// Create a configuration builder for easy setup
pub struct ConfigBuilder {
    config: IngotConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: IngotConfig::default(),
        }
    }

    pub fn interpreter(mut self, f: impl FnOnce(&mut InterpreterConfig)) -> Self {
        f(&mut self.config.interpreter);
        self
    }

    pub fn dispatch(mut self, f: impl FnOnce(&mut DispatchConfig)) -> Self {
        f(&mut self.config.dispatch);
        self
    }

    pub fn logging(mut self, f: impl FnOnce(&mut LoggingConfig)) -> Self {
        f(&mut self.config.logging);
        self
    }

    pub fn build(self) -> IngotResult<IngotConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn apply(self) -> IngotResult<()> {
        let config = self.build()?;
        update_config(|current| *current = config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

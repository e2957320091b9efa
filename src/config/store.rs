use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, so components can grab the
/// current configuration on every operation without contention.
#[derive(Clone)]
pub struct ConfigStore {
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Open the configuration file, writing defaults if it does not exist
    pub async fn new(path: &Path) -> Result<Self> {
        let config = Self::load_config(path).await?;
        Ok(Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Build a store around an in-memory config without touching disk
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_config_to_file(path, &config).await?;
                info!("Wrote default configuration to {}", path.display());
                Ok(config)
            }
            Err(e) => Err(AppError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save_config_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }
}

use std::sync::Arc;

use crate::config::ConfigStore;
use crate::msd::MsdController;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Drop box controller: image, gadget, manifest, staging, index
    pub msd: Arc<MsdController>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ConfigStore, msd: Arc<MsdController>) -> Arc<Self> {
        Arc::new(Self { config, msd })
    }
}

//! Application configuration
//!
//! `AppConfig` is a plain serde schema where every section defaults,
//! so a partial JSON file is always valid. `ConfigStore` owns the file
//! and hands out lock-free snapshots.

mod schema;
mod store;

pub use schema::{AppConfig, GadgetConfig, StorageConfig, TimingConfig, WebConfig};
pub use store::ConfigStore;

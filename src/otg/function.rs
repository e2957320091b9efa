//! USB Gadget Function trait definition

use std::path::{Path, PathBuf};

use super::configfs::{create_symlink, is_link, remove_file};
use crate::error::Result;

/// USB Gadget Function trait
pub trait GadgetFunction: Send + Sync {
    /// Get function name (e.g., "acm.usb0", "mass_storage.0")
    fn name(&self) -> &str;

    /// Create function directory and configuration in ConfigFS
    fn create(&self, gadget_path: &Path) -> Result<()>;

    /// Cleanup function directory
    fn cleanup(&self, gadget_path: &Path) -> Result<()>;

    /// Function directory under the gadget
    fn function_path(&self, gadget_path: &Path) -> PathBuf {
        gadget_path.join("functions").join(self.name())
    }

    /// Whether the function is linked into the configuration
    fn is_linked(&self, config_path: &Path) -> bool {
        is_link(&config_path.join(self.name()))
    }

    /// Link function to configuration; no-op when already linked
    fn link(&self, config_path: &Path, gadget_path: &Path) -> Result<()> {
        if self.is_linked(config_path) {
            return Ok(());
        }
        create_symlink(
            &self.function_path(gadget_path),
            &config_path.join(self.name()),
        )
    }

    /// Unlink function from configuration
    fn unlink(&self, config_path: &Path) -> Result<()> {
        remove_file(&config_path.join(self.name()))
    }
}

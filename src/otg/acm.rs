//! ACM (serial console) Function implementation for USB Gadget

use std::path::Path;
use tracing::{debug, warn};

use super::configfs::{create_dir, remove_dir};
use super::function::GadgetFunction;
use crate::error::Result;

/// CDC ACM serial function. Exposes `/dev/ttyGS<n>` on the device side.
#[derive(Debug, Clone)]
pub struct AcmFunction {
    name: String,
}

impl AcmFunction {
    pub fn new(instance: u8) -> Self {
        Self {
            name: format!("acm.usb{}", instance),
        }
    }
}

impl GadgetFunction for AcmFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, gadget_path: &Path) -> Result<()> {
        create_dir(&self.function_path(gadget_path))?;
        debug!("Created ACM function: {}", self.name());
        Ok(())
    }

    fn cleanup(&self, gadget_path: &Path) -> Result<()> {
        if let Err(e) = remove_dir(&self.function_path(gadget_path)) {
            warn!("Could not remove ACM function directory: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acm_create_link_cleanup() {
        let dir = TempDir::new().unwrap();
        let gadget = dir.path();
        let config = gadget.join("configs/c.1");
        std::fs::create_dir_all(&config).unwrap();

        let acm = AcmFunction::new(0);
        assert_eq!(acm.name(), "acm.usb0");

        acm.create(gadget).unwrap();
        assert!(gadget.join("functions/acm.usb0").is_dir());

        acm.link(&config, gadget).unwrap();
        assert!(acm.is_linked(&config));
        // Linking twice is a no-op
        acm.link(&config, gadget).unwrap();

        acm.unlink(&config).unwrap();
        assert!(!acm.is_linked(&config));

        acm.cleanup(gadget).unwrap();
        assert!(!gadget.join("functions/acm.usb0").exists());
    }
}

//! MSD (Mass Storage Device) Function implementation for USB Gadget

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::configfs::{create_dir, read_file, remove_dir, write_file};
use super::function::GadgetFunction;
use crate::error::Result;
use crate::utils::Backoff;

/// The only LUN this gadget exposes
pub const LUN: u8 = 0;

/// MSD Function for USB Gadget
#[derive(Debug, Clone)]
pub struct MsdFunction {
    /// Cached function name (avoids repeated allocation)
    name: String,
}

impl MsdFunction {
    /// Create a new MSD function
    pub fn new(instance: u8) -> Self {
        Self {
            name: format!("mass_storage.{}", instance),
        }
    }

    /// Get LUN path
    pub fn lun_path(&self, gadget_path: &Path) -> PathBuf {
        self.function_path(gadget_path).join(format!("lun.{}", LUN))
    }

    /// Ensure the function and its LUN directory exist
    pub fn ensure_lun(&self, gadget_path: &Path) -> Result<PathBuf> {
        let lun_path = self.lun_path(gadget_path);
        if !lun_path.exists() {
            create_dir(&lun_path)?;
        }
        Ok(lun_path)
    }

    /// Mark the LUN as removable media. Best-effort.
    pub fn set_removable(&self, gadget_path: &Path) -> bool {
        match write_file(&self.lun_path(gadget_path).join("removable"), "1") {
            Ok(()) => true,
            Err(e) => {
                debug!("Could not mark LUN {} removable: {}", LUN, e);
                false
            }
        }
    }

    /// Write the backing file attribute, retrying while the kernel settles.
    ///
    /// Returns whether the write was accepted. Does not verify.
    pub fn write_backing_file(&self, gadget_path: &Path, file: &str, backoff: &Backoff) -> bool {
        let attr = self.lun_path(gadget_path).join("file");
        let result = backoff.retry(|attempt| {
            write_file(&attr, file).map_err(|e| {
                warn!(
                    "LUN {} file write rejected, attempt {}/{}: {}",
                    LUN,
                    attempt + 1,
                    backoff.attempts,
                    e
                );
                e
            })
        });
        result.is_ok()
    }

    /// Eject the current media.
    ///
    /// Uses `forced_eject` when the kernel exposes it, otherwise clears the
    /// backing file. Verified by reading the backing file attribute back.
    pub fn eject(&self, gadget_path: &Path, backoff: &Backoff) -> bool {
        let lun_path = self.lun_path(gadget_path);
        if !lun_path.exists() {
            return false;
        }

        let forced_eject_path = lun_path.join("forced_eject");
        let ejected = backoff.poll_until(|| {
            if forced_eject_path.exists() {
                debug!("Using forced_eject to disconnect LUN {}", LUN);
                if let Err(e) = write_file(&forced_eject_path, "1") {
                    debug!("forced_eject write failed: {}", e);
                }
            }
            if self.lun_file(gadget_path).is_some() {
                // No forced_eject, or it did not take: clear the file directly
                if let Err(e) = write_file(&lun_path.join("file"), "") {
                    debug!("Clearing LUN {} file failed: {}", LUN, e);
                }
            }
            self.lun_file(gadget_path).is_none()
        });

        if ejected {
            info!("LUN {} media ejected", LUN);
        } else {
            warn!("LUN {} media did not eject", LUN);
        }
        ejected
    }

    /// Insert media: write `file` and read it back to confirm it stuck
    pub fn attach(&self, gadget_path: &Path, file: &Path, backoff: &Backoff) -> bool {
        let requested = file.to_string_lossy();
        if !self.write_backing_file(gadget_path, &requested, backoff) {
            return false;
        }
        let attached = self.lun_file(gadget_path).as_deref() == Some(file);
        if attached {
            info!("LUN {} attached: {}", LUN, file.display());
        } else {
            warn!(
                "LUN {} readback mismatch after attaching {}",
                LUN,
                file.display()
            );
        }
        attached
    }

    /// Get current LUN file path (None when no media is attached)
    pub fn lun_file(&self, gadget_path: &Path) -> Option<PathBuf> {
        let content = read_file(&self.lun_path(gadget_path).join("file")).ok()?;
        if content.is_empty() {
            None
        } else {
            Some(PathBuf::from(content))
        }
    }
}

impl GadgetFunction for MsdFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        create_dir(&func_path)?;

        // Set stall to 0 (workaround for some hosts)
        let stall_path = func_path.join("stall");
        if stall_path.exists() {
            let _ = write_file(&stall_path, "0");
        }

        // LUN 0 is created by the kernel, but ensure it exists
        let lun_path = self.ensure_lun(gadget_path)?;
        let _ = write_file(&lun_path.join("ro"), "0");
        self.set_removable(gadget_path);

        debug!("Created MSD function: {}", self.name());
        Ok(())
    }

    fn cleanup(&self, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);

        // Release the backing file before removing the function
        let lun_file = self.lun_path(gadget_path).join("file");
        if lun_file.exists() {
            let _ = write_file(&lun_file, "");
        }

        if let Err(e) = remove_dir(&func_path) {
            warn!("Could not remove MSD function directory: {}", e);
        }

        debug!("Cleaned up MSD function {}", self.name());
        Ok(())
    }
}

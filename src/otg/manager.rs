//! OTG Gadget Manager - lifecycle of the composite serial + mass-storage gadget

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::acm::AcmFunction;
use super::configfs::{
    create_dir, find_udc, is_configfs_available, is_link, read_file, remove_dir, remove_file, write_file,
    LANG_EN_US, USB_BCD_USB,
};
use super::function::GadgetFunction;
use super::msd::MsdFunction;
use crate::config::{GadgetConfig, TimingConfig};
use crate::error::{AppError, Result};
use crate::msd::ImageManager;
use crate::utils::Backoff;

/// Coarse gadget state derived from ConfigFS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GadgetState {
    /// Gadget directory does not exist
    Absent,
    /// Gadget exists, UDC attribute empty
    CreatedUnbound,
    /// Gadget exists and is bound to a controller
    Bound,
}

/// Result of a media hot-swap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwapOutcome {
    /// Old media verifiably removed
    pub detached: bool,
    /// New media verifiably attached
    pub attached: bool,
    /// Attach needed the unlink/relink recovery path
    pub relinked: bool,
}

impl SwapOutcome {
    pub fn is_success(&self) -> bool {
        self.detached && self.attached
    }
}

/// OTG Gadget Manager
///
/// Stateless apart from configuration: every query reads ConfigFS, so
/// several handles over the same gadget always agree.
pub struct OtgGadgetManager {
    descriptor: GadgetConfig,
    timing: TimingConfig,
    /// Gadget path in ConfigFS
    gadget_path: PathBuf,
    /// Configuration path
    config_path: PathBuf,
    configfs_root: PathBuf,
    udc_class_dir: PathBuf,
    acm: AcmFunction,
    msd: MsdFunction,
    /// Absolute path of the backing image
    image_path: PathBuf,
}

impl OtgGadgetManager {
    pub fn new(descriptor: &GadgetConfig, timing: &TimingConfig, image_path: &Path) -> Self {
        let gadget_path = descriptor.gadget_path();
        let config_path = gadget_path.join("configs/c.1");

        Self {
            configfs_root: PathBuf::from(&descriptor.configfs_root),
            udc_class_dir: descriptor.udc_class_dir(),
            descriptor: descriptor.clone(),
            timing: timing.clone(),
            gadget_path,
            config_path,
            acm: AcmFunction::new(0),
            msd: MsdFunction::new(0),
            image_path: image_path.to_path_buf(),
        }
    }

    fn write_backoff(&self) -> Backoff {
        Backoff::exponential(
            self.timing.write_attempts,
            Duration::from_millis(self.timing.write_backoff_ms),
        )
    }

    fn settle(duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    /// ConfigFS is mounted and at least one UDC is present
    pub fn is_ready(&self) -> bool {
        is_configfs_available(&self.configfs_root) && find_udc(&self.udc_class_dir).is_some()
    }

    /// Gadget directory exists
    pub fn is_initialized(&self) -> bool {
        self.gadget_path.is_dir()
    }

    /// Check if gadget is bound to UDC
    pub fn is_bound(&self) -> bool {
        read_file(&self.gadget_path.join("UDC"))
            .map(|udc| !udc.is_empty())
            .unwrap_or(false)
    }

    pub fn state(&self) -> GadgetState {
        if !self.is_initialized() {
            GadgetState::Absent
        } else if self.is_bound() {
            GadgetState::Bound
        } else {
            GadgetState::CreatedUnbound
        }
    }

    /// Get gadget path
    pub fn gadget_path(&self) -> &Path {
        &self.gadget_path
    }

    /// Configured backing image
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Current LUN backing file
    pub fn lun_file(&self) -> Option<PathBuf> {
        self.msd.lun_file(&self.gadget_path)
    }

    /// Whether a function is linked into the configuration
    pub fn is_serial_linked(&self) -> bool {
        self.acm.is_linked(&self.config_path)
    }

    pub fn is_mass_storage_linked(&self) -> bool {
        self.msd.is_linked(&self.config_path)
    }

    /// Create the gadget with serial + mass storage and bind it to the first UDC
    pub fn init(&self, image: &ImageManager) -> Result<()> {
        if !self.is_ready() {
            return Err(AppError::NotReady(
                "ConfigFS not mounted or no UDC present".to_string(),
            ));
        }

        if self.is_initialized() {
            debug!("Gadget already exists, skipping init");
            return Ok(());
        }

        info!("Setting up USB Gadget: {}", self.descriptor.name);

        image.create_image()?;

        create_dir(&self.gadget_path)?;
        self.set_device_descriptors()?;
        self.create_strings()?;
        self.create_configuration()?;

        self.acm.create(&self.gadget_path)?;
        self.msd.create(&self.gadget_path)?;

        let backoff = self.write_backoff();
        if !self
            .msd
            .write_backing_file(&self.gadget_path, &self.image_path.to_string_lossy(), &backoff)
        {
            warn!("Initial LUN backing file write did not succeed");
        }
        self.msd.set_removable(&self.gadget_path);

        for func in self.functions() {
            if let Err(e) = func.link(&self.config_path, &self.gadget_path) {
                warn!("Failed to link {}: {}", func.name(), e);
            }
        }

        self.bind()?;
        info!("USB Gadget setup complete");
        Ok(())
    }

    fn functions(&self) -> [&dyn GadgetFunction; 2] {
        [&self.acm, &self.msd]
    }

    /// Bind gadget to UDC
    fn bind(&self) -> Result<()> {
        let udc = find_udc(&self.udc_class_dir).ok_or_else(|| {
            AppError::Bind("No USB Device Controller (UDC) found".to_string())
        })?;

        info!("Binding gadget to UDC: {}", udc);
        write_file(&self.gadget_path.join("UDC"), &udc)
            .map_err(|e| AppError::Bind(format!("Failed to bind to {}: {}", udc, e)))?;
        Self::settle(self.timing.bind_settle());
        Ok(())
    }

    /// Unbind and remove the gadget. Every step is best-effort.
    pub fn deinit(&self) {
        if !self.is_initialized() {
            return;
        }

        info!("Cleaning up USB Gadget: {}", self.descriptor.name);

        if let Err(e) = write_file(&self.gadget_path.join("UDC"), "") {
            warn!("Failed to unbind gadget: {}", e);
        }

        // Unlink every function association, including ones we did not create
        if let Ok(entries) = std::fs::read_dir(&self.config_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                if is_link(&path) {
                    if let Err(e) = remove_file(&path) {
                        warn!("Failed to unlink {}: {}", path.display(), e);
                    }
                }
            }
        }

        let functions_path = self.gadget_path.join("functions");
        for func in self.functions() {
            let _ = func.cleanup(&self.gadget_path);
        }
        // Leftover functions from other tools
        if let Ok(entries) = std::fs::read_dir(&functions_path) {
            for entry in entries.flatten() {
                if let Err(e) = remove_dir(&entry.path()) {
                    warn!("{}", e);
                }
            }
        }

        for dir in [
            self.config_path.join("strings").join(LANG_EN_US),
            self.config_path.clone(),
            self.gadget_path.join("strings").join(LANG_EN_US),
        ] {
            if let Err(e) = remove_dir(&dir) {
                warn!("{}", e);
            }
        }

        if let Err(e) = remove_dir(&self.gadget_path) {
            warn!("Could not remove gadget directory: {}", e);
        }

        info!("USB Gadget cleanup complete");
    }

    /// Unlink only the mass-storage function from the configuration
    pub fn remove_mass_storage(&self) -> bool {
        match self.msd.unlink(&self.config_path) {
            Ok(()) => {
                debug!("Mass storage unlinked from configuration");
                true
            }
            Err(e) => {
                warn!("Failed to unlink mass storage: {}", e);
                false
            }
        }
    }

    /// Ensure the mass-storage function exists, points at the configured
    /// image and is linked into the configuration
    pub fn add_mass_storage(&self) -> bool {
        if let Err(e) = self.msd.ensure_lun(&self.gadget_path) {
            warn!("Failed to create mass storage LUN: {}", e);
            return false;
        }

        let written = self.msd.write_backing_file(
            &self.gadget_path,
            &self.image_path.to_string_lossy(),
            &self.write_backoff(),
        );
        self.msd.set_removable(&self.gadget_path);

        match self.msd.link(&self.config_path, &self.gadget_path) {
            Ok(()) => written,
            Err(e) => {
                warn!("Failed to link mass storage: {}", e);
                false
            }
        }
    }

    /// Simulate media removal without touching the configuration link
    pub fn detach_media(&self) -> bool {
        self.msd.eject(&self.gadget_path, &self.write_backoff())
    }

    /// Take the image away from the host before it is written locally.
    ///
    /// Ejects the media first. When the eject does not verify, the function
    /// is unlinked from the configuration instead. Returns whether the host
    /// can no longer reach the image.
    pub fn withdraw_media(&self) -> bool {
        if self.detach_media() {
            return true;
        }
        warn!("Media detach not verified, unlinking mass storage function");
        self.remove_mass_storage();
        if self.mass_storage_link_present() {
            warn!("Mass storage function still linked, media remains exposed");
            return false;
        }
        true
    }

    /// Anything occupying the mass-storage slot of the configuration
    fn mass_storage_link_present(&self) -> bool {
        self.config_path.join(self.msd.name()).symlink_metadata().is_ok()
    }

    /// Simulate media insertion without touching the configuration link
    pub fn attach_media(&self, path: &Path) -> bool {
        self.msd.attach(&self.gadget_path, path, &self.write_backoff())
    }

    /// Hot-swap the LUN media, leaving the serial function and binding alone
    ///
    /// Some hosts cache the previous media identity; when a plain attach does
    /// not stick, the function's configuration link is interrupted to force
    /// re-enumeration.
    pub fn replace_media(&self, new_path: &Path) -> SwapOutcome {
        let mut outcome = SwapOutcome::default();

        if !self.is_initialized() {
            warn!("Gadget not created, cannot replace media");
            return outcome;
        }

        if let Err(e) = self.msd.ensure_lun(&self.gadget_path) {
            warn!("Failed to create mass storage LUN: {}", e);
            return outcome;
        }
        if let Err(e) = self.msd.link(&self.config_path, &self.gadget_path) {
            warn!("Failed to link mass storage: {}", e);
        }

        let backoff = self.write_backoff();
        outcome.detached = self.msd.eject(&self.gadget_path, &backoff);
        Self::settle(self.timing.eject_settle());

        outcome.attached = self.msd.attach(&self.gadget_path, new_path, &backoff);
        Self::settle(self.timing.attach_settle());

        if !outcome.attached {
            warn!("Media attach did not stick, relinking mass storage function");
            outcome.relinked = true;
            self.remove_mass_storage();
            self.msd
                .write_backing_file(&self.gadget_path, &new_path.to_string_lossy(), &backoff);
            self.msd.set_removable(&self.gadget_path);
            if let Err(e) = self.msd.link(&self.config_path, &self.gadget_path) {
                warn!("Failed to relink mass storage: {}", e);
            }
            outcome.attached = self.lun_file().as_deref() == Some(new_path);
            Self::settle(self.timing.attach_settle());
        }

        if outcome.is_success() {
            info!("Media replaced with {}", new_path.display());
        } else {
            warn!(
                "Media replace incomplete (detached={}, attached={})",
                outcome.detached, outcome.attached
            );
        }
        outcome
    }

    /// Set USB device descriptors
    fn set_device_descriptors(&self) -> Result<()> {
        write_file(
            &self.gadget_path.join("idVendor"),
            &format!("0x{:04x}", self.descriptor.vendor_id),
        )?;
        write_file(
            &self.gadget_path.join("idProduct"),
            &format!("0x{:04x}", self.descriptor.product_id),
        )?;
        write_file(
            &self.gadget_path.join("bcdDevice"),
            &format!("0x{:04x}", self.descriptor.bcd_device),
        )?;
        write_file(
            &self.gadget_path.join("bcdUSB"),
            &format!("0x{:04x}", USB_BCD_USB),
        )?;
        debug!("Set device descriptors");
        Ok(())
    }

    /// Create USB strings
    fn create_strings(&self) -> Result<()> {
        let strings_path = self.gadget_path.join("strings").join(LANG_EN_US);
        create_dir(&strings_path)?;

        write_file(
            &strings_path.join("serialnumber"),
            &self.descriptor.serial_number,
        )?;
        write_file(
            &strings_path.join("manufacturer"),
            &self.descriptor.manufacturer,
        )?;
        write_file(&strings_path.join("product"), &self.descriptor.product)?;
        debug!("Created USB strings");
        Ok(())
    }

    /// Create configuration
    fn create_configuration(&self) -> Result<()> {
        create_dir(&self.config_path)?;

        let strings_path = self.config_path.join("strings").join(LANG_EN_US);
        create_dir(&strings_path)?;
        write_file(&strings_path.join("configuration"), "Config 1: ACM + MSD")?;

        write_file(
            &self.config_path.join("MaxPower"),
            &self.descriptor.max_power_ma.to_string(),
        )?;

        debug!("Created configuration c.1");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::fs;
    use tempfile::TempDir;

    /// Temp directories standing in for ConfigFS and /sys/class/udc
    struct Fixture {
        _dir: TempDir,
        manager: OtgGadgetManager,
        image: ImageManager,
        udc_dir: PathBuf,
    }

    fn fixture(with_udc: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let configfs = dir.path().join("config");
        let udc_dir = dir.path().join("udc");
        fs::create_dir_all(configfs.join("usb_gadget")).unwrap();
        fs::create_dir_all(&udc_dir).unwrap();
        if with_udc {
            fs::create_dir(udc_dir.join("dummy_udc.0")).unwrap();
        }

        let image_path = dir.path().join("data.img");
        fs::write(&image_path, vec![0u8; 4096]).unwrap();

        let gadget = GadgetConfig {
            configfs_root: configfs.to_string_lossy().to_string(),
            udc_class_dir: udc_dir.to_string_lossy().to_string(),
            ..Default::default()
        };
        let storage = StorageConfig {
            image_path: image_path.to_string_lossy().to_string(),
            image_size_mb: 1,
            mount_dir: dir.path().join("mnt").to_string_lossy().to_string(),
            ..Default::default()
        };
        let timing = TimingConfig::immediate();
        let image = ImageManager::new(&storage, &timing);
        let manager = OtgGadgetManager::new(&gadget, &timing, image.image_path());

        Fixture {
            _dir: dir,
            manager,
            image,
            udc_dir,
        }
    }

    #[test]
    fn test_init_requires_readiness() {
        let f = fixture(false);
        assert!(!f.manager.is_ready());
        let err = f.manager.init(&f.image).unwrap_err();
        assert!(matches!(err, AppError::NotReady(_)));
        assert_eq!(f.manager.state(), GadgetState::Absent);
    }

    #[test]
    fn test_init_without_configfs_is_not_ready() {
        let f = fixture(true);
        fs::remove_dir_all(&f.manager.configfs_root.join("usb_gadget")).unwrap();
        assert!(!f.manager.is_ready());
        let err = f.manager.init(&f.image).unwrap_err();
        assert!(matches!(err, AppError::NotReady(_)));
    }

    #[test]
    fn test_init_builds_bound_gadget() {
        let f = fixture(true);
        assert!(f.manager.is_ready());
        f.manager.init(&f.image).unwrap();

        let gadget = f.manager.gadget_path();
        assert_eq!(f.manager.state(), GadgetState::Bound);
        assert_eq!(read_file(&gadget.join("UDC")).unwrap(), "dummy_udc.0");
        assert_eq!(read_file(&gadget.join("idVendor")).unwrap(), "0x1d6b");
        assert_eq!(read_file(&gadget.join("idProduct")).unwrap(), "0x0104");
        assert_eq!(
            read_file(&gadget.join("strings/0x409/product")).unwrap(),
            "ReceiveIt"
        );
        assert_eq!(
            f.manager.lun_file().as_deref(),
            Some(f.image.image_path())
        );
        assert!(f.image.image_path().is_absolute());
        assert!(f.manager.is_serial_linked());
        assert!(f.manager.is_mass_storage_linked());

        // Second init is a no-op
        f.manager.init(&f.image).unwrap();
        assert_eq!(f.manager.state(), GadgetState::Bound);
    }

    #[test]
    fn test_deinit_then_reinit() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        f.manager.deinit();
        assert_eq!(f.manager.state(), GadgetState::Absent);
        assert!(!f.manager.gadget_path().exists());

        // Deinit on an absent gadget is a no-op
        f.manager.deinit();

        f.manager.init(&f.image).unwrap();
        assert_eq!(f.manager.state(), GadgetState::Bound);
    }

    #[test]
    fn test_unbound_state_and_bind_without_udc() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        write_file(&f.manager.gadget_path().join("UDC"), "").unwrap();
        assert_eq!(f.manager.state(), GadgetState::CreatedUnbound);

        fs::remove_dir(f.udc_dir.join("dummy_udc.0")).unwrap();
        let err = f.manager.bind().unwrap_err();
        assert!(matches!(err, AppError::Bind(_)));
    }

    #[test]
    fn test_remove_and_add_mass_storage_keeps_serial() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();

        assert!(f.manager.remove_mass_storage());
        assert!(!f.manager.is_mass_storage_linked());
        assert!(f.manager.is_serial_linked());
        assert!(f.manager.is_bound());

        assert!(f.manager.add_mass_storage());
        assert!(f.manager.is_mass_storage_linked());
        assert!(f.manager.is_serial_linked());
        assert_eq!(
            f.manager.lun_file().as_deref(),
            Some(f.image.image_path())
        );
    }

    #[test]
    fn test_detach_attach_media_keeps_link() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();

        assert!(f.manager.detach_media());
        assert!(f.manager.lun_file().is_none());
        assert!(f.manager.is_mass_storage_linked());

        let other = PathBuf::from("/srv/other.img");
        assert!(f.manager.attach_media(&other));
        assert_eq!(f.manager.lun_file(), Some(other));
        assert!(f.manager.is_mass_storage_linked());
    }

    /// Swap the LUN backing file for an attribute that rejects every write
    fn refuse_lun_writes(manager: &OtgGadgetManager) {
        let attr = manager.msd.lun_path(&manager.gadget_path).join("file");
        fs::remove_file(&attr).unwrap();
        std::os::unix::fs::symlink("/proc/version", &attr).unwrap();
    }

    #[test]
    fn test_withdraw_media_ejects() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        assert!(f.manager.withdraw_media());
        assert!(f.manager.lun_file().is_none());
        assert!(f.manager.is_mass_storage_linked());
    }

    #[test]
    fn test_withdraw_media_unlinks_when_eject_refused() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        refuse_lun_writes(&f.manager);
        assert!(!f.manager.detach_media());

        assert!(f.manager.withdraw_media());
        assert!(!f.manager.is_mass_storage_linked());
        assert!(f.manager.is_serial_linked());
        assert!(f.manager.is_bound());
    }

    #[test]
    fn test_withdraw_media_fails_while_function_stays_linked() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        refuse_lun_writes(&f.manager);

        // Something the unlink cannot remove sits in the configuration slot
        let slot = f.manager.config_path.join("mass_storage.0");
        fs::remove_file(&slot).unwrap();
        fs::create_dir_all(slot.join("pinned")).unwrap();

        assert!(!f.manager.withdraw_media());
        assert!(slot.exists());
    }

    #[test]
    fn test_replace_media_preserves_serial_link() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        let serial_link = f.manager.config_path.join("acm.usb0");
        let before = fs::read_link(&serial_link).unwrap();

        let new_image = PathBuf::from("/srv/swap.img");
        let outcome = f.manager.replace_media(&new_image);
        assert!(outcome.is_success());
        assert!(!outcome.relinked);
        assert_eq!(f.manager.lun_file(), Some(new_image));
        assert_eq!(fs::read_link(&serial_link).unwrap(), before);
        assert!(f.manager.is_bound());
    }

    #[test]
    fn test_replace_media_relinks_missing_function() {
        let f = fixture(true);
        f.manager.init(&f.image).unwrap();
        assert!(f.manager.remove_mass_storage());

        let outcome = f.manager.replace_media(f.image.image_path());
        assert!(outcome.is_success());
        assert!(f.manager.is_mass_storage_linked());
    }

    #[test]
    fn test_replace_media_without_gadget_fails() {
        let f = fixture(true);
        let outcome = f.manager.replace_media(f.image.image_path());
        assert!(!outcome.is_success());
        assert_eq!(f.manager.state(), GadgetState::Absent);
    }
}

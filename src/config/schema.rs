use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Backing image, mount point, staging and manifest locations
    pub storage: StorageConfig,
    /// USB gadget identity and ConfigFS locations
    pub gadget: GadgetConfig,
    /// Retry and settle timing for kernel interactions
    pub timing: TimingConfig,
    /// Web server settings
    pub web: WebConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backing image file exposed over USB
    pub image_path: String,
    /// Image size in MB
    pub image_size_mb: u32,
    /// Local mount point used during commits
    pub mount_dir: String,
    /// Staging directory for uploads
    pub upload_dir: String,
    /// Pending-deletion manifest file
    pub manifest_path: String,
    /// Prefix for the rotating FAT volume label
    pub volume_label_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            image_path: "/var/lib/receiveit/data.img".to_string(),
            image_size_mb: 1024,
            mount_dir: "/mnt/receiveit".to_string(),
            upload_dir: "/var/lib/receiveit/upload".to_string(),
            manifest_path: "/var/lib/receiveit/pending_deletions.txt".to_string(),
            volume_label_prefix: "RECEIVE".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn image_path(&self) -> PathBuf {
        PathBuf::from(&self.image_path)
    }

    pub fn mount_dir(&self) -> PathBuf {
        PathBuf::from(&self.mount_dir)
    }

    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(&self.upload_dir)
    }

    pub fn manifest_path(&self) -> PathBuf {
        PathBuf::from(&self.manifest_path)
    }

    /// Image size in bytes
    pub fn image_size_bytes(&self) -> u64 {
        self.image_size_mb as u64 * 1024 * 1024
    }
}

/// USB gadget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// ConfigFS mount point (the gadget lives under `usb_gadget/<name>`)
    pub configfs_root: String,
    /// UDC class directory listing controllers
    pub udc_class_dir: String,
    /// Gadget directory name
    pub name: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device version
    pub bcd_device: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    /// Max power in mA
    pub max_power_ma: u16,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            configfs_root: "/sys/kernel/config".to_string(),
            udc_class_dir: "/sys/class/udc".to_string(),
            name: "receiveit".to_string(),
            vendor_id: 0x1d6b,  // Linux Foundation
            product_id: 0x0104, // Multifunction Composite Gadget
            bcd_device: 0x0100,
            manufacturer: "receiveit".to_string(),
            product: "ReceiveIt".to_string(),
            serial_number: "receiveit".to_string(),
            max_power_ma: 250,
        }
    }
}

impl GadgetConfig {
    /// `<configfs_root>/usb_gadget/<name>`
    pub fn gadget_path(&self) -> PathBuf {
        PathBuf::from(&self.configfs_root)
            .join(crate::otg::configfs::USB_GADGET_DIR)
            .join(&self.name)
    }

    pub fn udc_class_dir(&self) -> PathBuf {
        PathBuf::from(&self.udc_class_dir)
    }
}

/// Timing configuration for retries and settle windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Attempts for ConfigFS attribute writes
    pub write_attempts: u32,
    /// Initial backoff between attribute write attempts (doubles each retry)
    pub write_backoff_ms: u64,
    /// Window for the host to observe media removal
    pub eject_settle_ms: u64,
    /// Window for the host to pick up new media
    pub attach_settle_ms: u64,
    /// Pause after detaching media before mounting locally
    pub detach_pause_ms: u64,
    /// Polls while waiting for a loop partition node
    pub partition_poll_attempts: u32,
    pub partition_poll_interval_ms: u64,
    /// Delay after unmount for device nodes to settle
    pub unmount_settle_ms: u64,
    /// Delay after binding to UDC for host enumeration
    pub bind_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            write_attempts: 5,
            write_backoff_ms: 50,
            eject_settle_ms: 500,
            attach_settle_ms: 300,
            detach_pause_ms: 200,
            partition_poll_attempts: 20,
            partition_poll_interval_ms: 100,
            unmount_settle_ms: 50,
            bind_settle_ms: 100,
        }
    }
}

impl TimingConfig {
    /// All waits set to zero, single write attempt. Used by tests.
    pub fn immediate() -> Self {
        Self {
            write_attempts: 1,
            write_backoff_ms: 0,
            eject_settle_ms: 0,
            attach_settle_ms: 0,
            detach_pause_ms: 0,
            partition_poll_attempts: 1,
            partition_poll_interval_ms: 0,
            unmount_settle_ms: 0,
            bind_settle_ms: 0,
        }
    }

    pub fn eject_settle(&self) -> Duration {
        Duration::from_millis(self.eject_settle_ms)
    }

    pub fn attach_settle(&self) -> Duration {
        Duration::from_millis(self.attach_settle_ms)
    }

    pub fn detach_pause(&self) -> Duration {
        Duration::from_millis(self.detach_pause_ms)
    }

    pub fn unmount_settle(&self) -> Duration {
        Duration::from_millis(self.unmount_settle_ms)
    }

    pub fn bind_settle(&self) -> Duration {
        Duration::from_millis(self.bind_settle_ms)
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 80,
        }
    }
}

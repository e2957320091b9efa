//! Backing image manager
//!
//! Owns the FAT32 image file exposed over USB:
//! - Allocation (fallocate, zero-fill fallback)
//! - MBR + single FAT32 partition, or whole-disk FAT32 when partitioning
//!   tools are missing
//! - Loop-device mount/unmount for local read-write access
//! - Volume label/serial churn so hosts drop cached directory state

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::layout::PARTITION_START;
use crate::config::{StorageConfig, TimingConfig};
use crate::error::{AppError, Result};
use crate::utils::cmd::{run, run_best_effort, run_stdout, tool_available, tools_available};
use crate::utils::Backoff;

/// FAT volume labels are at most 11 characters
const FAT_LABEL_MAX: usize = 11;

/// Zero-fill chunk size (1 MiB)
const ZERO_CHUNK: usize = 1024 * 1024;

/// Make `path` absolute against the current directory without touching the filesystem
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Candidate nodes for the first partition of a loop device.
///
/// Depending on the kernel the node is `/dev/loopXp1` or `/dev/loopX1`.
pub fn partition_node_candidates(device: &str) -> [PathBuf; 2] {
    [
        PathBuf::from(format!("{}p1", device)),
        PathBuf::from(format!("{}1", device)),
    ]
}

fn find_partition_node(device: &str) -> Option<PathBuf> {
    partition_node_candidates(device)
        .into_iter()
        .find(|p| p.exists())
}

/// Parse `losetup -j <file>` output into loop device paths.
///
/// Lines look like `/dev/loop0: [2049]:131 (/var/lib/receiveit/data.img)`.
pub fn parse_loop_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':').map(|(dev, _)| dev.trim()))
        .filter(|dev| !dev.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check a `/proc/mounts` style table for an active mount at `dir`
pub fn mounts_contain(mounts: &str, dir: &Path) -> bool {
    let target = dir.to_string_lossy();
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(|m| m.replace("\\040", " ") == target)
            .unwrap_or(false)
    })
}

/// Whether the mount at `dir` in a `/proc/mounts` style table is read-only.
/// `None` when nothing is mounted there.
pub fn mounted_read_only(mounts: &str, dir: &Path) -> Option<bool> {
    let target = dir.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mount_point = fields.nth(1)?;
            let options = fields.nth(1)?;
            (mount_point.replace("\\040", " ") == target).then_some(options)
        })
        // The last entry for a mount point is the one on top
        .last()
        .map(|options| options.split(',').any(|o| o == "ro"))
}

/// Volume label carrying a time-derived suffix, clamped to the FAT limit
pub fn volume_label(prefix: &str, unix_secs: u64) -> String {
    let prefix: String = prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(FAT_LABEL_MAX - 1)
        .collect();
    let digits = FAT_LABEL_MAX - prefix.len();
    let modulus = 10u64.pow(digits as u32);
    format!("{}{:0width$}", prefix, unix_secs % modulus, width = digits)
}

/// Write `size` zero bytes to a new file at `path`
pub fn zero_fill(path: &Path, size: u64) -> io::Result<()> {
    let mut file = File::create(path)?;
    let chunk = vec![0u8; ZERO_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()
}

/// Loop device attached for the lifetime of the guard
struct LoopDevice {
    device: String,
    keep: bool,
}

impl LoopDevice {
    /// Attach `image` to the first free loop device
    fn attach(image: &Path, scan_partitions: bool) -> Result<Self> {
        let image = image.to_string_lossy();
        let device = if scan_partitions {
            run_stdout("losetup", ["-f", "--show", "-P", &*image])?
        } else {
            run_stdout("losetup", ["-f", "--show", &*image])?
        };
        if device.is_empty() {
            return Err(AppError::Storage("losetup returned no device".to_string()));
        }
        debug!("Attached {} to {}", image, device);
        Ok(Self {
            device,
            keep: false,
        })
    }

    /// Leave the device attached; it now backs a mount
    fn keep(mut self) -> String {
        self.keep = true;
        self.device.clone()
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if !run_best_effort("losetup", ["-d", self.device.as_str()]) {
            warn!("Failed to detach loop device {}", self.device);
        }
    }
}

/// Storage image manager
pub struct ImageManager {
    /// Absolute image path
    image_path: PathBuf,
    size_bytes: u64,
    mount_dir: PathBuf,
    label_prefix: String,
    timing: TimingConfig,
}

impl ImageManager {
    pub fn new(storage: &StorageConfig, timing: &TimingConfig) -> Self {
        Self {
            image_path: absolute_path(&storage.image_path()),
            size_bytes: storage.image_size_bytes(),
            mount_dir: absolute_path(&storage.mount_dir()),
            label_prefix: storage.volume_label_prefix.clone(),
            timing: timing.clone(),
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    pub fn image_exists(&self) -> bool {
        self.image_path.is_file()
    }

    /// Remove the image file if present
    pub fn delete_image(&self) -> Result<()> {
        match fs::remove_file(&self.image_path) {
            Ok(()) => {
                info!("Deleted image {}", self.image_path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to delete {}: {}",
                self.image_path.display(),
                e
            ))),
        }
    }

    fn partition_backoff(&self) -> Backoff {
        Backoff::fixed(
            self.timing.partition_poll_attempts,
            Duration::from_millis(self.timing.partition_poll_interval_ms),
        )
    }

    /// Create, partition and format the image. No-op if it already exists.
    ///
    /// On formatting failure the half-built file is removed so the next call
    /// starts over.
    pub fn create_image(&self) -> Result<()> {
        if self.image_exists() {
            return Ok(());
        }

        if let Some(parent) = self.image_path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(
            "Creating image {} ({} MiB)",
            self.image_path.display(),
            self.size_bytes / 1024 / 1024
        );
        self.allocate()?;

        let formatted = if tools_available(&["losetup", "parted", "mkfs.vfat"]) {
            self.partition_and_format().or_else(|e| {
                warn!("Partitioning failed ({}), formatting whole image", e);
                self.format_whole_disk()
            })
        } else {
            info!("Partitioning tools unavailable, formatting whole image");
            self.format_whole_disk()
        };

        if let Err(e) = formatted {
            let _ = fs::remove_file(&self.image_path);
            return Err(e);
        }

        info!("Image ready: {}", self.image_path.display());
        Ok(())
    }

    /// Allocate exactly `size_bytes`, preferring fallocate
    fn allocate(&self) -> Result<()> {
        if tool_available("fallocate") {
            let len = self.size_bytes.to_string();
            match run(
                "fallocate",
                [OsStr::new("-l"), OsStr::new(&len), self.image_path.as_os_str()],
            ) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("fallocate failed, falling back to zero-fill: {}", e);
                    let _ = fs::remove_file(&self.image_path);
                }
            }
        }
        zero_fill(&self.image_path, self.size_bytes).map_err(|e| {
            let _ = fs::remove_file(&self.image_path);
            AppError::Storage(format!("Failed to allocate image: {}", e))
        })
    }

    fn partition_and_format(&self) -> Result<()> {
        let loop_dev = LoopDevice::attach(&self.image_path, false)?;
        let dev = loop_dev.device.as_str();

        run("parted", ["-s", dev, "mklabel", "msdos"])?;
        run(
            "parted",
            ["-s", dev, "mkpart", "primary", "fat32", PARTITION_START, "100%"],
        )?;
        run_best_effort("partprobe", [dev]);

        let mut node = None;
        self.partition_backoff().poll_until(|| {
            node = find_partition_node(dev);
            node.is_some()
        });
        let node = node.ok_or_else(|| {
            AppError::Storage(format!("Partition node for {} never appeared", dev))
        })?;

        run("mkfs.vfat", [OsStr::new("-F"), OsStr::new("32"), node.as_os_str()])?;
        debug!("Formatted {} as FAT32", node.display());
        Ok(())
    }

    fn format_whole_disk(&self) -> Result<()> {
        run(
            "mkfs.vfat",
            [OsStr::new("-F"), OsStr::new("32"), self.image_path.as_os_str()],
        )
    }

    /// Mount the image read-write. Best-effort; check `is_mounted`.
    pub fn mount_rw(&self) -> bool {
        self.mount(false)
    }

    /// Mount the image read-only. Best-effort; check `is_mounted`.
    pub fn mount_ro(&self) -> bool {
        self.mount(true)
    }

    fn mount(&self, read_only: bool) -> bool {
        if let Err(e) = fs::create_dir_all(&self.mount_dir) {
            warn!("Failed to create mount point {}: {}", self.mount_dir.display(), e);
            return false;
        }
        if self.is_mounted() {
            let current = fs::read_to_string("/proc/self/mounts")
                .ok()
                .and_then(|m| mounted_read_only(&m, &self.mount_dir));
            if current == Some(read_only) {
                debug!("{} already mounted", self.mount_dir.display());
                return true;
            }
            info!(
                "{} mounted with other options, remounting",
                self.mount_dir.display()
            );
            if !self.unmount() {
                warn!("Could not release existing mount at {}", self.mount_dir.display());
                return false;
            }
        }

        let target = self.mount_dir.to_string_lossy().to_string();
        let loop_opts = if read_only { "ro,loop" } else { "loop" };
        let mode = if read_only { "ro" } else { "rw" };

        let mounted = match tool_available("losetup")
            .then(|| LoopDevice::attach(&self.image_path, true))
        {
            Some(Ok(loop_dev)) => {
                let mut node = None;
                self.partition_backoff().poll_until(|| {
                    node = find_partition_node(&loop_dev.device);
                    node.is_some()
                });
                let source = node
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| loop_dev.device.clone());
                if run_best_effort("mount", ["-o", mode, source.as_str(), target.as_str()]) {
                    let device = loop_dev.keep();
                    debug!("Mounted {} ({}) at {}", source, device, target);
                    true
                } else {
                    false
                }
            }
            Some(Err(e)) => {
                debug!("Loop attach failed, mounting image directly: {}", e);
                self.mount_direct(loop_opts, &target)
            }
            None => self.mount_direct(loop_opts, &target),
        };

        if mounted {
            info!("Image mounted {} at {}", mode, target);
        } else {
            warn!("Failed to mount image at {}", target);
        }
        self.is_mounted()
    }

    fn mount_direct(&self, opts: &str, target: &str) -> bool {
        let image = self.image_path.to_string_lossy();
        run_best_effort("mount", ["-o", opts, &*image, target])
    }

    /// Unmount and detach every loop device still bound to the image.
    /// Returns whether the mount point is free afterwards.
    pub fn unmount(&self) -> bool {
        if self.is_mounted() && !run_best_effort("umount", [self.mount_dir.as_os_str()]) {
            warn!("umount {} failed", self.mount_dir.display());
        }
        self.detach_loop_devices();

        let settle = self.timing.unmount_settle();
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }

        let free = !self.is_mounted();
        if free {
            debug!("Image unmounted");
        }
        free
    }

    fn detach_loop_devices(&self) {
        if !tool_available("losetup") {
            return;
        }
        let output = match run_stdout("losetup", [OsStr::new("-j"), self.image_path.as_os_str()]) {
            Ok(out) => out,
            Err(e) => {
                debug!("losetup -j failed: {}", e);
                return;
            }
        };
        for dev in parse_loop_devices(&output) {
            if run_best_effort("losetup", ["-d", dev.as_str()]) {
                debug!("Detached leftover loop device {}", dev);
            } else {
                warn!("Failed to detach loop device {}", dev);
            }
        }
    }

    /// Whether the mount point is an active mount
    pub fn is_mounted(&self) -> bool {
        if tool_available("mountpoint") {
            return run_best_effort("mountpoint", [OsStr::new("-q"), self.mount_dir.as_os_str()]);
        }
        fs::read_to_string("/proc/self/mounts")
            .map(|m| mounts_contain(&m, &self.mount_dir))
            .unwrap_or(false)
    }

    /// Rewrite the volume label (or serial) so hosts re-read the media.
    /// Best-effort; returns whether any tool accepted the change.
    pub fn refresh_volume_metadata(&self) -> bool {
        if !self.image_exists() {
            return false;
        }

        // Partitioned images need a loop device to address the partition
        let loop_dev = if tool_available("losetup") {
            match LoopDevice::attach(&self.image_path, true) {
                Ok(l) => Some(l),
                Err(e) => {
                    debug!("Volume metadata refresh skipped: {}", e);
                    return false;
                }
            }
        } else {
            None
        };

        let target = match &loop_dev {
            Some(l) => {
                let mut node = None;
                self.partition_backoff().poll_until(|| {
                    node = find_partition_node(&l.device);
                    node.is_some()
                });
                node.map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| l.device.clone())
            }
            None => self.image_path.to_string_lossy().to_string(),
        };

        let now = chrono::Utc::now();
        let label = volume_label(&self.label_prefix, now.timestamp().max(0) as u64);

        let refreshed = ["fatlabel", "dosfslabel"]
            .into_iter()
            .filter(|tool| tool_available(tool))
            .any(|tool| run_best_effort(tool, [target.as_str(), label.as_str()]))
            || (tool_available("mlabel") && {
                let serial = format!("{:08X}", now.timestamp_millis() as u64 & 0xFFFF_FFFF);
                run_best_effort("mlabel", ["-i", target.as_str(), "-N", serial.as_str(), "::"])
            });

        if refreshed {
            debug!("Volume metadata refreshed on {} ({})", target, label);
        } else {
            debug!("No volume metadata tool succeeded on {}", target);
        }
        refreshed
    }
}

/// Exclusive read-write access to the image filesystem
pub trait ImageMount: Send + Sync {
    /// Mount read-write and return the filesystem root
    fn mount_read_write(&self) -> Result<PathBuf>;

    /// Drop the mount; returns whether nothing is left mounted
    fn release_mount(&self) -> bool;
}

impl ImageMount for ImageManager {
    fn mount_read_write(&self) -> Result<PathBuf> {
        if !self.mount_rw() {
            // Leave no loop device behind from a half-done mount
            self.unmount();
            return Err(AppError::Storage(format!(
                "Image is not mounted at {}",
                self.mount_dir.display()
            )));
        }
        Ok(self.mount_dir.clone())
    }

    fn release_mount(&self) -> bool {
        self.unmount()
    }
}

/// Read-write mount released on every exit path
pub struct MountGuard<'a> {
    mount: &'a dyn ImageMount,
    root: PathBuf,
    active: bool,
}

impl<'a> MountGuard<'a> {
    pub fn acquire(mount: &'a dyn ImageMount) -> Result<Self> {
        let root = mount.mount_read_write()?;
        Ok(Self {
            mount,
            root,
            active: true,
        })
    }

    /// Mount root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unmount now; returns whether the mount point is free
    pub fn release(mut self) -> bool {
        self.active = false;
        self.mount.release_mount()
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.mount.release_mount();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> ImageManager {
        let storage = StorageConfig {
            image_path: dir.join("data.img").to_string_lossy().to_string(),
            image_size_mb: 1,
            mount_dir: dir.join("mnt").to_string_lossy().to_string(),
            ..Default::default()
        };
        ImageManager::new(&storage, &TimingConfig::immediate())
    }

    #[test]
    fn test_partition_node_candidates() {
        let [p, n] = partition_node_candidates("/dev/loop3");
        assert_eq!(p, PathBuf::from("/dev/loop3p1"));
        assert_eq!(n, PathBuf::from("/dev/loop31"));
    }

    #[test]
    fn test_parse_loop_devices() {
        let out = "/dev/loop0: [2049]:131 (/var/lib/receiveit/data.img)\n\
                   /dev/loop7: [2049]:131 (/var/lib/receiveit/data.img)\n";
        assert_eq!(parse_loop_devices(out), vec!["/dev/loop0", "/dev/loop7"]);
        assert!(parse_loop_devices("").is_empty());
    }

    #[test]
    fn test_mounts_contain() {
        let mounts = "proc /proc proc rw 0 0\n\
                      /dev/loop0p1 /mnt/receive\\040it vfat rw 0 0\n";
        assert!(mounts_contain(mounts, Path::new("/mnt/receive it")));
        assert!(!mounts_contain(mounts, Path::new("/mnt")));
    }

    #[test]
    fn test_mounted_read_only() {
        let mounts = "proc /proc proc rw,nosuid 0 0\n\
                      /dev/loop0p1 /mnt/receiveit vfat ro,relatime,fmask=0022 0 0\n\
                      /dev/loop1 /mnt/other vfat rw,relatime 0 0\n";
        assert_eq!(mounted_read_only(mounts, Path::new("/mnt/receiveit")), Some(true));
        assert_eq!(mounted_read_only(mounts, Path::new("/mnt/other")), Some(false));
        assert_eq!(mounted_read_only(mounts, Path::new("/mnt")), None);

        // Remounted read-write on top of a read-only mount
        let stacked = format!("{}/dev/loop0p1 /mnt/receiveit vfat rw 0 0\n", mounts);
        assert_eq!(mounted_read_only(&stacked, Path::new("/mnt/receiveit")), Some(false));
    }

    struct CountingMount {
        root: PathBuf,
        released: std::sync::atomic::AtomicUsize,
    }

    impl ImageMount for CountingMount {
        fn mount_read_write(&self) -> Result<PathBuf> {
            Ok(self.root.clone())
        }

        fn release_mount(&self) -> bool {
            self.released
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_mount_guard_releases_once() {
        let mount = CountingMount {
            root: PathBuf::from("/mnt/receiveit"),
            released: Default::default(),
        };
        {
            let guard = MountGuard::acquire(&mount).unwrap();
            assert_eq!(guard.root(), Path::new("/mnt/receiveit"));
        }
        assert_eq!(mount.released.load(std::sync::atomic::Ordering::SeqCst), 1);

        let guard = MountGuard::acquire(&mount).unwrap();
        assert!(guard.release());
        assert_eq!(mount.released.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_volume_label_fits_fat() {
        let label = volume_label("RECEIVE", 1_700_012_345);
        assert_eq!(label, "RECEIVE2345");
        assert_eq!(label.len(), 11);

        let long = volume_label("averyverylongprefix", 7);
        assert_eq!(long, "AVERYVERYL7");

        assert_eq!(volume_label("", 42), "00000000042");
    }

    #[test]
    fn test_zero_fill_exact_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("z.img");
        let size = ZERO_CHUNK as u64 + 4097;
        zero_fill(&path, size).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_create_image_is_idempotent_when_present() {
        let dir = TempDir::new().unwrap();
        let images = manager(dir.path());
        fs::write(images.image_path(), b"existing").unwrap();

        images.create_image().unwrap();
        images.create_image().unwrap();
        assert_eq!(fs::read(images.image_path()).unwrap(), b"existing");
    }

    #[test]
    fn test_paths_are_absolute_and_delete() {
        let dir = TempDir::new().unwrap();
        let images = manager(dir.path());
        assert!(images.image_path().is_absolute());
        assert!(!images.image_exists());

        fs::write(images.image_path(), b"x").unwrap();
        assert!(images.image_exists());
        images.delete_image().unwrap();
        assert!(!images.image_exists());
        // Deleting a missing image is fine
        images.delete_image().unwrap();
    }

    #[test]
    fn test_absolute_path_relative() {
        let p = absolute_path(Path::new("data.img"));
        assert!(p.is_absolute());
        assert!(p.ends_with("data.img"));
    }
}

//! ConfigFS file operations for USB Gadget

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{AppError, Result};

/// Subdirectory of the ConfigFS mount holding USB gadgets
pub const USB_GADGET_DIR: &str = "usb_gadget";

/// USB spec version (USB 2.0)
pub const USB_BCD_USB: u16 = 0x0200;

/// English (US) string table id
pub const LANG_EN_US: &str = "0x409";

/// Check if ConfigFS is mounted at `configfs_root`
///
/// The mount point exists even without ConfigFS; the gadget subsystem
/// directory only appears once it is mounted.
pub fn is_configfs_available(configfs_root: &Path) -> bool {
    configfs_root.join(USB_GADGET_DIR).is_dir()
}

/// Find the first available UDC (USB Device Controller), sorted by name
pub fn find_udc(udc_class_dir: &Path) -> Option<String> {
    let mut udcs: Vec<String> = fs::read_dir(udc_class_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    udcs.sort();
    udcs.into_iter().next()
}

/// Write string content to an attribute file
///
/// sysfs/configfs attributes require a single write() syscall, so the
/// complete buffer including the trailing newline is built first.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    // Shell-style O_TRUNC first; some write-only attributes only accept plain O_WRONLY
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .or_else(|_| OpenOptions::new().write(true).open(path))
        .or_else(|e| {
            if path.exists() {
                Err(e)
            } else {
                File::create(path)
            }
        })
        .map_err(|e| AppError::Internal(format!("Failed to open {}: {}", path.display(), e)))?;

    let data: std::borrow::Cow<[u8]> = if content.ends_with('\n') {
        content.as_bytes().into()
    } else {
        let mut buf = content.as_bytes().to_vec();
        buf.push(b'\n');
        buf.into()
    };

    file.write_all(&data)
        .map_err(|e| AppError::Internal(format!("Failed to write to {}: {}", path.display(), e)))?;

    file.flush()
        .map_err(|e| AppError::Internal(format!("Failed to flush {}: {}", path.display(), e)))?;

    Ok(())
}

/// Read string content from a file, trimmed
pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| AppError::Internal(format!("Failed to read {}: {}", path.display(), e)))
}

/// Create directory if not exists
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        AppError::Internal(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

/// Remove a directory
///
/// ConfigFS directories are removed with a plain rmdir even though they
/// appear to contain attribute files. When rmdir refuses (a regular
/// directory tree), fall back to a recursive removal.
pub fn remove_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if fs::remove_dir(path).is_ok() {
        return Ok(());
    }
    fs::remove_dir_all(path).map_err(|e| {
        AppError::Internal(format!(
            "Failed to remove directory {}: {}",
            path.display(),
            e
        ))
    })
}

/// Remove a file or symlink (dangling links included)
pub fn remove_file(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path).map_err(|e| {
            AppError::Internal(format!("Failed to remove file {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// Check whether `path` is a symlink
pub fn is_link(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Create symlink
pub fn create_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(src, dest).map_err(|e| {
        AppError::Internal(format!(
            "Failed to create symlink {} -> {}: {}",
            dest.display(),
            src.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_trims_newline() {
        let dir = TempDir::new().unwrap();
        let attr = dir.path().join("file");
        write_file(&attr, "/data/image.img").unwrap();
        assert_eq!(fs::read_to_string(&attr).unwrap(), "/data/image.img\n");
        assert_eq!(read_file(&attr).unwrap(), "/data/image.img");

        // Shorter content must not leave stale bytes behind
        write_file(&attr, "").unwrap();
        assert_eq!(read_file(&attr).unwrap(), "");
    }

    #[test]
    fn test_configfs_needs_gadget_subsystem() {
        let dir = TempDir::new().unwrap();
        assert!(!is_configfs_available(dir.path()));
        create_dir(&dir.path().join(USB_GADGET_DIR)).unwrap();
        assert!(is_configfs_available(dir.path()));
    }

    #[test]
    fn test_find_udc_sorted() {
        let dir = TempDir::new().unwrap();
        assert!(find_udc(dir.path()).is_none());
        fs::create_dir(dir.path().join("musb-hdrc.1")).unwrap();
        fs::create_dir(dir.path().join("fe980000.usb")).unwrap();
        assert_eq!(find_udc(dir.path()).as_deref(), Some("fe980000.usb"));
        assert!(find_udc(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_remove_dir_falls_back_to_recursive() {
        let dir = TempDir::new().unwrap();
        let func = dir.path().join("mass_storage.0");
        create_dir(&func.join("lun.0")).unwrap();
        write_file(&func.join("lun.0").join("file"), "x").unwrap();
        remove_dir(&func).unwrap();
        assert!(!func.exists());
        // Missing directory is fine
        remove_dir(&func).unwrap();
    }

    #[test]
    fn test_symlink_helpers() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("acm.usb0");
        let link = dir.path().join("link");
        create_dir(&target).unwrap();
        create_symlink(&target, &link).unwrap();
        assert!(is_link(&link));
        assert!(!is_link(&target));
        remove_file(&link).unwrap();
        assert!(!is_link(&link));
        assert!(target.exists());
    }
}

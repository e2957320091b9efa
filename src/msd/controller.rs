//! MSD Controller
//!
//! Sequences gadget and image operations so the image is never mounted
//! locally while the host sees it as media:
//!
//! ```text
//! detach media -> mount rw -> apply deletions / merge uploads / clear
//!              -> unmount -> sync -> refresh volume metadata -> re-attach media
//! ```
//!
//! Mutating operations are serialized by an operation lock and run on the
//! blocking pool, since every step shells out or touches ConfigFS.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::image::{ImageManager, ImageMount, MountGuard};
use super::index::DirectoryIndex;
use super::manifest::PendingDeletions;
use super::staging::UploadStaging;
use super::types::{CommitReport, Listing, StatusResponse};
use crate::config::{AppConfig, TimingConfig};
use crate::error::{AppError, Result};
use crate::otg::{OtgGadgetManager, SwapOutcome};

/// How the image was handed back to the host
#[derive(Debug, Clone, PartialEq, Eq)]
enum Exposure {
    /// LUN media hot-swapped on an existing gadget
    Swapped(SwapOutcome),
    /// Gadget created from scratch
    Initialized,
    /// Gadget could not be created
    Unavailable(String),
}

impl Exposure {
    fn is_success(&self) -> bool {
        match self {
            Exposure::Swapped(outcome) => outcome.is_success(),
            Exposure::Initialized => true,
            Exposure::Unavailable(_) => false,
        }
    }

    fn swap(&self) -> Option<SwapOutcome> {
        match self {
            Exposure::Swapped(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

/// Remove a file, symlink or directory tree
fn remove_entry(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match remove_entry(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copy `src` to `dst`, replacing whatever is at `dst`.
///
/// The copy lands in a sibling first, so a failed copy leaves `dst` intact.
fn replace_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let name = dst
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no name"))?;
    let mut partial_name = std::ffi::OsString::from(".");
    partial_name.push(name);
    partial_name.push(".partial");
    let partial = dst.with_file_name(partial_name);

    remove_if_present(&partial)?;
    if let Err(e) = copy_tree(src, &partial) {
        let _ = remove_if_present(&partial);
        return Err(e);
    }
    if let Err(e) = remove_if_present(dst) {
        let _ = remove_if_present(&partial);
        return Err(e);
    }
    fs::rename(&partial, dst)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::metadata(src)?.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Exclusive read-write window on the image.
///
/// Opening takes the media away from the host and mounts the image. The
/// image is never mounted while the host can still reach it. Closing, or
/// dropping on an error path, unmounts and hands the media back.
struct ExclusiveWindow<'a> {
    controller: &'a MsdController,
    mount: Option<MountGuard<'a>>,
    exposure: Option<Exposure>,
}

impl<'a> ExclusiveWindow<'a> {
    fn open(controller: &'a MsdController) -> Result<Self> {
        let mut window = Self {
            controller,
            mount: None,
            exposure: None,
        };

        if controller.gadget.is_bound() {
            if !controller.gadget.withdraw_media() {
                return Err(AppError::Storage(
                    "Media is still exposed to the host, refusing to mount the image".to_string(),
                ));
            }
            controller.pause(controller.timing.detach_pause());
        }

        controller.image.create_image()?;
        window.mount = Some(MountGuard::acquire(controller.mount.as_ref())?);
        Ok(window)
    }

    fn root(&self) -> &Path {
        match &self.mount {
            Some(mount) => mount.root(),
            None => self.controller.image.mount_dir(),
        }
    }

    fn release(&mut self) -> Exposure {
        if let Some(exposure) = &self.exposure {
            return exposure.clone();
        }
        // Only a mounted image has local changes to flush
        if let Some(mount) = self.mount.take() {
            if !mount.release() {
                warn!("Image still mounted after unmount");
            }
            nix::unistd::sync();
            self.controller.image.refresh_volume_metadata();
        }

        let exposure = self.controller.expose_media();
        self.exposure = Some(exposure.clone());
        exposure
    }

    fn close(mut self) -> Exposure {
        self.release()
    }
}

impl Drop for ExclusiveWindow<'_> {
    fn drop(&mut self) {
        if self.exposure.is_none() {
            warn!("Exclusive image window aborted, restoring media");
            self.release();
        }
    }
}

/// MSD Controller
pub struct MsdController {
    gadget: Arc<OtgGadgetManager>,
    image: Arc<ImageManager>,
    /// Read-write access used inside the exclusive window
    mount: Arc<dyn ImageMount>,
    manifest: Arc<PendingDeletions>,
    staging: Arc<UploadStaging>,
    index: Arc<DirectoryIndex>,
    timing: TimingConfig,
    /// Operation mutex lock (prevents concurrent operations)
    operation_lock: Mutex<()>,
}

impl MsdController {
    pub fn new(
        gadget: Arc<OtgGadgetManager>,
        image: Arc<ImageManager>,
        manifest: Arc<PendingDeletions>,
        staging: Arc<UploadStaging>,
        index: Arc<DirectoryIndex>,
        timing: TimingConfig,
    ) -> Self {
        let mount: Arc<dyn ImageMount> = image.clone();
        Self {
            gadget,
            image,
            mount,
            manifest,
            staging,
            index,
            timing,
            operation_lock: Mutex::new(()),
        }
    }

    /// Replace how the image is mounted for read-write work
    pub fn with_mount(mut self, mount: Arc<dyn ImageMount>) -> Self {
        self.mount = mount;
        self
    }

    /// Wire every component from configuration
    pub fn from_config(config: &AppConfig) -> Self {
        let image = Arc::new(ImageManager::new(&config.storage, &config.timing));
        let gadget = Arc::new(OtgGadgetManager::new(
            &config.gadget,
            &config.timing,
            image.image_path(),
        ));
        let index = Arc::new(DirectoryIndex::for_image(image.image_path()));
        Self::new(
            gadget,
            image,
            Arc::new(PendingDeletions::new(config.storage.manifest_path())),
            Arc::new(UploadStaging::new(config.storage.upload_dir())),
            index,
            config.timing.clone(),
        )
    }

    pub fn gadget(&self) -> &Arc<OtgGadgetManager> {
        &self.gadget
    }

    pub fn image(&self) -> &Arc<ImageManager> {
        &self.image
    }

    pub fn manifest(&self) -> &Arc<PendingDeletions> {
        &self.manifest
    }

    pub fn staging(&self) -> &Arc<UploadStaging> {
        &self.staging
    }

    pub fn index(&self) -> &Arc<DirectoryIndex> {
        &self.index
    }

    fn pause(&self, duration: std::time::Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    /// Hand the image to the host: hot-swap on an existing gadget, or create it
    fn expose_media(&self) -> Exposure {
        if self.gadget.is_initialized() {
            return Exposure::Swapped(self.gadget.replace_media(self.image.image_path()));
        }
        match self.gadget.init(&self.image) {
            Ok(()) => Exposure::Initialized,
            Err(e) => {
                warn!("Gadget initialization failed: {}", e);
                Exposure::Unavailable(e.to_string())
            }
        }
    }

    fn refresh_index(&self) {
        self.index.invalidate();
        self.index.spawn_rebuild();
    }

    fn finish(&self, mut report: CommitReport, exposure: Exposure) -> CommitReport {
        report.success = exposure.is_success();
        report.swap = exposure.swap();
        if let Exposure::Unavailable(reason) = &exposure {
            warn!("Media not exposed to host: {}", reason);
        }
        self.refresh_index();
        report
    }

    /// Apply pending deletions and merge staged uploads into the image
    pub fn commit_blocking(&self) -> Result<CommitReport> {
        let staged = self.staging.items()?;
        info!("Commit started ({} staged items)", staged.len());

        let window = ExclusiveWindow::open(self)?;
        let root = window.root().to_path_buf();
        let mut report = CommitReport {
            deletions: self.manifest.apply_to(&root)?,
            ..Default::default()
        };

        for src in staged {
            let Some(name) = src.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            match replace_or_copy(&src, &root.join(&name)) {
                Ok(()) => {
                    if let Err(e) = remove_entry(&src) {
                        warn!("Copied {} but could not remove staged original: {}", name, e);
                    }
                    debug!("Committed {}", name);
                    report.copied.push(name);
                }
                Err(e) => {
                    warn!("Failed to commit {}: {}", name, e);
                    report.failed.push(name);
                }
            }
        }

        let exposure = window.close();
        let report = self.finish(report, exposure);
        info!(
            "Commit finished: {} copied, {} failed, success={}",
            report.copied.len(),
            report.failed.len(),
            report.success
        );
        Ok(report)
    }

    /// Re-expose the current image without touching its contents
    pub fn reload_blocking(&self) -> Result<CommitReport> {
        info!("Reload started");
        if self.image.is_mounted() && !self.image.unmount() {
            return Err(AppError::Storage(
                "Image is mounted locally and could not be released".to_string(),
            ));
        }
        nix::unistd::sync();
        self.image.refresh_volume_metadata();

        let exposure = self.expose_media();
        Ok(self.finish(CommitReport::default(), exposure))
    }

    /// Delete every top-level entry of the image
    pub fn clear_blocking(&self) -> Result<CommitReport> {
        info!("Clear started");
        let window = ExclusiveWindow::open(self)?;
        let mut report = CommitReport::default();

        for entry in fs::read_dir(window.root())?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            match remove_entry(&entry.path()) {
                Ok(()) => report.cleared.push(name),
                Err(e) => {
                    warn!("Failed to remove {}: {}", name, e);
                    report.failed.push(name);
                }
            }
        }
        report.cleared.sort();

        let exposure = window.close();
        Ok(self.finish(report, exposure))
    }

    /// Bring image and gadget into a serving state after process start
    pub fn startup_blocking(&self) -> Result<()> {
        self.staging.remove_partial_uploads();

        if !self.image.image_exists() {
            self.image.create_image()?;
        }

        if self.image.is_mounted() {
            info!("Image left mounted by a previous run, unmounting");
            self.image.unmount();
        }

        if !self.gadget.is_ready() {
            warn!("USB gadget support not ready, serving without media");
        } else if !self.gadget.is_initialized() {
            self.gadget.init(&self.image)?;
        } else if self.gadget.lun_file().is_none() {
            info!("Gadget has no media, attaching image");
            if !self.gadget.attach_media(self.image.image_path()) {
                warn!("Re-attaching image at startup failed");
            }
        }

        self.index.spawn_rebuild();
        Ok(())
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            ready: self.gadget.is_ready(),
            initialized: self.gadget.is_initialized(),
            bound: self.gadget.is_bound(),
            state: self.gadget.state(),
            image_exists: self.image.image_exists(),
            mounted: self.image.is_mounted(),
            lun_file: self
                .gadget
                .lun_file()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }

    async fn run_exclusive<T, F>(self: &Arc<Self>, what: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MsdController) -> Result<T> + Send + 'static,
    {
        let _guard = self.operation_lock.lock().await;
        let controller = self.clone();
        tokio::task::spawn_blocking(move || op(&controller))
            .await
            .map_err(|e| AppError::Internal(format!("{} task failed: {}", what, e)))?
    }

    async fn run_blocking<T, F>(self: &Arc<Self>, what: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MsdController) -> Result<T> + Send + 'static,
    {
        let controller = self.clone();
        tokio::task::spawn_blocking(move || op(&controller))
            .await
            .map_err(|e| AppError::Internal(format!("{} task failed: {}", what, e)))?
    }

    pub async fn commit(self: &Arc<Self>) -> Result<CommitReport> {
        self.run_exclusive("Commit", |c| c.commit_blocking()).await
    }

    pub async fn reload(self: &Arc<Self>) -> Result<CommitReport> {
        self.run_exclusive("Reload", |c| c.reload_blocking()).await
    }

    pub async fn clear(self: &Arc<Self>) -> Result<CommitReport> {
        self.run_exclusive("Clear", |c| c.clear_blocking()).await
    }

    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.run_exclusive("Startup", |c| c.startup_blocking()).await
    }

    pub async fn status_async(self: &Arc<Self>) -> Result<StatusResponse> {
        self.run_blocking("Status", |c| Ok(c.status())).await
    }

    /// Listing of `path` inside the image (root when `None`)
    pub async fn list(self: &Arc<Self>, path: Option<String>) -> Result<Listing> {
        self.run_blocking("Listing", move |c| match path.as_deref() {
            None | Some("") | Some("/") => c.index.list_root(),
            Some(p) => c.index.list_path(p),
        })
        .await
    }

    /// File content read from the raw image
    pub async fn read_file(self: &Arc<Self>, path: String) -> Result<Vec<u8>> {
        self.run_blocking("Download", move |c| c.index.read_file(&path))
            .await
    }

    /// Staged upload names
    pub fn list_upload(&self) -> Result<Vec<String>> {
        self.staging.list()
    }

    /// Mark a path for deletion on the next commit
    pub async fn mark_deleted(self: &Arc<Self>, path: String) -> Result<()> {
        self.run_blocking("Mark deletion", move |c| c.manifest.add(&path))
            .await
    }

    /// Cancel a pending deletion; false when none was pending
    pub async fn unmark_deleted(self: &Arc<Self>, path: String) -> Result<bool> {
        self.run_blocking("Unmark deletion", move |c| c.manifest.remove(&path))
            .await
    }

    /// Pending deletions, sorted
    pub async fn pending_deletions(self: &Arc<Self>) -> Result<Vec<String>> {
        self.run_blocking("Pending deletions", |c| c.manifest.entries())
            .await
    }
}

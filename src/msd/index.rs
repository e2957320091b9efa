//! Directory index over the raw image
//!
//! The image cannot be mounted while the host owns it, so listings are read
//! straight from the FAT structures with a forensic reader (Sleuth Kit `fls`
//! and `icat`). Per-directory listings need the directory's inode, which is
//! resolved through a cache built by one recursive scan.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::layout::ImageLayout;
use super::types::Listing;
use crate::error::{AppError, Result};
use crate::utils::cmd::run_output;

/// FAT root directory inode in Sleuth Kit numbering
pub const FAT_ROOT_INODE: u64 = 2;

/// Exact names of filesystem and OS bookkeeping entries
const METADATA_NAMES: &[&str] = &[
    "System Volume Information",
    ".Trashes",
    ".Trash-1000",
    ".Spotlight-V100",
    ".fseventsd",
    ".TemporaryItems",
    ".DocumentRevisions-V100",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "$RECYCLE.BIN",
];

/// Suffix Sleuth Kit gives the volume label pseudo-entry
const VOLUME_LABEL_SUFFIX: &str = "(Volume Label Entry)";

/// Whether any component of `path` is filesystem or OS metadata
pub fn is_metadata(path: &str) -> bool {
    path.split('/').filter(|c| !c.is_empty()).any(|c| {
        c.starts_with('$')
            || c.starts_with("._")
            || c.ends_with(VOLUME_LABEL_SUFFIX)
            || METADATA_NAMES.contains(&c)
    })
}

/// Normalize a directory path to `/a/b` form; the root is `/`
pub fn normalize_dir(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Virtual or special entries (`v/v`, `V/V`, links)
    Other,
}

/// One line of `fls` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlsEntry {
    pub kind: EntryKind,
    pub inode: u64,
    pub deleted: bool,
    /// Name, or full path relative to the listed directory with `-p`
    pub name: String,
}

/// Parse a single `fls` line such as `d/d 6:\tphotos` or `r/r * 9(realloc):\told.txt`
pub fn parse_fls_line(line: &str) -> Option<FlsEntry> {
    let (head, name) = line.split_once('\t').or_else(|| line.split_once(": "))?;
    let head = head.trim_end().strip_suffix(':').unwrap_or(head.trim_end());
    let name = name.trim_end_matches(['\r', '\n']);
    if name.is_empty() {
        return None;
    }

    // Recursive listings without -p indent with '+' tokens
    let mut tokens = head
        .split_whitespace()
        .filter(|t| !t.chars().all(|c| c == '+'));
    let type_token = tokens.next()?;
    let rest: Vec<&str> = tokens.collect();
    let deleted = rest.contains(&"*");
    let inode_token = rest.iter().rev().find(|t| **t != "*")?;

    let digits: String = inode_token
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let inode = digits.parse().ok()?;

    let kind = match type_token.chars().next()? {
        'r' => EntryKind::File,
        'd' => EntryKind::Directory,
        _ => EntryKind::Other,
    };

    Some(FlsEntry {
        kind,
        inode,
        deleted,
        name: name.to_string(),
    })
}

/// Parse `fls` output, dropping unparsable lines
pub fn parse_fls(output: &str) -> Vec<FlsEntry> {
    output.lines().filter_map(parse_fls_line).collect()
}

/// Build a sorted listing from one directory's entries
pub fn to_listing(entries: &[FlsEntry]) -> Listing {
    let mut listing = Listing::default();
    for entry in entries {
        if entry.deleted || is_metadata(&entry.name) || entry.name == "." || entry.name == ".." {
            continue;
        }
        match entry.kind {
            EntryKind::File => listing.files.push(entry.name.clone()),
            EntryKind::Directory => listing.directories.push(format!("{}/", entry.name)),
            EntryKind::Other => {}
        }
    }
    listing.files.sort();
    listing.directories.sort();
    listing
}

/// Reads FAT directory entries from an unmounted image
pub trait ForensicReader: Send + Sync {
    /// `fls` output for the directory `inode` (root when `None`).
    /// Recursive listings carry full paths.
    fn list(&self, inode: Option<u64>, recursive: bool) -> Result<String>;

    /// `fls -a` output for one directory, including `.` and `..`
    fn list_with_dots(&self, inode: u64) -> Result<String>;

    /// File content by inode
    fn read(&self, inode: u64) -> Result<Vec<u8>>;
}

/// Sleuth Kit backed reader
pub struct SleuthKitReader {
    image: PathBuf,
}

impl SleuthKitReader {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
        }
    }

    /// `-o <sectors>` for partitioned images
    fn offset_args(&self) -> Result<Vec<OsString>> {
        let layout = ImageLayout::probe(&self.image)?;
        Ok(match layout {
            ImageLayout::WholeDisk => Vec::new(),
            ImageLayout::Partitioned { start_sector } => {
                vec!["-o".into(), start_sector.to_string().into()]
            }
        })
    }

    fn fls(&self, flags: &[&str], inode: Option<u64>) -> Result<String> {
        let mut args = self.offset_args()?;
        args.extend(flags.iter().map(OsString::from));
        args.push(self.image.clone().into_os_string());
        if let Some(inode) = inode {
            args.push(inode.to_string().into());
        }
        let output = run_output("fls", &args)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ForensicReader for SleuthKitReader {
    fn list(&self, inode: Option<u64>, recursive: bool) -> Result<String> {
        let flags: &[&str] = if recursive { &["-r", "-p"] } else { &[] };
        self.fls(flags, inode)
    }

    fn list_with_dots(&self, inode: u64) -> Result<String> {
        self.fls(&["-a"], Some(inode))
    }

    fn read(&self, inode: u64) -> Result<Vec<u8>> {
        let mut args = self.offset_args()?;
        args.push(self.image.clone().into_os_string());
        args.push(inode.to_string().into());
        Ok(run_output("icat", &args)?.stdout)
    }
}

type DirCache = Arc<HashMap<String, u64>>;

/// Directory index with an inode cache
///
/// Every invalidation bumps `generation`; a scan that started before the
/// bump never replaces the cache.
pub struct DirectoryIndex {
    reader: Arc<dyn ForensicReader>,
    cache: RwLock<Option<DirCache>>,
    generation: AtomicU64,
    rebuilding: AtomicBool,
    /// A rebuild was requested while one was running
    rerun: AtomicBool,
}

impl DirectoryIndex {
    pub fn new(reader: Arc<dyn ForensicReader>) -> Self {
        Self {
            reader,
            cache: RwLock::new(None),
            generation: AtomicU64::new(0),
            rebuilding: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    /// Index backed by Sleuth Kit over `image`
    pub fn for_image(image: &Path) -> Self {
        Self::new(Arc::new(SleuthKitReader::new(image)))
    }

    /// Top-level entries
    pub fn list_root(&self) -> Result<Listing> {
        let output = self.reader.list(None, false)?;
        Ok(to_listing(&parse_fls(&output)))
    }

    /// Entries of the directory with the given inode, bypassing the cache
    pub fn list_inode(&self, inode: u64) -> Result<Listing> {
        let output = self.reader.list(Some(inode), false)?;
        Ok(to_listing(&parse_fls(&output)))
    }

    /// Entries of a directory inside the image
    pub fn list_path(&self, path: &str) -> Result<Listing> {
        let dir = normalize_dir(path);
        if dir == "/" {
            return self.list_root();
        }
        if is_metadata(&dir) {
            return Err(AppError::NotFound(format!("Directory not found: {}", dir)));
        }

        let inode = match self.cached_inode(&dir) {
            Some(inode) => inode,
            None => {
                debug!("Directory cache miss for {}, rebuilding", dir);
                self.rebuild_cache()?
                    .get(&dir)
                    .copied()
                    .ok_or_else(|| AppError::NotFound(format!("Directory not found: {}", dir)))?
            }
        };
        self.list_inode(inode)
    }

    fn cached_inode(&self, dir: &str) -> Option<u64> {
        self.cache.read().as_ref()?.get(dir).copied()
    }

    /// Whether a cache is currently held
    pub fn is_cached(&self) -> bool {
        self.cache.read().is_some()
    }

    /// Scan the whole image and replace the directory cache.
    ///
    /// The scan result is returned either way, but it is only stored when no
    /// invalidation happened while scanning.
    pub fn rebuild_cache(&self) -> Result<DirCache> {
        let generation = self.generation.load(Ordering::Acquire);
        let output = self.reader.list(None, true)?;
        let mut dirs = HashMap::new();

        for entry in parse_fls(&output) {
            if entry.deleted || entry.kind != EntryKind::Directory || is_metadata(&entry.name) {
                continue;
            }
            dirs.insert(normalize_dir(&entry.name), entry.inode);
        }

        if !dirs.contains_key("/") {
            let root = self.root_inode(&dirs);
            dirs.insert("/".to_string(), root);
        }

        let dirs = Arc::new(dirs);
        let mut cache = self.cache.write();
        if self.generation.load(Ordering::Acquire) == generation {
            *cache = Some(dirs.clone());
            info!("Directory cache rebuilt ({} directories)", dirs.len());
        } else {
            debug!("Image changed during scan, discarding directory cache");
        }
        Ok(dirs)
    }

    /// Recover the root inode from the `..` entry of a top-level directory
    fn root_inode(&self, dirs: &HashMap<String, u64>) -> u64 {
        let top_level = dirs
            .iter()
            .find(|(path, _)| path.matches('/').count() == 1)
            .map(|(_, inode)| *inode);

        let recovered = top_level.and_then(|inode| {
            let output = self.reader.list_with_dots(inode).ok()?;
            parse_fls(&output)
                .into_iter()
                .find(|e| e.name == ".." && e.kind == EntryKind::Directory)
                .map(|e| e.inode)
        });

        recovered.unwrap_or(FAT_ROOT_INODE)
    }

    /// Drop the cache; the next lookup rebuilds it
    pub fn invalidate(&self) {
        let mut cache = self.cache.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        *cache = None;
        debug!("Directory cache invalidated");
    }

    /// Rebuild the cache on a blocking task.
    ///
    /// At most one rebuild runs at a time. A request arriving while one runs
    /// makes that job scan again once it finishes.
    pub fn spawn_rebuild(self: &Arc<Self>) {
        self.rerun.store(true, Ordering::Release);
        if self.rebuilding.swap(true, Ordering::AcqRel) {
            debug!("Directory cache rebuild already running, queued another pass");
            return;
        }

        let index = self.clone();
        let job = move || loop {
            while index.rerun.swap(false, Ordering::AcqRel) {
                if let Err(e) = index.rebuild_cache() {
                    warn!("Background directory cache rebuild failed: {}", e);
                }
            }
            index.rebuilding.store(false, Ordering::Release);
            // A request may have landed between the last check and the release
            if !index.rerun.load(Ordering::Acquire)
                || index.rebuilding.swap(true, Ordering::AcqRel)
            {
                break;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    /// Read a file's content without mounting the image
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = normalize_dir(path);
        if target == "/" || is_metadata(&target) {
            return Err(AppError::NotFound(format!("File not found: {}", target)));
        }

        let output = self.reader.list(None, true)?;
        let inode = parse_fls(&output)
            .into_iter()
            .find(|e| {
                !e.deleted && e.kind == EntryKind::File && normalize_dir(&e.name) == target
            })
            .map(|e| e.inode)
            .ok_or_else(|| AppError::NotFound(format!("File not found: {}", target)))?;

        self.reader.read(inode)
    }
}

//! Drop box data types

use serde::{Deserialize, Serialize};

use super::manifest::ApplyReport;
use crate::otg::{GadgetState, SwapOutcome};

/// Directory listing inside the image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// Regular files, sorted
    pub files: Vec<String>,
    /// Directories, sorted, each suffixed with `/`
    pub directories: Vec<String>,
}

/// Staging area listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadListing {
    pub names: Vec<String>,
}

/// Result of a commit, reload or clear
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitReport {
    /// Media swapped back in (or gadget initialized) successfully
    pub success: bool,
    /// Staged items copied into the image
    pub copied: Vec<String>,
    /// Staged items that failed to copy; left in the staging area
    pub failed: Vec<String>,
    /// Top-level entries removed by a clear
    pub cleared: Vec<String>,
    /// Pending deletions applied during the commit
    pub deletions: ApplyReport,
    /// Media hot-swap details; `None` when the gadget was initialized instead
    pub swap: Option<SwapOutcome>,
}

/// Readiness probes for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// ConfigFS mounted and a UDC present
    pub ready: bool,
    pub initialized: bool,
    pub bound: bool,
    pub state: GadgetState,
    pub image_exists: bool,
    pub mounted: bool,
    /// Current LUN backing file
    pub lun_file: Option<String>,
}

/// Body for the mark/unmark deletion endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

/// Query for listing and download endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: Option<String>,
}

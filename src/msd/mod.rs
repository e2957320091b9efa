//! MSD (Mass Storage Device) drop box
//!
//! The backing image is shared between two owners: the USB host (as LUN
//! media) and this process (as a loop-mounted filesystem). Only the
//! controller moves it between them.
//!
//! Architecture:
//! ```text
//! Web API --> MsdController --> OtgGadgetManager --> Host PC
//!                 |
//!        ┌────────┼──────────────┬──────────────┐
//!        │        │              │              │
//!  ImageManager  PendingDeletions  UploadStaging  DirectoryIndex
//!  (loop/mkfs)   (manifest file)   (scratch dir)  (fls/icat, no mount)
//! ```

pub mod controller;
pub mod image;
pub mod index;
pub mod layout;
pub mod manifest;
pub mod staging;
pub mod types;

pub use controller::MsdController;
pub use image::{ImageManager, ImageMount, MountGuard};
pub use index::{DirectoryIndex, ForensicReader, SleuthKitReader};
pub use layout::ImageLayout;
pub use manifest::{ApplyReport, PendingDeletions};
pub use staging::UploadStaging;
pub use types::{CommitReport, Listing, PathQuery, PathRequest, StatusResponse, UploadListing};

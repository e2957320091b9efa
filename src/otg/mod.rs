//! OTG USB Gadget management
//!
//! One composite gadget with two functions:
//! - ACM serial console
//! - MSD (Mass Storage Device) exposing the backing image
//!
//! Architecture:
//! ```text
//! OtgGadgetManager (gadget lifecycle, media hot-swap)
//!     ├── AcmFunction  (acm.usb0)
//!     └── MsdFunction  (mass_storage.0, lun.0)
//! ```
//!
//! All state lives in ConfigFS; the manager only carries paths and timing.

pub mod acm;
pub mod configfs;
pub mod function;
pub mod manager;
pub mod msd;

pub use acm::AcmFunction;
pub use function::GadgetFunction;
pub use manager::{GadgetState, OtgGadgetManager, SwapOutcome};
pub use msd::MsdFunction;

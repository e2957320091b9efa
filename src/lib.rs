//! ReceiveIt - USB gadget file drop box
//!
//! Files uploaded over HTTP are merged into a FAT32 image that the host
//! machine sees as an ordinary USB stick. The device also exposes a serial
//! console on the same composite gadget.

pub mod config;
pub mod error;
pub mod msd;
pub mod otg;
pub mod state;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};

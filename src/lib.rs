//! RCP firmware update engine for an ESP32-based Thread Border Router.
//!
//! Covers the whole update pipeline for the radio co-processor: downloading
//! a combined border-router image (or the discrete RCP file set) over HTTP,
//! incrementally parsing the multi-subfile container as it streams in,
//! staging the image in one of two A/B slot directories with power-loss-safe
//! bookkeeping, and flashing the staged slot to the chip over the serial
//! bootloader protocol.
//!
//! Platform services are injected through the [`platform`] traits, so the
//! engine itself is hardware-independent and tested on the host.

pub mod config;
pub mod download;
pub mod error;
pub mod flasher;
pub mod image;
pub mod ota;
pub mod platform;
pub mod slots;

pub use config::UpdateConfig;
pub use error::{Result, UpdateError};
pub use flasher::RcpFlasher;
pub use image::SubfileTag;
pub use ota::{OtaHandle, OtaReceiver, OtaState};
pub use slots::UpdateSequencer;

//! RCP flashing driver.
//!
//! Programs the current firmware slot into the co-processor over the serial
//! bootloader protocol, file by file per the slot's flash-argument manifest,
//! then resets the chip into the new image.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::image::{parse_flash_args, FlashArg, FLASH_ARGS_FILENAME};
use crate::platform::{NvsStore, RcpBootloaderPort, ResetControl};
use crate::slots::UpdateSequencer;

/// Payload bytes per bootloader write packet.
pub const FLASH_PACKET_SIZE: usize = 1024;

/// Settling time around reset-line transitions.
const RESET_SETTLE_MS: u32 = 100;

pub struct RcpFlasher<P: RcpBootloaderPort, R: ResetControl> {
    port: P,
    pins: R,
    config: UpdateConfig,
}

impl<P: RcpBootloaderPort, R: ResetControl> RcpFlasher<P, R> {
    pub fn new(port: P, pins: R, config: UpdateConfig) -> Self {
        Self { port, pins, config }
    }

    /// Flash the current slot to the co-processor.
    ///
    /// Per-file failures are retried up to `max_flash_retries`; past that
    /// the error is [`UpdateError::FlashFatal`] and the chip may be left
    /// half-flashed. Callers must not retry a fatal outcome automatically:
    /// a half-written bootloader has no safe automatic fallback.
    pub fn update(&mut self, slots: &mut UpdateSequencer<impl NvsStore>) -> Result<()> {
        let dir = slots.current_firmware_dir();
        log::info!("starting RCP update from {}", dir.display());

        self.enter_download_mode()?;
        self.port.connect()?;

        let found = self.port.target_chip()?;
        if found != self.config.target_chip {
            return Err(UpdateError::UnsupportedChip {
                expected: self.config.target_chip.to_string(),
                found: found.to_string(),
            });
        }
        if self.config.update_baud_rate > self.config.baud_rate {
            self.port.change_baud(self.config.update_baud_rate)?;
        }

        let manifest_path = dir.join(FLASH_ARGS_FILENAME);
        let manifest = std::fs::read_to_string(&manifest_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpdateError::NotFound(manifest_path.display().to_string())
            } else {
                UpdateError::Io(e)
            }
        })?;
        let args = parse_flash_args(&manifest)?;
        if args.is_empty() {
            log::warn!("{} names no files", manifest_path.display());
        }

        for arg in &args {
            self.flash_file_with_retries(&dir, arg)?;
        }

        slots.record_applied()?;
        log::info!("RCP update applied (seq {})", slots.current_seq());
        self.reset()
    }

    /// Hardware reset pulse into normal boot, without touching flash. For
    /// recovering a wedged co-processor.
    pub fn reset(&mut self) -> Result<()> {
        self.pins.set_boot_pin(true)?;
        self.pulse_reset()
    }

    fn enter_download_mode(&mut self) -> Result<()> {
        // Boot strap low selects the serial bootloader on the next reset.
        self.pins.set_boot_pin(false)?;
        self.pulse_reset()
    }

    fn pulse_reset(&mut self) -> Result<()> {
        self.pins.delay_ms(RESET_SETTLE_MS);
        self.pins.set_reset_pin(false)?;
        self.pins.delay_ms(RESET_SETTLE_MS);
        self.pins.set_reset_pin(true)?;
        self.pins.delay_ms(RESET_SETTLE_MS);
        Ok(())
    }

    fn flash_file_with_retries(&mut self, dir: &Path, arg: &FlashArg) -> Result<()> {
        let path = dir.join(&arg.path);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.flash_file(&path, arg.offset) {
                Ok(()) => return Ok(()),
                Err(e @ UpdateError::NotFound(_)) => return Err(e),
                Err(e) if attempts <= self.config.max_flash_retries => {
                    log::warn!(
                        "flashing {} failed (attempt {attempts}): {e}",
                        path.display()
                    );
                }
                Err(e) => {
                    return Err(UpdateError::FlashFatal(format!(
                        "{} after {attempts} attempts: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn flash_file(&mut self, path: &Path, offset: u32) -> Result<()> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpdateError::NotFound(path.display().to_string())
            } else {
                UpdateError::Io(e)
            }
        })?;
        let size = file.metadata()?.len() as u32;
        log::info!("flashing {} ({size} bytes) at {:#x}", path.display(), offset);

        self.port.flash_begin(offset, size)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; FLASH_PACKET_SIZE];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            self.port.flash_data(&buf[..read])?;
        }
        let digest: [u8; 32] = hasher.finalize().into();
        self.port.flash_verify(offset, size, &digest)?;
        log::debug!(
            "verified {:#x}..{:#x} sha256={}",
            offset,
            offset + size,
            hex::encode(digest)
        );
        Ok(())
    }
}

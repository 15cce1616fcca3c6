//! A/B firmware slot bookkeeping.
//!
//! Two on-disk slot directories alternate as download target and flashing
//! source. Which slot is current, and whether its image has been verified,
//! is a single byte in non-volatile storage so the state survives power loss
//! at any point of an update.

use std::path::PathBuf;

use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::image::VERSION_FILENAME;
use crate::platform::NvsStore;

/// Packed slot record key: bit 0 = current seq, bit 5 = verified flag.
/// The layout is wire-compatible with deployed devices.
const KEY_UPDATE_SEQ: &str = "update_seq";

/// Sequence number last flashed to the RCP, written by the flasher.
const KEY_APPLIED_SEQ: &str = "applied_seq";

const SEQ_BIT: u8 = 0x01;
const VERIFIED_BIT: u8 = 1 << 5;

fn encode(seq: u8, verified: bool) -> u8 {
    (seq & SEQ_BIT) | if verified { VERIFIED_BIT } else { 0 }
}

fn decode(record: u8) -> (u8, bool) {
    (record & SEQ_BIT, record & VERIFIED_BIT != 0)
}

pub struct UpdateSequencer<S: NvsStore> {
    store: S,
    config: UpdateConfig,
    current: u8,
    verified: bool,
    // Set when a download targets the next slot; consumed by submit so a
    // repeated submit does not flip back.
    staged: bool,
}

impl<S: NvsStore> UpdateSequencer<S> {
    /// Load the persisted slot record. A device with no record is on its
    /// factory image: seq 0, verified.
    pub fn init(store: S, config: UpdateConfig) -> Result<Self> {
        let (current, verified) = match store.get_u8(KEY_UPDATE_SEQ)? {
            Some(record) => decode(record),
            None => (0, true),
        };
        log::info!("update slot state: seq {current}, verified {verified}");
        Ok(Self {
            store,
            config,
            current,
            verified,
            staged: false,
        })
    }

    pub fn current_seq(&self) -> u8 {
        self.current
    }

    pub fn next_seq(&self) -> u8 {
        1 - self.current
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn firmware_dir(&self, seq: u8) -> PathBuf {
        self.config.firmware_dir_for(seq)
    }

    pub fn current_firmware_dir(&self) -> PathBuf {
        self.firmware_dir(self.current)
    }

    pub fn next_firmware_dir(&self) -> PathBuf {
        self.firmware_dir(self.next_seq())
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Record that a new image is being placed in the next slot. Called by
    /// the download paths; makes the following `submit` flip slots.
    pub fn stage_next_slot(&mut self) {
        self.staged = true;
    }

    fn persist(&mut self) -> Result<()> {
        self.store
            .set_u8(KEY_UPDATE_SEQ, encode(self.current, self.verified))?;
        self.store.commit()
    }

    /// Make the freshly downloaded slot current and mark it verified.
    /// Without a staged download this only re-persists the existing record.
    pub fn submit(&mut self) -> Result<u8> {
        if self.staged {
            self.current = self.next_seq();
            self.staged = false;
            log::info!("submitted new RCP image, slot seq now {}", self.current);
        }
        self.verified = true;
        self.persist()?;
        Ok(self.current)
    }

    /// Record the verification outcome of the current slot.
    ///
    /// A failed verification persists the *other* slot as current with the
    /// verified flag cleared: after reboot the device runs the previous
    /// image and sees the failed one as next. This asymmetry is the
    /// rollback mechanism.
    pub fn mark_verified(&mut self, ok: bool) -> Result<()> {
        if ok {
            self.verified = true;
        } else {
            log::warn!("RCP image in slot {} failed verification, rolling back", self.current);
            self.current = self.next_seq();
            self.verified = false;
        }
        self.persist()
    }

    /// Reserved for cleanup of a slot that can never boot. Intentionally has
    /// no effect today; construction already guarantees initialized state.
    pub fn mark_unusable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Persisted by the flasher once a slot has been fully written to the
    /// chip and verified.
    pub fn record_applied(&mut self) -> Result<()> {
        self.store.set_u8(KEY_APPLIED_SEQ, self.current)?;
        self.store.commit()
    }

    /// Seq recorded by the last successful flash, if any.
    pub fn applied_seq(&self) -> Result<Option<u8>> {
        self.store.get_u8(KEY_APPLIED_SEQ)
    }

    /// Version string of the image in the current slot.
    pub fn load_version(&self) -> Result<String> {
        let path = self.current_firmware_dir().join(VERSION_FILENAME);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text.trim_end().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(UpdateError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(UpdateError::Io(e)),
        }
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::platform::ChipType;

/// Update engine configuration.
///
/// `firmware_dir` is the slot base path; the two A/B slot directories are
/// `<firmware_dir>_0` and `<firmware_dir>_1`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfig {
    pub firmware_dir: PathBuf,

    // RCP serial link
    pub target_chip: ChipType,
    pub baud_rate: u32,
    pub update_baud_rate: u32,

    // Flashing
    pub max_flash_retries: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            firmware_dir: PathBuf::from("/rcp_fw/ot_rcp"),
            target_chip: ChipType::Esp32H2,
            baud_rate: 115_200,
            update_baud_rate: 460_800,
            max_flash_retries: 3,
        }
    }
}

impl UpdateConfig {
    /// Slot directory for a sequence number.
    pub fn firmware_dir_for(&self, seq: u8) -> PathBuf {
        let base = self.firmware_dir.display();
        PathBuf::from(format!("{base}_{seq}"))
    }
}

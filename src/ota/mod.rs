// RCP OTA receive module

pub mod receiver;

pub use receiver::{OtaHandle, OtaReceiver, OtaState};

// Combined-image update flow:
// 1. Download the combined image over HTTP
// 2. Stream it through an OTA session; RCP subfiles land in the next slot
// 3. Remaining bytes are host firmware, redirected by the caller
// 4. end() materializes the slot layout and submits the slot
// 5. Flash the RCP from the slot, reboot the host

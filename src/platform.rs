//! Injected platform capabilities.
//!
//! The update engine never talks to vendor SDKs directly. The embedding
//! firmware supplies these traits backed by the real services (esp_http_client,
//! esp_ota, NVS, the serial flasher link and the RCP control GPIOs); tests
//! supply in-memory mocks.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Socket-level errno observed on a zero-length read. Distinguishes a dropped
/// connection from a clean end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrno {
    NotConnected,
    ConnectionReset,
    ConnectionAborted,
    Other(i32),
}

impl SocketErrno {
    /// The errno set that marks a mid-transfer connection loss.
    pub fn is_connection_loss(self) -> bool {
        matches!(
            self,
            SocketErrno::NotConnected | SocketErrno::ConnectionReset | SocketErrno::ConnectionAborted
        )
    }
}

/// One in-flight HTTP exchange. Implementations must release the underlying
/// connection when the value is dropped, on every exit path.
pub trait HttpRequest {
    /// Fetch response headers and return the status code.
    fn status(&mut self) -> Result<u16>;

    /// Re-issue the request at the redirect target from the last response.
    /// Implementations enforce their own redirect limit.
    fn redirect(&mut self) -> Result<()>;

    /// Retry the request with credentials after an auth challenge.
    fn authenticate(&mut self) -> Result<()>;

    /// Declared body length, when the server sent one.
    fn content_length(&self) -> Option<u64>;

    /// Read body bytes. A return of 0 is end-of-stream unless `last_errno`
    /// reports a connection loss.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Errno observed by the most recent `read`, if any.
    fn last_errno(&self) -> Option<SocketErrno>;
}

pub trait HttpClient {
    type Request: HttpRequest;

    /// Open a GET request for `url`.
    fn get(&mut self, url: &str) -> Result<Self::Request>;
}

/// One sequential host-application OTA write, mirroring the platform OTA API:
/// begin, write in order, then either complete (marks the new image bootable)
/// or abort (leaves the running image as boot target).
pub trait AppOtaUpdate {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn complete(self) -> Result<()>;
    fn abort(self);
}

pub trait AppOta {
    type Update: AppOtaUpdate;

    fn initiate_update(&mut self) -> Result<Self::Update>;
}

/// Namespaced non-volatile key-value store (NVS-style).
pub trait NvsStore {
    fn get_u8(&self, key: &str) -> Result<Option<u8>>;
    fn set_u8(&mut self, key: &str, value: u8) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
}

/// Chip families the serial bootloader can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChipType {
    Esp32,
    Esp32S2,
    Esp32S3,
    Esp32C2,
    Esp32C3,
    Esp32C6,
    Esp32H2,
}

impl std::fmt::Display for ChipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChipType::Esp32 => "ESP32",
            ChipType::Esp32S2 => "ESP32-S2",
            ChipType::Esp32S3 => "ESP32-S3",
            ChipType::Esp32C2 => "ESP32-C2",
            ChipType::Esp32C3 => "ESP32-C3",
            ChipType::Esp32C6 => "ESP32-C6",
            ChipType::Esp32H2 => "ESP32-H2",
        };
        write!(f, "{name}")
    }
}

/// Serial bootloader protocol link to the RCP.
pub trait RcpBootloaderPort {
    /// Perform the bootloader handshake.
    fn connect(&mut self) -> Result<()>;

    /// Chip family reported by the connected target.
    fn target_chip(&mut self) -> Result<ChipType>;

    /// Renegotiate the link to a higher baud rate for the data phase.
    fn change_baud(&mut self, baud: u32) -> Result<()>;

    /// Erase `size` bytes at `offset` and start a flash write sequence.
    fn flash_begin(&mut self, offset: u32, size: u32) -> Result<()>;

    /// Write the next payload packet of the current sequence.
    fn flash_data(&mut self, data: &[u8]) -> Result<()>;

    /// Verify the written region against the expected SHA-256 digest.
    fn flash_verify(&mut self, offset: u32, size: u32, digest: &[u8; 32]) -> Result<()>;
}

/// Boot-strap and reset lines of the co-processor.
pub trait ResetControl {
    fn set_boot_pin(&mut self, high: bool) -> Result<()>;
    fn set_reset_pin(&mut self, high: bool) -> Result<()>;
    fn delay_ms(&mut self, ms: u32);
}

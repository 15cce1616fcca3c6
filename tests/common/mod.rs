//! Shared mock platform capabilities for the integration suites.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use esp_rcp_update::error::{Result, UpdateError};
use esp_rcp_update::image::SUBFILE_ENTRY_SIZE;
use esp_rcp_update::platform::{
    AppOta, AppOtaUpdate, ChipType, HttpClient, HttpRequest, NvsStore, RcpBootloaderPort,
    ResetControl, SocketErrno,
};
use esp_rcp_update::{SubfileTag, UpdateConfig};

// ── NVS ──────────────────────────────────────────────────────

/// In-memory NVS namespace. Clones share the backing map so tests can
/// re-init a sequencer from the same store to simulate a reboot.
#[derive(Default, Clone)]
pub struct MemNvs(Rc<RefCell<HashMap<String, u8>>>);

impl NvsStore for MemNvs {
    fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        Ok(self.0.borrow().get(key).copied())
    }
    fn set_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.0.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn test_config(tmp: &tempfile::TempDir) -> UpdateConfig {
    UpdateConfig {
        firmware_dir: tmp.path().join("ot_rcp"),
        ..UpdateConfig::default()
    }
}

// ── Combined image builder ───────────────────────────────────

/// Builds a combined firmware image: directory records followed by the
/// payloads in declaration order, offsets computed the way the image
/// tooling writes them.
#[derive(Default)]
pub struct ImageBuilder {
    subfiles: Vec<(u32, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subfile(mut self, tag: SubfileTag, bytes: &[u8]) -> Self {
        self.subfiles.push((tag.raw(), bytes.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        fn record(tag: u32, size: u32, offset: u32, out: &mut Vec<u8>) {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }

        let header_len = (1 + self.subfiles.len()) * SUBFILE_ENTRY_SIZE;
        let mut image = Vec::new();

        record(
            SubfileTag::ImageHeader.raw(),
            header_len as u32,
            0,
            &mut image,
        );
        let mut offset = header_len as u32;
        for (tag, bytes) in &self.subfiles {
            record(*tag, bytes.len() as u32, offset, &mut image);
            offset += bytes.len() as u32;
        }
        for (_, bytes) in &self.subfiles {
            image.extend_from_slice(bytes);
        }
        image
    }
}

/// The manifest used by the canonical test images.
pub const TEST_FLASH_ARGS: &str = "0x0 bt/bt.bin\n0x8000 pt/pt.bin\n0x10000 esp_ot_rcp.bin\n";

// ── HTTP ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RouteSpec {
    pub statuses: Vec<u16>,
    pub body: Vec<u8>,
    pub content_length: Option<u64>,
    pub errno: Option<SocketErrno>,
}

impl RouteSpec {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            statuses: vec![200],
            body: body.to_vec(),
            content_length: Some(body.len() as u64),
            errno: None,
        }
    }

    pub fn with_statuses(mut self, statuses: &[u16]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Truncate the body short of the declared length and report `errno`
    /// on the zero-length read that follows.
    pub fn broken_at(mut self, sent: usize, errno: SocketErrno) -> Self {
        self.body.truncate(sent);
        self.errno = Some(errno);
        self
    }
}

/// Url-keyed fake HTTP server.
#[derive(Default)]
pub struct MockServer {
    routes: HashMap<String, RouteSpec>,
}

impl MockServer {
    pub fn route(mut self, url: &str, spec: RouteSpec) -> Self {
        self.routes.insert(url.to_string(), spec);
        self
    }
}

pub struct MockRequest {
    spec: RouteSpec,
    cursor: usize,
    pos: usize,
}

impl HttpClient for MockServer {
    type Request = MockRequest;

    fn get(&mut self, url: &str) -> Result<Self::Request> {
        let spec = self.routes.get(url).cloned().unwrap_or(RouteSpec {
            statuses: vec![404],
            body: Vec::new(),
            content_length: None,
            errno: None,
        });
        Ok(MockRequest {
            spec,
            cursor: 0,
            pos: 0,
        })
    }
}

impl HttpRequest for MockRequest {
    fn status(&mut self) -> Result<u16> {
        Ok(self.spec.statuses[self.cursor.min(self.spec.statuses.len() - 1)])
    }
    fn redirect(&mut self) -> Result<()> {
        self.cursor += 1;
        Ok(())
    }
    fn authenticate(&mut self) -> Result<()> {
        self.cursor += 1;
        Ok(())
    }
    fn content_length(&self) -> Option<u64> {
        self.spec.content_length
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.spec.body.len() - self.pos;
        let take = remaining.min(buf.len());
        buf[..take].copy_from_slice(&self.spec.body[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
    fn last_errno(&self) -> Option<SocketErrno> {
        if self.pos >= self.spec.body.len() {
            self.spec.errno
        } else {
            None
        }
    }
}

// ── Host application OTA ─────────────────────────────────────

#[derive(Default)]
pub struct HostOtaState {
    pub written: Vec<u8>,
    pub initiated: u32,
    pub completed: bool,
    pub aborted: bool,
}

#[derive(Default, Clone)]
pub struct MockHostOta(pub Rc<RefCell<HostOtaState>>);

pub struct MockHostUpdate(Rc<RefCell<HostOtaState>>);

impl AppOta for MockHostOta {
    type Update = MockHostUpdate;

    fn initiate_update(&mut self) -> Result<Self::Update> {
        self.0.borrow_mut().initiated += 1;
        Ok(MockHostUpdate(self.0.clone()))
    }
}

impl AppOtaUpdate for MockHostUpdate {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0.borrow_mut().written.extend_from_slice(data);
        Ok(())
    }
    fn complete(self) -> Result<()> {
        self.0.borrow_mut().completed = true;
        Ok(())
    }
    fn abort(self) {
        self.0.borrow_mut().aborted = true;
    }
}

// ── Bootloader port and reset pins ───────────────────────────

/// Fake chip that reassembles flashed regions. Clones share the flashed
/// log, so a test can keep a handle after moving the port into the flasher.
#[derive(Default, Clone)]
pub struct MockPort {
    pub flashed: Rc<RefCell<Vec<(u32, Vec<u8>)>>>,
    current: Option<(u32, Vec<u8>)>,
}

impl RcpBootloaderPort for MockPort {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }
    fn target_chip(&mut self) -> Result<ChipType> {
        Ok(ChipType::Esp32H2)
    }
    fn change_baud(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }
    fn flash_begin(&mut self, offset: u32, _size: u32) -> Result<()> {
        self.current = Some((offset, Vec::new()));
        Ok(())
    }
    fn flash_data(&mut self, data: &[u8]) -> Result<()> {
        match self.current.as_mut() {
            Some((_, bytes)) => {
                bytes.extend_from_slice(data);
                Ok(())
            }
            None => Err(UpdateError::InvalidState("flash_data before flash_begin")),
        }
    }
    fn flash_verify(&mut self, _offset: u32, size: u32, digest: &[u8; 32]) -> Result<()> {
        use sha2::{Digest, Sha256};
        let (offset, bytes) = self
            .current
            .take()
            .ok_or(UpdateError::InvalidState("verify before flash_begin"))?;
        if bytes.len() as u32 != size {
            return Err(UpdateError::Fail("short write".into()));
        }
        let written: [u8; 32] = Sha256::digest(&bytes).into();
        if &written != digest {
            return Err(UpdateError::Fail("digest mismatch".into()));
        }
        self.flashed.borrow_mut().push((offset, bytes));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPins;

impl ResetControl for MockPins {
    fn set_boot_pin(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }
    fn set_reset_pin(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }
    fn delay_ms(&mut self, _ms: u32) {}
}

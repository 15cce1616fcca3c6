//! Chunked receive state machine for the combined RCP firmware image.
//!
//! A session consumes an HTTP byte stream in whatever chunk sizes the network
//! delivers, parses the subfile directory, and streams every RCP subfile into
//! the next firmware slot. `receive` may consume less than it was given: once
//! the RCP payload is complete the session is `Finished` and every remaining
//! byte belongs to the caller (it is host application firmware, not RCP
//! data). That byte-exact handoff is the load-bearing contract here.
//!
//! Sessions are single-threaded by caller contract: `begin`/`receive`/`end`
//! for one handle must never run concurrently.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, UpdateError};
use crate::image::{
    validate_leading_entry, ContainerFile, SubfileDirectory, SubfileEntry, SubfileTag,
    MAX_HEADER_SIZE, RCP_IMAGE_FILENAME, SUBFILE_ENTRY_SIZE,
};
use crate::platform::NvsStore;
use crate::slots::UpdateSequencer;

/// The product runs one update at a time; two sessions leave headroom for a
/// diagnostic flow without letting the registry grow.
const MAX_SESSIONS: usize = 2;

/// Consecutive zero-length writes tolerated before the filesystem is
/// declared stalled.
const MAX_STALLED_WRITES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    ReadHeader,
    DownloadRcpFw,
    Finished,
}

/// Generation-checked session handle. Stale handles (freed or recycled
/// sessions) are rejected instead of resolving to a different session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaHandle {
    index: u32,
    generation: u32,
}

struct Session {
    state: OtaState,
    header: heapless::Vec<u8, MAX_HEADER_SIZE>,
    // 0 until the leading record has been validated
    header_total: usize,
    directory: Option<SubfileDirectory>,
    rcp_total: u32,
    rcp_written: u32,
    slot_dir: PathBuf,
    target: PathBuf,
    output: Option<File>,
}

impl Session {
    fn new(slot_dir: PathBuf) -> Self {
        let target = slot_dir.join(RCP_IMAGE_FILENAME);
        Self {
            state: OtaState::ReadHeader,
            header: heapless::Vec::new(),
            header_total: 0,
            directory: None,
            rcp_total: 0,
            rcp_written: 0,
            slot_dir,
            target,
            output: None,
        }
    }

    fn buffer_header(&mut self, data: &[u8]) -> Result<()> {
        self.header
            .extend_from_slice(data)
            .map_err(|_| UpdateError::ResourceExhausted("OTA header buffer"))
    }
}

struct ArenaSlot {
    generation: u32,
    session: Option<Box<Session>>,
}

fn stale_handle() -> UpdateError {
    UpdateError::InvalidArgument("unknown or stale OTA session handle".into())
}

/// Registry of in-flight OTA sessions plus the receive state machine.
#[derive(Default)]
pub struct OtaReceiver {
    arena: Vec<ArenaSlot>,
}

impl OtaReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session targeting the next firmware slot.
    pub fn begin(&mut self, slots: &UpdateSequencer<impl NvsStore>) -> Result<OtaHandle> {
        let session = Box::new(Session::new(slots.next_firmware_dir()));

        if let Some((index, slot)) = self
            .arena
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.session.is_none())
        {
            slot.session = Some(session);
            return Ok(OtaHandle {
                index: index as u32,
                generation: slot.generation,
            });
        }
        if self.arena.len() < MAX_SESSIONS {
            self.arena.push(ArenaSlot {
                generation: 0,
                session: Some(session),
            });
            return Ok(OtaHandle {
                index: (self.arena.len() - 1) as u32,
                generation: 0,
            });
        }
        Err(UpdateError::ResourceExhausted("no free OTA session"))
    }

    /// Feed a chunk of the image stream. Returns how many bytes were
    /// consumed; once the session reports `Finished` the unconsumed tail of
    /// the chunk is the caller's to redirect (host firmware bytes).
    ///
    /// Format errors are unrecoverable for the session: the caller must
    /// `abort`.
    pub fn receive(&mut self, handle: OtaHandle, data: &[u8]) -> Result<usize> {
        let session = self.session_mut(handle)?;
        let mut consumed = 0;

        if session.state == OtaState::ReadHeader {
            // First the self-describing leading record alone, since it
            // carries the directory size.
            if session.header_total == 0 {
                let want = SUBFILE_ENTRY_SIZE - session.header.len();
                let take = want.min(data.len());
                session.buffer_header(&data[..take])?;
                consumed += take;
                if session.header.len() < SUBFILE_ENTRY_SIZE {
                    return Ok(consumed);
                }
                let leading = SubfileEntry::parse(&session.header[..SUBFILE_ENTRY_SIZE])?;
                session.header_total = validate_leading_entry(&leading)? as usize;
            }

            let want = session.header_total - session.header.len();
            let take = want.min(data.len() - consumed);
            session.buffer_header(&data[consumed..consumed + take])?;
            consumed += take;
            if session.header.len() < session.header_total {
                return Ok(consumed);
            }

            let directory = SubfileDirectory::parse(&session.header)?;
            session.rcp_total = directory.rcp_payload_size();
            session.directory = Some(directory);
            if session.rcp_total == 0 {
                // Host-firmware-only image: nothing for the RCP slot.
                session.state = OtaState::Finished;
                log::info!("OTA image carries no RCP subfiles, session finished");
                return Ok(consumed);
            }
            session.state = OtaState::DownloadRcpFw;
            log::info!(
                "OTA directory read: {} bytes, RCP payload {} bytes -> {}",
                session.header_total,
                session.rcp_total,
                session.target.display()
            );
        }

        if session.state == OtaState::DownloadRcpFw {
            if session.output.is_none() {
                let mut output = open_output(&session.target)?;
                // The directory bytes are part of the persisted RCP image.
                write_retry(&mut output, &session.header)?;
                session.output = Some(output);
            }

            let remaining = (session.rcp_total - session.rcp_written) as usize;
            let take = remaining.min(data.len() - consumed);
            if take > 0 {
                if let Some(output) = session.output.as_mut() {
                    write_retry(output, &data[consumed..consumed + take])?;
                }
                session.rcp_written += take as u32;
                consumed += take;
            }
            if session.rcp_written >= session.rcp_total {
                // Boundary is final: the very next byte of the stream is
                // host firmware.
                session.output = None;
                session.state = OtaState::Finished;
                log::info!("RCP image complete ({} payload bytes)", session.rcp_written);
            }
        }

        Ok(consumed)
    }

    pub fn state(&self, handle: OtaHandle) -> Result<OtaState> {
        Ok(self.session(handle)?.state)
    }

    /// Declared size of a subfile: 0 until the directory has been read, and
    /// 0 for tags the image does not carry.
    pub fn subfile_size(&self, handle: OtaHandle, tag: SubfileTag) -> Result<u32> {
        let session = self.session(handle)?;
        Ok(session
            .directory
            .as_ref()
            .map_or(0, |dir| dir.subfile_size(tag)))
    }

    /// Complete a finished session: materialize the slot layout from the
    /// container and submit the slot. `InvalidState` unless `Finished`.
    pub fn end(
        &mut self,
        handle: OtaHandle,
        slots: &mut UpdateSequencer<impl NvsStore>,
    ) -> Result<()> {
        if self.session(handle)?.state != OtaState::Finished {
            return Err(UpdateError::InvalidState("OTA session is not finished"));
        }
        let mut session = self.take_session(handle)?;
        session.output = None;

        if session.rcp_total > 0 {
            ContainerFile::open(&session.target)?.unpack_to(&session.slot_dir)?;
            slots.stage_next_slot();
        }
        slots.submit()?;
        Ok(())
    }

    /// Tear down a session in any state without submitting. The partial
    /// container file is left behind; the next session overwrites it.
    pub fn abort(&mut self, handle: OtaHandle) -> Result<()> {
        let session = self.take_session(handle)?;
        log::warn!(
            "OTA session aborted in {:?} ({}/{} payload bytes)",
            session.state,
            session.rcp_written,
            session.rcp_total
        );
        Ok(())
    }

    fn slot_mut(&mut self, handle: OtaHandle) -> Result<&mut ArenaSlot> {
        let slot = self
            .arena
            .get_mut(handle.index as usize)
            .ok_or_else(stale_handle)?;
        if slot.generation != handle.generation {
            return Err(stale_handle());
        }
        Ok(slot)
    }

    fn session(&self, handle: OtaHandle) -> Result<&Session> {
        self.arena
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_deref())
            .ok_or_else(stale_handle)
    }

    fn session_mut(&mut self, handle: OtaHandle) -> Result<&mut Session> {
        self.slot_mut(handle)?
            .session
            .as_deref_mut()
            .ok_or_else(stale_handle)
    }

    fn take_session(&mut self, handle: OtaHandle) -> Result<Box<Session>> {
        let slot = self.slot_mut(handle)?;
        let session = slot.session.take().ok_or_else(stale_handle)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(session)
    }
}

fn open_output(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match File::create(path) {
        Ok(file) => Ok(file),
        Err(first) => {
            // A stale image from an interrupted update may be in the way.
            let _ = fs::remove_file(path);
            File::create(path).map_err(|_| {
                UpdateError::Fail(format!(
                    "cannot open {} for writing: {first}",
                    path.display()
                ))
            })
        }
    }
}

fn write_retry(output: &mut File, mut data: &[u8]) -> Result<()> {
    let mut stalled = 0;
    while !data.is_empty() {
        let written = output.write(data)?;
        if written == 0 {
            stalled += 1;
            if stalled >= MAX_STALLED_WRITES {
                return Err(UpdateError::Fail(
                    "filesystem made no progress writing RCP image".into(),
                ));
            }
        } else {
            stalled = 0;
            data = &data[written..];
        }
    }
    Ok(())
}

//! Combined RCP firmware image container and flash-argument manifest.
//!
//! A combined image is a directory of fixed-width subfile records followed by
//! the concatenated subfile payloads in declaration order:
//!
//! ```text
//! [tag=0xff size=N*12 offset=0]   image header (describes the directory)
//! [tag     size      offset  ]    one record per subfile
//! ...
//! <payload bytes, subfile by subfile>
//! ```
//!
//! Records are packed `{u32 tag, u32 size, u32 offset}`, little-endian.
//! The flash-argument manifest is a text subfile/file with one
//! `<hex offset> <relative path>` pair per line, consumed by the flasher.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, UpdateError};

/// Width of one packed directory record.
pub const SUBFILE_ENTRY_SIZE: usize = 12;

/// Upper bound on directory entries, image header included.
pub const MAX_SUBFILES: usize = 7;

/// Largest directory the receive path will buffer.
pub const MAX_HEADER_SIZE: usize = MAX_SUBFILES * SUBFILE_ENTRY_SIZE;

/// File names inside a firmware slot directory.
pub const RCP_IMAGE_FILENAME: &str = "rcp_image";
pub const FLASH_ARGS_FILENAME: &str = "flash_args";
pub const VERSION_FILENAME: &str = "rcp_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubfileTag {
    RcpVersion,
    RcpFlashArgs,
    RcpBootloader,
    RcpPartitionTable,
    RcpFirmware,
    HostFirmware,
    ImageHeader,
}

impl SubfileTag {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SubfileTag::RcpVersion),
            1 => Some(SubfileTag::RcpFlashArgs),
            2 => Some(SubfileTag::RcpBootloader),
            3 => Some(SubfileTag::RcpPartitionTable),
            4 => Some(SubfileTag::RcpFirmware),
            5 => Some(SubfileTag::HostFirmware),
            0xff => Some(SubfileTag::ImageHeader),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            SubfileTag::RcpVersion => 0,
            SubfileTag::RcpFlashArgs => 1,
            SubfileTag::RcpBootloader => 2,
            SubfileTag::RcpPartitionTable => 3,
            SubfileTag::RcpFirmware => 4,
            SubfileTag::HostFirmware => 5,
            SubfileTag::ImageHeader => 0xff,
        }
    }

    /// Subfiles the flasher writes to the RCP chip.
    pub fn is_flashable(self) -> bool {
        matches!(
            self,
            SubfileTag::RcpBootloader | SubfileTag::RcpPartitionTable | SubfileTag::RcpFirmware
        )
    }
}

/// One packed directory record. The raw tag is preserved so that unknown
/// tags still stream through the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubfileEntry {
    pub tag: u32,
    pub size: u32,
    pub offset: u32,
}

impl SubfileEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUBFILE_ENTRY_SIZE {
            return Err(UpdateError::InvalidArgument(format!(
                "subfile record needs {SUBFILE_ENTRY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            tag: word(0),
            size: word(4),
            offset: word(8),
        })
    }

    pub fn tag(&self) -> Option<SubfileTag> {
        SubfileTag::from_raw(self.tag)
    }
}

/// Validate the self-describing leading record and return the total directory
/// size in bytes.
pub fn validate_leading_entry(entry: &SubfileEntry) -> Result<u32> {
    if entry.tag() != Some(SubfileTag::ImageHeader) {
        return Err(UpdateError::InvalidArgument(format!(
            "image does not start with a header record (tag {:#x})",
            entry.tag
        )));
    }
    if entry.offset != 0 {
        return Err(UpdateError::InvalidArgument(format!(
            "header record offset must be 0, got {}",
            entry.offset
        )));
    }
    if entry.size as usize % SUBFILE_ENTRY_SIZE != 0 {
        return Err(UpdateError::InvalidArgument(format!(
            "header size {} is not a multiple of the record width",
            entry.size
        )));
    }
    if (entry.size as usize) < SUBFILE_ENTRY_SIZE || entry.size as usize > MAX_HEADER_SIZE {
        return Err(UpdateError::InvalidArgument(format!(
            "header size {} out of range", entry.size
        )));
    }
    Ok(entry.size)
}

/// Fully parsed subfile directory.
#[derive(Debug, Clone)]
pub struct SubfileDirectory {
    entries: heapless::Vec<SubfileEntry, MAX_SUBFILES>,
}

impl SubfileDirectory {
    /// Parse a complete directory buffer (leading header record included).
    pub fn parse(header: &[u8]) -> Result<Self> {
        let leading = SubfileEntry::parse(header)?;
        let total = validate_leading_entry(&leading)? as usize;
        if header.len() != total {
            return Err(UpdateError::InvalidArgument(format!(
                "directory buffer is {} bytes, header declares {total}",
                header.len()
            )));
        }

        let mut entries = heapless::Vec::new();
        for chunk in header.chunks_exact(SUBFILE_ENTRY_SIZE) {
            let entry = SubfileEntry::parse(chunk)?;
            entries
                .push(entry)
                .map_err(|_| UpdateError::InvalidArgument("too many subfiles".into()))?;
        }

        let dir = Self { entries };
        // The payload counters downstream are u32.
        if dir.payload_total() > u64::from(u32::MAX) {
            return Err(UpdateError::InvalidArgument("declared image too large".into()));
        }
        Ok(dir)
    }

    pub fn entries(&self) -> &[SubfileEntry] {
        &self.entries
    }

    /// Declared size of a tagged subfile, 0 when absent.
    pub fn subfile_size(&self, tag: SubfileTag) -> u32 {
        self.entries
            .iter()
            .find(|e| e.tag == tag.raw())
            .map_or(0, |e| e.size)
    }

    fn payload_total(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| {
                e.tag != SubfileTag::ImageHeader.raw() && e.tag != SubfileTag::HostFirmware.raw()
            })
            .map(|e| u64::from(e.size))
            .sum()
    }

    /// Bytes of payload belonging to the RCP image: every subfile except the
    /// host firmware. The directory itself is accounted separately.
    pub fn rcp_payload_size(&self) -> u32 {
        self.payload_total() as u32
    }

    /// Flashable subfile entries in declaration order.
    pub fn flashable_entries(&self) -> impl Iterator<Item = &SubfileEntry> {
        self.entries
            .iter()
            .filter(|e| e.tag().is_some_and(SubfileTag::is_flashable))
    }
}

/// One parsed flash-argument manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashArg {
    pub offset: u32,
    pub path: String,
}

/// Parse a flash-argument manifest: `<hex offset> <relative path>` per line,
/// blank lines ignored.
pub fn parse_flash_args(text: &str) -> Result<Vec<FlashArg>> {
    let mut args = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(offset), Some(path)) = (fields.next(), fields.next()) else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(UpdateError::InvalidArgument(format!(
                "malformed flash args line: {line:?}"
            )));
        };
        let digits = offset.strip_prefix("0x").unwrap_or(offset);
        let offset = u32::from_str_radix(digits, 16).map_err(|_| {
            UpdateError::InvalidArgument(format!("bad flash offset: {offset:?}"))
        })?;
        args.push(FlashArg {
            offset,
            path: path.to_string(),
        });
    }
    Ok(args)
}

/// A completed container image on disk, readable by subfile.
pub struct ContainerFile {
    file: File,
    directory: SubfileDirectory,
}

impl ContainerFile {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpdateError::NotFound(path.display().to_string())
            } else {
                UpdateError::Io(e)
            }
        })?;

        let mut leading = [0u8; SUBFILE_ENTRY_SIZE];
        file.read_exact(&mut leading)?;
        let total = validate_leading_entry(&SubfileEntry::parse(&leading)?)? as usize;

        let mut header = vec![0u8; total];
        header[..SUBFILE_ENTRY_SIZE].copy_from_slice(&leading);
        file.read_exact(&mut header[SUBFILE_ENTRY_SIZE..])?;
        let directory = SubfileDirectory::parse(&header)?;

        Ok(Self { file, directory })
    }

    pub fn directory(&self) -> &SubfileDirectory {
        &self.directory
    }

    fn entry(&self, tag: SubfileTag) -> Result<SubfileEntry> {
        self.directory
            .entries()
            .iter()
            .copied()
            .find(|e| e.tag == tag.raw())
            .ok_or_else(|| UpdateError::NotFound(format!("subfile {tag:?} not in image")))
    }

    /// Read an entire tagged subfile. For the small text subfiles.
    pub fn read_subfile(&mut self, tag: SubfileTag) -> Result<Vec<u8>> {
        let entry = self.entry(tag)?;
        self.file.seek(SeekFrom::Start(u64::from(entry.offset)))?;
        let mut buf = vec![0u8; entry.size as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Stream one subfile's payload into `out`.
    pub fn copy_entry<W: Write>(&mut self, entry: &SubfileEntry, out: &mut W) -> Result<()> {
        self.file.seek(SeekFrom::Start(u64::from(entry.offset)))?;
        let mut remaining = entry.size as usize;
        let mut buf = [0u8; 1024];
        while remaining > 0 {
            let take = remaining.min(buf.len());
            self.file.read_exact(&mut buf[..take])?;
            out.write_all(&buf[..take])?;
            remaining -= take;
        }
        Ok(())
    }

    /// Materialize the discrete slot layout from this container: version
    /// string, flash-argument manifest, and the chip images at the relative
    /// paths the manifest names. Manifest lines map to the flashable subfiles
    /// in declaration order.
    pub fn unpack_to(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        match self.read_subfile(SubfileTag::RcpVersion) {
            Ok(version) => fs::write(dir.join(VERSION_FILENAME), &version)?,
            Err(UpdateError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let flashable: Vec<SubfileEntry> = self.directory.flashable_entries().copied().collect();
        let args_bytes = match self.read_subfile(SubfileTag::RcpFlashArgs) {
            Ok(bytes) => bytes,
            Err(UpdateError::NotFound(_)) if flashable.is_empty() => return Ok(()),
            Err(e) => return Err(e),
        };
        let args_text = String::from_utf8(args_bytes).map_err(|_| {
            UpdateError::InvalidArgument("flash args subfile is not valid UTF-8".into())
        })?;
        let args = parse_flash_args(&args_text)?;
        if args.len() != flashable.len() {
            return Err(UpdateError::InvalidArgument(format!(
                "manifest names {} files but image carries {} flashable subfiles",
                args.len(),
                flashable.len()
            )));
        }
        fs::write(dir.join(FLASH_ARGS_FILENAME), &args_text)?;

        for (arg, entry) in args.iter().zip(&flashable) {
            let dest = dir.join(&arg.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            self.copy_entry(entry, &mut out)?;
            log::debug!("unpacked {:?} -> {}", entry.tag(), dest.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: u32, size: u32, offset: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SUBFILE_ENTRY_SIZE);
        bytes.extend_from_slice(&tag.to_le_bytes());
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes
    }

    #[test]
    fn record_parses_little_endian() {
        let entry = SubfileEntry::parse(&record(4, 0x1234, 84)).unwrap();
        assert_eq!(entry.tag(), Some(SubfileTag::RcpFirmware));
        assert_eq!(entry.size, 0x1234);
        assert_eq!(entry.offset, 84);
    }

    #[test]
    fn leading_entry_must_be_header() {
        let entry = SubfileEntry::parse(&record(4, 24, 0)).unwrap();
        assert!(matches!(
            validate_leading_entry(&entry),
            Err(UpdateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn leading_entry_rejects_misaligned_size() {
        let entry = SubfileEntry::parse(&record(0xff, 25, 0)).unwrap();
        assert!(matches!(
            validate_leading_entry(&entry),
            Err(UpdateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn leading_entry_rejects_nonzero_offset() {
        let entry = SubfileEntry::parse(&record(0xff, 24, 12)).unwrap();
        assert!(validate_leading_entry(&entry).is_err());
    }

    #[test]
    fn leading_entry_rejects_oversize_directory() {
        let entry = SubfileEntry::parse(&record(0xff, (MAX_HEADER_SIZE + 12) as u32, 0)).unwrap();
        assert!(validate_leading_entry(&entry).is_err());
    }

    #[test]
    fn directory_sums_rcp_payload_without_host_firmware() {
        let mut header = record(0xff, 48, 0);
        header.extend(record(0, 16, 48)); // rcp_version
        header.extend(record(4, 100, 64)); // rcp firmware
        header.extend(record(5, 9000, 164)); // host firmware, excluded
        let dir = SubfileDirectory::parse(&header).unwrap();
        assert_eq!(dir.rcp_payload_size(), 116);
        assert_eq!(dir.subfile_size(SubfileTag::RcpFirmware), 100);
        assert_eq!(dir.subfile_size(SubfileTag::HostFirmware), 9000);
        assert_eq!(dir.subfile_size(SubfileTag::RcpBootloader), 0);
    }

    #[test]
    fn flash_args_parse() {
        let args = parse_flash_args("0x0 bt/bt.bin\n0x8000 pt/pt.bin\n\n0x10000 esp_ot_rcp.bin\n")
            .unwrap();
        assert_eq!(
            args,
            vec![
                FlashArg { offset: 0x0, path: "bt/bt.bin".into() },
                FlashArg { offset: 0x8000, path: "pt/pt.bin".into() },
                FlashArg { offset: 0x10000, path: "esp_ot_rcp.bin".into() },
            ]
        );
    }

    #[test]
    fn flash_args_rejects_bad_lines() {
        assert!(parse_flash_args("0x10000").is_err());
        assert!(parse_flash_args("zz bt.bin").is_err());
    }
}

//! Storage adapter: `Reader`/`Writer` traits and the file-backed store.
//!
//! A resource's data lives in one append-only file. A fixed header holds
//! the pointer to the current uber page and the durable end of file;
//! everything after it is a sequence of `[len][crc32][page bytes]` frames
//! addressed by the offset of their length prefix. Installing an uber
//! page syncs the appended frames, rewrites the header and syncs again,
//! so the header never points into unsynced data.
//!
//! Commit markers (`commit-<rev>.tmp`) bracket a commit next to the data
//! file. A leftover marker means the uber page was never installed:
//! recovery truncates back to the durable length and deletes the marker.

use crate::page::Page;
use crate::reference::PageReference;
use crate::{Error, FILE_MAGIC, Result, VERSION_MAJOR, VERSION_MINOR};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

pub const HEADER_LEN: u64 = 64;

/// Sanity bound for a single page frame.
const MAX_PAGE_LEN: u32 = 64 * 1024 * 1024;

pub trait Reader: Send {
    fn read(&mut self, storage_key: u64) -> Result<Page>;

    /// Reference to the current uber page; empty on a fresh store.
    fn read_uber_page_ref(&mut self) -> Result<PageReference>;

    fn close(&mut self) -> Result<()>;
}

pub trait Writer: Reader {
    /// Appends a page, returns its storage key.
    fn write(&mut self, page: &Page) -> Result<u64>;

    /// Durably installs `reference` as the current uber page.
    fn write_uber_page_ref(&mut self, reference: &PageReference) -> Result<()>;

    /// End of the committed region.
    fn durable_len(&mut self) -> Result<u64>;

    fn truncate_to(&mut self, len: u64) -> Result<()>;

    fn begin_commit(&mut self, revision: u32) -> Result<()>;

    fn finish_commit(&mut self, revision: u32) -> Result<()>;

    /// Removes the marker if present and discards uncommitted frames.
    fn abort_commit(&mut self, revision: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Header {
    uber_offset: u64,
    durable_len: u64,
}

impl Header {
    fn fresh() -> Self {
        Self {
            uber_offset: 0,
            durable_len: HEADER_LEN,
        }
    }

    fn encode(self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        out[0..8].copy_from_slice(&FILE_MAGIC);
        out[8..12].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        out[12..16].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        out[16..24].copy_from_slice(&self.uber_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.durable_len.to_le_bytes());
        out
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self> {
        if buf[0..8] != FILE_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let major = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let minor = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        if major != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion { major, minor });
        }
        Ok(Self {
            uber_offset: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            durable_len: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

pub fn data_dir(resource_dir: &Path) -> PathBuf {
    resource_dir.join("data")
}

pub fn data_file(resource_dir: &Path) -> PathBuf {
    data_dir(resource_dir).join("resource.adb")
}

fn marker_path(resource_dir: &Path, revision: u32) -> PathBuf {
    resource_dir.join(format!("commit-{revision}.tmp"))
}

/// Discards the effects of a commit that never installed its uber page.
/// Called before a resource is opened.
pub fn recover(resource_dir: &Path) -> Result<()> {
    let mut markers = Vec::new();
    for entry in fs::read_dir(resource_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("commit-") && name.ends_with(".tmp") {
            markers.push(entry.path());
        }
    }
    if markers.is_empty() {
        return Ok(());
    }

    let path = data_file(resource_dir);
    if path.exists() {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = read_header(&file)?;
        log::warn!(
            "interrupted commit detected, truncating {} to {} bytes",
            path.display(),
            header.durable_len
        );
        file.set_len(header.durable_len)?;
        file.sync_data()?;
    }
    for marker in markers {
        fs::remove_file(marker)?;
    }
    Ok(())
}

fn read_header(file: &File) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN as usize];
    read_exact_at(file, 0, &mut buf)?;
    Header::decode(&buf)
}

fn write_header(file: &File, header: Header) -> Result<()> {
    write_all_at(file, 0, &header.encode())?;
    Ok(())
}

fn read_frame(file: &File, storage_key: u64) -> Result<Page> {
    let mut prefix = [0u8; 8];
    read_exact_at(file, storage_key, &mut prefix)?;
    let len = u32::from_le_bytes(prefix[0..4].try_into().unwrap());
    let crc = u32::from_le_bytes(prefix[4..8].try_into().unwrap());
    if len == 0 || len > MAX_PAGE_LEN {
        return Err(Error::Corrupted("page frame length out of range"));
    }
    let mut body = vec![0u8; len as usize];
    read_exact_at(file, storage_key + 8, &mut body)?;
    if crc32fast::hash(&body) != crc {
        return Err(Error::ChecksumMismatch {
            offset: storage_key,
        });
    }
    Page::decode(&body)
}

pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn open(resource_dir: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(data_file(resource_dir))?;
        // Validate the header eagerly so version mismatches surface at
        // open rather than on the first page read.
        read_header(&file)?;
        Ok(Self { file })
    }
}

impl Reader for FileReader {
    fn read(&mut self, storage_key: u64) -> Result<Page> {
        read_frame(&self.file, storage_key)
    }

    fn read_uber_page_ref(&mut self) -> Result<PageReference> {
        let header = read_header(&self.file)?;
        Ok(if header.uber_offset == 0 {
            PageReference::empty()
        } else {
            PageReference::from_storage_key(header.uber_offset)
        })
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FileWriter {
    resource_dir: PathBuf,
    file: File,
    /// Next append offset.
    len: u64,
}

impl FileWriter {
    /// Opens the resource's data file, creating and initialising it on
    /// first use.
    pub fn open(resource_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir(resource_dir))?;
        let path = data_file(resource_dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = if file.metadata()?.len() == 0 {
            write_header(&file, Header::fresh())?;
            file.sync_data()?;
            HEADER_LEN
        } else {
            let header = read_header(&file)?;
            // Anything beyond the durable length is an aborted tail.
            file.set_len(header.durable_len)?;
            header.durable_len
        };

        Ok(Self {
            resource_dir: resource_dir.to_path_buf(),
            file,
            len,
        })
    }
}

impl Reader for FileWriter {
    fn read(&mut self, storage_key: u64) -> Result<Page> {
        read_frame(&self.file, storage_key)
    }

    fn read_uber_page_ref(&mut self) -> Result<PageReference> {
        let header = read_header(&self.file)?;
        Ok(if header.uber_offset == 0 {
            PageReference::empty()
        } else {
            PageReference::from_storage_key(header.uber_offset)
        })
    }

    fn close(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Writer for FileWriter {
    fn write(&mut self, page: &Page) -> Result<u64> {
        let body = page.encode();
        let len = u32::try_from(body.len())
            .ok()
            .filter(|&l| l <= MAX_PAGE_LEN)
            .ok_or(Error::Corrupted("page too large"))?;
        let crc = crc32fast::hash(&body);

        let key = self.len;
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&body);
        write_all_at(&self.file, key, &frame)?;
        self.len += frame.len() as u64;
        Ok(key)
    }

    fn write_uber_page_ref(&mut self, reference: &PageReference) -> Result<()> {
        let offset = reference
            .storage_key()
            .ok_or(Error::Corrupted("uber page reference has no storage key"))?;
        // Frames first, then the header that points into them.
        self.file.sync_data()?;
        write_header(
            &self.file,
            Header {
                uber_offset: offset,
                durable_len: self.len,
            },
        )?;
        self.file.sync_data()?;
        Ok(())
    }

    fn durable_len(&mut self) -> Result<u64> {
        Ok(read_header(&self.file)?.durable_len)
    }

    fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_data()?;
        self.len = len;
        Ok(())
    }

    fn begin_commit(&mut self, revision: u32) -> Result<()> {
        let marker = File::create(marker_path(&self.resource_dir, revision))?;
        marker.sync_all()?;
        Ok(())
    }

    fn finish_commit(&mut self, revision: u32) -> Result<()> {
        fs::remove_file(marker_path(&self.resource_dir, revision))?;
        Ok(())
    }

    fn abort_commit(&mut self, revision: u32) -> Result<()> {
        let marker = marker_path(&self.resource_dir, revision);
        if marker.exists() {
            fs::remove_file(marker)?;
        }
        let durable = self.durable_len()?;
        self.truncate_to(durable)
    }
}

fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at returned 0 bytes",
            )));
        }
        offset = offset.saturating_add(n as u64);
        buf = &mut buf[n..];
    }
    Ok(())
}

fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = write_at(file, offset, buf).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_at returned 0 bytes",
            )));
        }
        offset = offset.saturating_add(n as u64);
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{IndirectPage, Page};
    use crate::reference::PageReference;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut writer = FileWriter::open(dir.path()).unwrap();

        let mut page = IndirectPage::new_empty();
        page.refs[3] = PageReference::from_storage_key(4096);
        let key = writer.write(&Page::Indirect(page)).unwrap();
        assert_eq!(key, HEADER_LEN);

        let back = writer.read(key).unwrap();
        assert_eq!(
            back.as_indirect().unwrap().refs[3].storage_key(),
            Some(4096)
        );
    }

    #[test]
    fn uber_ref_empty_until_installed() {
        let dir = tempdir().unwrap();
        let mut writer = FileWriter::open(dir.path()).unwrap();
        assert!(writer.read_uber_page_ref().unwrap().is_empty());

        let key = writer
            .write(&Page::Indirect(IndirectPage::new_empty()))
            .unwrap();
        writer
            .write_uber_page_ref(&PageReference::from_storage_key(key))
            .unwrap();

        let mut reader = FileReader::open(dir.path()).unwrap();
        assert_eq!(
            reader.read_uber_page_ref().unwrap().storage_key(),
            Some(key)
        );
    }

    #[test]
    fn corrupted_frame_fails_checksum() {
        let dir = tempdir().unwrap();
        let mut writer = FileWriter::open(dir.path()).unwrap();
        let key = writer
            .write(&Page::Indirect(IndirectPage::new_empty()))
            .unwrap();
        writer
            .write_uber_page_ref(&PageReference::from_storage_key(key))
            .unwrap();
        drop(writer);

        let path = data_file(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        let victim = key as usize + 16;
        bytes[victim] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let mut reader = FileReader::open(dir.path()).unwrap();
        let err = reader.read(key).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn leftover_marker_truncates_uncommitted_tail() {
        let dir = tempdir().unwrap();
        let mut writer = FileWriter::open(dir.path()).unwrap();
        let key = writer
            .write(&Page::Indirect(IndirectPage::new_empty()))
            .unwrap();
        writer
            .write_uber_page_ref(&PageReference::from_storage_key(key))
            .unwrap();
        let durable = writer.durable_len().unwrap();

        // A commit that crashed after appending but before installing.
        writer.begin_commit(1).unwrap();
        writer
            .write(&Page::Indirect(IndirectPage::new_empty()))
            .unwrap();
        drop(writer);

        recover(dir.path()).unwrap();
        assert!(!marker_path(dir.path(), 1).exists());
        let len = fs::metadata(data_file(dir.path())).unwrap().len();
        assert_eq!(len, durable);

        let mut reader = FileReader::open(dir.path()).unwrap();
        assert_eq!(
            reader.read_uber_page_ref().unwrap().storage_key(),
            Some(key)
        );
    }
}

//! The `.files` file: one fixed header followed by a compact table of
//! `(path, file_id, vhd_uuid, vhd_mtime)` entries, one per unique VHD
//! contributing to the index.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use vhdindex_core::security::MAX_PATH_BYTES;
use vhdindex_core::{Error, Result};
use vhdindex_format::{decode_path_field, encode_path_field, relative_path_to, resolve_relative};
use vhdindex_vhd::VhdReader;

pub const MAGIC: &[u8; 8] = b"vhdifile";
const HEADER_SIZE: usize = 512;
const PATH_FIELD_SIZE: usize = 2 + MAX_PATH_BYTES;
const ENTRY_SIZE: usize = PATH_FIELD_SIZE + 4 + 16 + 4;

/// One backing-file reference: a unique (path, file_id) pair plus the
/// VHD's own uuid and mtime, used to detect a stale index at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTableEntry {
    pub path: String,
    pub file_id: u32,
    pub vhd_uuid: [u8; 16],
    pub vhd_timestamp: u32,
}

/// Encode one entry. Kept as the exact structural inverse of [`decode_entry`]
/// rather than sharing a generic field-offset table with it.
fn encode_entry(entry: &FileTableEntry) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ENTRY_SIZE);
    out.extend_from_slice(&encode_path_field(&entry.path)?);
    out.extend_from_slice(&entry.file_id.to_be_bytes());
    out.extend_from_slice(&entry.vhd_uuid);
    out.extend_from_slice(&entry.vhd_timestamp.to_be_bytes());
    Ok(out)
}

fn decode_entry(bytes: &[u8]) -> Result<FileTableEntry> {
    if bytes.len() < ENTRY_SIZE {
        return Err(Error::short_io(ENTRY_SIZE, bytes.len()));
    }
    let path = decode_path_field(&bytes[0..PATH_FIELD_SIZE])?;
    let mut offset = PATH_FIELD_SIZE;
    let file_id = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let mut vhd_uuid = [0u8; 16];
    vhd_uuid.copy_from_slice(&bytes[offset..offset + 16]);
    offset += 16;
    let vhd_timestamp = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());

    Ok(FileTableEntry { path, file_id, vhd_uuid, vhd_timestamp })
}

struct FileTableHeader {
    files: u32,
    table_offset: u64,
}

/// Header in-transform. Deliberately not factored through a shared
/// direction-agnostic helper with [`decode_header`] — each direction names
/// its own fields so the two can't silently drift apart.
fn encode_header(header: &FileTableHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..8].copy_from_slice(MAGIC);
    out[8..12].copy_from_slice(&header.files.to_be_bytes());
    out[12..20].copy_from_slice(&header.table_offset.to_be_bytes());
    out
}

fn decode_header(bytes: &[u8]) -> Result<FileTableHeader> {
    if bytes.len() < 20 || &bytes[0..8] != MAGIC {
        return Err(Error::invalid_argument("bad .files magic"));
    }
    let files = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    let table_offset = u64::from_be_bytes(bytes[12..20].try_into().unwrap());
    Ok(FileTableHeader { files, table_offset })
}

/// An open `.files` file table.
pub struct FileTable {
    file: File,
    path: PathBuf,
}

impl FileTable {
    /// Initialize a new, empty `.files`; fails if `path` already exists.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(Error::already_exists(format!("{}", path.display())));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = FileTableHeader { files: 0, table_offset: HEADER_SIZE as u64 };
        file.write_all(&encode_header(&header))?;
        file.flush()?;

        debug!(path = %path.display(), "created .files");

        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        decode_header(&header_bytes)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    fn directory(&self) -> PathBuf {
        self.path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    }

    fn read_header(&mut self) -> Result<FileTableHeader> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = [0u8; HEADER_SIZE];
        self.file.read_exact(&mut bytes)?;
        decode_header(&bytes)
    }

    fn read_entries(&mut self, count: u32) -> Result<Vec<FileTableEntry>> {
        self.file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut entries = Vec::with_capacity(count as usize);
        let mut buf = vec![0u8; ENTRY_SIZE];
        for _ in 0..count {
            self.file.read_exact(&mut buf)?;
            entries.push(decode_entry(&buf)?);
        }
        Ok(entries)
    }

    /// Return `vhd_path`'s existing `file_id` if already present, otherwise
    /// add it.
    pub fn ensure(&mut self, vhd_path: &Path) -> Result<u32> {
        let dir = self.directory();
        let absolute = vhd_path
            .canonicalize()
            .map_err(|e| Error::no_such_entity(format!("{}: {e}", vhd_path.display())))?;
        let relative = relative_path_to(&dir, &absolute)?;

        let header = self.read_header()?;
        let existing = self.read_entries(header.files)?;

        if let Some(entry) = existing.iter().find(|e| e.path == relative) {
            return Ok(entry.file_id);
        }

        self.add(vhd_path)
    }

    /// Resolve `vhd_path` to its absolute form, reject it if already
    /// present, and assign it `max(existing file_ids) + 1`. Truncates back
    /// to the pre-append length on any error.
    pub fn add(&mut self, vhd_path: &Path) -> Result<u32> {
        let dir = self.directory();
        let absolute = vhd_path
            .canonicalize()
            .map_err(|e| Error::no_such_entity(format!("{}: {e}", vhd_path.display())))?;
        let relative = relative_path_to(&dir, &absolute)?;

        let header = self.read_header()?;
        let existing = self.read_entries(header.files)?;

        if existing.iter().any(|e| e.path == relative) {
            return Err(Error::already_exists(format!("{}", absolute.display())));
        }

        let next_file_id = existing.iter().map(|e| e.file_id).max().unwrap_or(0) + 1;

        let mut reader = VhdReader::open(&absolute)?;
        let vhd_uuid = reader.footer().uuid;
        let mtime = std::fs::metadata(&absolute)?
            .modified()
            .map_err(Error::from)?;
        let unix_secs = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| Error::custom(e.to_string()))?
            .as_secs() as i64;
        let vhd_timestamp = vhdindex_core::unix_to_vhd_time(unix_secs);

        let entry = FileTableEntry {
            path: relative,
            file_id: next_file_id,
            vhd_uuid,
            vhd_timestamp,
        };

        let pre_len = self.file.seek(SeekFrom::End(0))?;
        let result = (|| -> Result<()> {
            let bytes = encode_entry(&entry)?;
            self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(&bytes)?;

            let new_header = FileTableHeader {
                files: header.files + 1,
                table_offset: header.table_offset,
            };
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&encode_header(&new_header))?;
            self.file.flush()?;
            Ok(())
        })();

        if let Err(e) = result {
            self.file.set_len(pre_len)?;
            return Err(e);
        }

        drop(reader);
        Ok(next_file_id)
    }

    /// Load every entry, verifying each referenced VHD's uuid and mtime
    /// against the stored values. A single mismatch fails the whole load.
    pub fn load(&mut self) -> Result<Vec<FileTableEntry>> {
        let dir = self.directory();
        let header = self.read_header()?;
        let entries = self.read_entries(header.files)?;

        for entry in &entries {
            let absolute = resolve_relative(&dir, &entry.path)?;
            let reader = VhdReader::open(&absolute)?;

            if reader.footer().uuid != entry.vhd_uuid {
                return Err(Error::uuid_or_timestamp_mismatch(format!(
                    "{}: stored uuid does not match VHD footer uuid",
                    absolute.display()
                )));
            }

            let mtime = std::fs::metadata(&absolute)?.modified().map_err(Error::from)?;
            let unix_secs = mtime
                .duration_since(std::time::UNIX_EPOCH)
                .map_err(|e| Error::custom(e.to_string()))?
                .as_secs() as i64;
            let current_vhd_time = vhdindex_core::unix_to_vhd_time(unix_secs);

            if current_vhd_time != entry.vhd_timestamp {
                return Err(Error::uuid_or_timestamp_mismatch(format!(
                    "{}: mtime changed since index build",
                    absolute.display()
                )));
            }
        }

        Ok(entries)
    }
}

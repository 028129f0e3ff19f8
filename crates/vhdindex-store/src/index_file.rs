//! The `.index` file: a fixed header followed by appended, sector-padded
//! index blocks. Each block holds `spb` `{file_id, offset}` entries for one
//! virtual VHD block, where `spb = block_size / 512`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use vhdindex_core::types::bytes_padded;
use vhdindex_core::{Error, Result, SECTOR_SIZE};

pub const MAGIC: &[u8; 8] = b"vhdindex";
const HEADER_SECTORS: u64 = 1;
const HEADER_SIZE: usize = (HEADER_SECTORS * SECTOR_SIZE) as usize;
const ENTRY_SIZE: usize = 8;

/// One `{file_id, offset}` pair: the backing file and absolute sector at
/// which one virtual sector's data currently lives. `file_id == 0` or
/// `offset == UNUSED` means "not yet indexed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub file_id: u32,
    pub offset: u32,
}

impl IndexEntry {
    pub const EMPTY: IndexEntry = IndexEntry { file_id: 0, offset: vhdindex_core::UNUSED };

    pub fn is_empty(&self) -> bool {
        self.file_id == 0 || self.offset == vhdindex_core::UNUSED
    }

    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.file_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_SIZE {
            return Err(Error::short_io(ENTRY_SIZE, bytes.len()));
        }
        Ok(Self {
            file_id: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            offset: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        })
    }
}

struct IndexHeader {
    block_size: u32,
    table_offset: u64,
}

impl IndexHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(MAGIC);
        out[8..12].copy_from_slice(&self.block_size.to_be_bytes());
        out[12..20].copy_from_slice(&self.table_offset.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 20 || &bytes[0..8] != MAGIC {
            return Err(Error::invalid_argument("bad .index magic"));
        }
        let block_size = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        vhdindex_core::security::validate_block_size(block_size)?;
        let table_offset = u64::from_be_bytes(bytes[12..20].try_into().unwrap());
        Ok(Self { block_size, table_offset })
    }
}

/// An open `.index` file.
pub struct IndexFile {
    file: File,
    path: PathBuf,
    block_size: u32,
}

impl IndexFile {
    /// Initialize a new `.index` at `path`; fails if `path` already exists.
    pub fn create(path: &Path, block_size: u32) -> Result<Self> {
        vhdindex_core::security::validate_block_size(block_size)?;

        if path.exists() {
            return Err(Error::already_exists(format!("{}", path.display())));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = IndexHeader { block_size, table_offset: 0 };
        file.write_all(&header.encode())?;
        file.flush()?;

        debug!(path = %path.display(), block_size, "created .index");

        Ok(Self { file, path: path.to_path_buf(), block_size })
    }

    /// Open an existing `.index`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = IndexHeader::decode(&header_bytes)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size: header.block_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn spb(&self) -> u32 {
        vhdindex_format::sectors_per_block(self.block_size)
    }

    fn block_byte_len(&self) -> usize {
        bytes_padded(self.spb() as u64 * ENTRY_SIZE as u64) as usize
    }

    /// Append a new index block, returning its starting sector. Truncates
    /// the file back to its pre-append length on any I/O failure.
    pub fn append_block(&mut self, entries: &[IndexEntry]) -> Result<u32> {
        let pre_len = self.file.seek(SeekFrom::End(0))?;
        let padded_len = bytes_padded(pre_len);

        let result = (|| -> Result<u32> {
            self.file.seek(SeekFrom::Start(padded_len))?;
            let bytes = self.encode_block(entries)?;
            self.file.write_all(&bytes)?;
            self.file.flush()?;
            Ok((padded_len / SECTOR_SIZE) as u32)
        })();

        if result.is_err() {
            self.file.set_len(pre_len)?;
        }

        result
    }

    /// Overwrite an existing block at `sector`. The caller is responsible
    /// for ensuring `entries.len() == spb`.
    pub fn write_block(&mut self, entries: &[IndexEntry], sector: u32) -> Result<()> {
        let bytes = self.encode_block(entries)?;
        self.file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        Ok(())
    }

    /// Read an existing block at `sector`.
    pub fn read_block(&mut self, sector: u32) -> Result<Vec<IndexEntry>> {
        let block_len = self.block_byte_len();
        self.file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE))?;
        let mut bytes = vec![0u8; block_len];
        self.file.read_exact(&mut bytes)?;

        let spb = self.spb() as usize;
        let mut entries = Vec::with_capacity(spb);
        for i in 0..spb {
            entries.push(IndexEntry::decode(&bytes[i * ENTRY_SIZE..])?);
        }
        Ok(entries)
    }

    fn encode_block(&self, entries: &[IndexEntry]) -> Result<Vec<u8>> {
        let spb = self.spb() as usize;
        if entries.len() != spb {
            return Err(Error::invalid_argument(format!(
                "index block has {} entries, expected {spb}",
                entries.len()
            )));
        }

        let mut bytes = vec![0u8; self.block_byte_len()];
        for (i, entry) in entries.iter().enumerate() {
            bytes[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE].copy_from_slice(&entry.encode());
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_refuses_existing_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.index");
        IndexFile::create(&path, 2 * 1024 * 1024).unwrap();
        assert!(IndexFile::create(&path, 2 * 1024 * 1024).is_err());
    }

    #[test]
    fn append_and_read_block_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.index");
        let mut idx = IndexFile::create(&path, 4096).unwrap();

        let spb = idx.spb() as usize;
        let mut entries = vec![IndexEntry::EMPTY; spb];
        entries[0] = IndexEntry { file_id: 1, offset: 100 };

        let sector = idx.append_block(&entries).unwrap();
        let read_back = idx.read_block(sector).unwrap();
        assert_eq!(read_back, entries);
    }

    #[test]
    fn write_block_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.index");
        let mut idx = IndexFile::create(&path, 4096).unwrap();

        let spb = idx.spb() as usize;
        let entries = vec![IndexEntry::EMPTY; spb];
        let sector = idx.append_block(&entries).unwrap();

        let mut updated = entries.clone();
        updated[0] = IndexEntry { file_id: 2, offset: 55 };
        idx.write_block(&updated, sector).unwrap();

        assert_eq!(idx.read_block(sector).unwrap(), updated);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.index");
        std::fs::write(&path, [0u8; 512]).unwrap();
        assert!(IndexFile::open(&path).is_err());
    }
}

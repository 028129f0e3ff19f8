//! The per-child `.bat` file: a header naming the child VHD, its `.index`,
//! and its `.files`, followed by `vhd_blocks` u32 sector offsets into
//! `.index` (`0` means "no stored index block for this virtual block yet").

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use vhdindex_core::security::MAX_PATH_BYTES;
use vhdindex_core::types::bytes_padded;
use vhdindex_core::{Error, Result};
use vhdindex_format::{decode_path_field, encode_path_field, resolve_relative};

pub const MAGIC: &[u8; 8] = b"vhdi-bat";
const PATH_FIELD_SIZE: usize = 2 + MAX_PATH_BYTES;
const RAW_HEADER_SIZE: usize = 8 + 8 + 4 + PATH_FIELD_SIZE * 3 + 8;

struct BatHeader {
    vhd_blocks: u64,
    vhd_block_size: u32,
    vhd_path: String,
    index_path: String,
    file_table_path: String,
    table_offset: u64,
}

impl BatHeader {
    fn padded_size() -> usize {
        bytes_padded(RAW_HEADER_SIZE as u64) as usize
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::padded_size());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.vhd_blocks.to_be_bytes());
        out.extend_from_slice(&self.vhd_block_size.to_be_bytes());
        out.extend_from_slice(&encode_path_field(&self.vhd_path)?);
        out.extend_from_slice(&encode_path_field(&self.index_path)?);
        out.extend_from_slice(&encode_path_field(&self.file_table_path)?);
        out.extend_from_slice(&self.table_offset.to_be_bytes());
        out.resize(Self::padded_size(), 0);
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RAW_HEADER_SIZE || &bytes[0..8] != MAGIC {
            return Err(Error::invalid_argument("bad .bat magic"));
        }

        let vhd_blocks = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let vhd_block_size = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        vhdindex_core::security::validate_block_size(vhd_block_size)?;

        let mut offset = 20;
        let vhd_path = decode_path_field(&bytes[offset..offset + PATH_FIELD_SIZE])?;
        offset += PATH_FIELD_SIZE;
        let index_path = decode_path_field(&bytes[offset..offset + PATH_FIELD_SIZE])?;
        offset += PATH_FIELD_SIZE;
        let file_table_path = decode_path_field(&bytes[offset..offset + PATH_FIELD_SIZE])?;
        offset += PATH_FIELD_SIZE;

        let table_offset = u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap());

        Ok(Self {
            vhd_blocks,
            vhd_block_size,
            vhd_path,
            index_path,
            file_table_path,
            table_offset,
        })
    }
}

/// An open `.bat` file.
pub struct BatFile {
    file: File,
    path: PathBuf,
    header: BatHeader,
}

impl BatFile {
    /// Create a fresh `.bat` with all entries zeroed (no stored index
    /// blocks yet). `vhd_path`/`index_path`/`file_table_path` are stored
    /// relative to `bat_path`'s directory.
    pub fn create(
        bat_path: &Path,
        vhd_blocks: u64,
        vhd_block_size: u32,
        vhd_path: &Path,
        index_path: &Path,
        file_table_path: &Path,
    ) -> Result<Self> {
        if bat_path.exists() {
            return Err(Error::already_exists(format!("{}", bat_path.display())));
        }

        let dir = bat_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

        let header = BatHeader {
            vhd_blocks,
            vhd_block_size,
            vhd_path: vhdindex_format::relative_path_to(&dir, vhd_path)?,
            index_path: vhdindex_format::relative_path_to(&dir, index_path)?,
            file_table_path: vhdindex_format::relative_path_to(&dir, file_table_path)?,
            table_offset: BatHeader::padded_size() as u64,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(bat_path)?;

        file.write_all(&header.encode()?)?;
        file.write_all(&vec![0u8; vhd_blocks as usize * 4])?;
        file.flush()?;

        debug!(path = %bat_path.display(), vhd_blocks, "created .bat");

        Ok(Self { file, path: bat_path.to_path_buf(), header })
    }

    /// Open an existing `.bat`, verifying that the three referenced files
    /// exist when resolved against `bat_path`'s directory.
    pub fn load(bat_path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(bat_path)?;
        let mut header_bytes = vec![0u8; BatHeader::padded_size()];
        file.read_exact(&mut header_bytes)?;
        let header = BatHeader::decode(&header_bytes)?;

        let dir = bat_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        for relative in [&header.vhd_path, &header.index_path, &header.file_table_path] {
            let resolved = resolve_relative(&dir, relative)?;
            if !resolved.is_file() {
                return Err(Error::no_such_entity(format!("{}", resolved.display())));
            }
        }

        Ok(Self { file, path: bat_path.to_path_buf(), header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vhd_blocks(&self) -> u64 {
        self.header.vhd_blocks
    }

    pub fn vhd_block_size(&self) -> u32 {
        self.header.vhd_block_size
    }

    pub fn vhd_path(&self) -> &str {
        &self.header.vhd_path
    }

    pub fn index_path(&self) -> &str {
        &self.header.index_path
    }

    pub fn file_table_path(&self) -> &str {
        &self.header.file_table_path
    }

    fn entry_offset(&self, block_index: u64) -> u64 {
        BatHeader::padded_size() as u64 + block_index * 4
    }

    /// Sector offset into `.index` for `block_index`, or `0` if unset.
    pub fn get(&mut self, block_index: u64) -> Result<u32> {
        self.file.seek(SeekFrom::Start(self.entry_offset(block_index)))?;
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Set the sector offset for `block_index`.
    pub fn set(&mut self, block_index: u64, sector: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.entry_offset(block_index)))?;
        self.file.write_all(&sector.to_be_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Read every entry in block order.
    pub fn load_entries(&mut self) -> Result<Vec<u32>> {
        self.file
            .seek(SeekFrom::Start(BatHeader::padded_size() as u64))?;
        let mut bytes = vec![0u8; self.header.vhd_blocks as usize * 4];
        self.file.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn create_and_load_round_trips_entries() {
        let dir = TempDir::new().unwrap();
        let vhd_path = dir.path().join("child.vhd");
        let index_path = dir.path().join("chain.index");
        let files_path = dir.path().join("chain.files");
        let bat_path = dir.path().join("child.bat");

        fs::write(&vhd_path, b"vhd").unwrap();
        fs::write(&index_path, b"index").unwrap();
        fs::write(&files_path, b"files").unwrap();

        let mut bat = BatFile::create(&bat_path, 4, 2 * 1024 * 1024, &vhd_path, &index_path, &files_path).unwrap();
        bat.set(1, 42).unwrap();
        assert_eq!(bat.get(1).unwrap(), 42);
        assert_eq!(bat.get(0).unwrap(), 0);

        let mut reopened = BatFile::load(&bat_path).unwrap();
        assert_eq!(reopened.vhd_blocks(), 4);
        assert_eq!(reopened.load_entries().unwrap(), vec![0, 42, 0, 0]);
    }

    #[test]
    fn load_fails_when_referenced_file_missing() {
        let dir = TempDir::new().unwrap();
        let vhd_path = dir.path().join("child.vhd");
        let index_path = dir.path().join("chain.index");
        let files_path = dir.path().join("chain.files");
        let bat_path = dir.path().join("child.bat");

        fs::write(&vhd_path, b"vhd").unwrap();
        fs::write(&index_path, b"index").unwrap();
        fs::write(&files_path, b"files").unwrap();

        BatFile::create(&bat_path, 4, 2 * 1024 * 1024, &vhd_path, &index_path, &files_path).unwrap();
        fs::remove_file(&index_path).unwrap();

        assert!(BatFile::load(&bat_path).is_err());
    }
}

//! VHD (Virtual Hard Disk) reader.
//!
//! Opens a single VHD file, validates and exposes its footer, dynamic
//! header, and Block Allocation Table, and provides sector- and
//! block-granularity reads plus allocation-bitmap tests. This is the
//! read-only substrate the index builder (which walks a whole VHD chain)
//! and the index-backed driver are built on; it never writes to a VHD.

pub mod types;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use vhdindex_core::{Error, Result, SECTOR_SIZE};

pub use types::{
    BlockAllocationTable, DiskGeometry, ParentLocatorEntry, VhdDynamicHeader, VhdFooter, VhdType,
};

const FOOTER_OPEN_RETRIES: u32 = 10;
const FOOTER_OPEN_RETRY_SPACING: Duration = Duration::from_secs(1);

/// A validated, open VHD file: footer plus (for dynamic/differencing
/// disks) dynamic header and BAT.
pub struct VhdReader {
    file: File,
    path: PathBuf,
    footer: VhdFooter,
    dynamic_header: Option<VhdDynamicHeader>,
    bat: Option<BlockAllocationTable>,
}

impl VhdReader {
    /// Open and validate a VHD file. Reads the footer from end-of-file
    /// first; falls back to the 511-byte "short footer" variant at
    /// `EOF - 511`, then to the backup footer at offset 0, retrying each
    /// candidate up to [`FOOTER_OPEN_RETRIES`] times on transient I/O
    /// errors.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        if file_len < VhdFooter::SIZE as u64 {
            return Err(Error::invalid_argument(format!(
                "{}: too small to be a VHD",
                path.display()
            )));
        }

        let footer = Self::read_footer_with_fallback(&mut file, file_len, path)?;

        match footer.disk_type {
            VhdType::Fixed => Ok(Self {
                file,
                path: path.to_path_buf(),
                footer,
                dynamic_header: None,
                bat: None,
            }),
            VhdType::Dynamic | VhdType::Differencing => {
                if footer.data_offset == u64::MAX {
                    return Err(Error::invalid_argument(format!(
                        "{}: dynamic VHD has no data offset",
                        path.display()
                    )));
                }

                file.seek(SeekFrom::Start(footer.data_offset))?;
                let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
                file.read_exact(&mut header_bytes)?;
                let dynamic_header = VhdDynamicHeader::parse(&header_bytes)?;

                if !dynamic_header.verify_checksum() {
                    return Err(Error::checksum_mismatch(format!(
                        "{}: dynamic header checksum mismatch",
                        path.display()
                    )));
                }

                let block_count = (footer.current_size / dynamic_header.block_size as u64) as usize;
                file.seek(SeekFrom::Start(dynamic_header.table_offset))?;
                let mut bat_bytes = vec![0u8; block_count * 4];
                file.read_exact(&mut bat_bytes)?;
                let bat = BlockAllocationTable::parse(&bat_bytes, dynamic_header.block_size)?;

                debug!(
                    path = %path.display(),
                    block_size = dynamic_header.block_size,
                    block_count,
                    "opened dynamic VHD"
                );

                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                    footer,
                    dynamic_header: Some(dynamic_header),
                    bat: Some(bat),
                })
            }
            other => Err(Error::invalid_argument(format!(
                "{}: unsupported VHD disk type {other:?}",
                path.display()
            ))),
        }
    }

    fn read_footer_with_fallback(file: &mut File, file_len: u64, path: &Path) -> Result<VhdFooter> {
        let candidates: [(i64, u64); 3] = [
            (-(VhdFooter::SIZE as i64), VhdFooter::SIZE as u64),
            (-511, 511),
            (0, VhdFooter::SIZE as u64),
        ];

        let mut last_err = None;
        for (rel_offset, len) in candidates {
            let seek_from = if rel_offset < 0 {
                if file_len < len {
                    continue;
                }
                SeekFrom::End(rel_offset)
            } else {
                SeekFrom::Start(0)
            };

            match Self::try_read_footer_at(file, seek_from, len as usize, path) {
                Ok(footer) => return Ok(footer),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::invalid_argument(format!("{}: no valid VHD footer found", path.display()))
        }))
    }

    fn try_read_footer_at(
        file: &mut File,
        seek_from: SeekFrom,
        len: usize,
        path: &Path,
    ) -> Result<VhdFooter> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<VhdFooter> = (|| {
                file.seek(seek_from)?;
                let mut bytes = vec![0u8; len.max(VhdFooter::SIZE)];
                if len < VhdFooter::SIZE {
                    file.read_exact(&mut bytes[..len])?;
                } else {
                    file.read_exact(&mut bytes[..VhdFooter::SIZE])?;
                }
                let footer = VhdFooter::parse(&bytes[..VhdFooter::SIZE])?;
                if !footer.verify_checksum() {
                    return Err(Error::checksum_mismatch(format!(
                        "{}: footer checksum mismatch",
                        path.display()
                    )));
                }
                Ok(footer)
            })();

            match result {
                Ok(footer) => return Ok(footer),
                Err(Error::Io(_)) if attempt < FOOTER_OPEN_RETRIES => {
                    warn!(attempt, "transient error reading VHD footer, retrying");
                    thread::sleep(FOOTER_OPEN_RETRY_SPACING);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn dynamic_header(&self) -> Option<&VhdDynamicHeader> {
        self.dynamic_header.as_ref()
    }

    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        self.bat.as_ref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.footer.disk_type.is_dynamic()
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.dynamic_header
            .as_ref()
            .map(|h| h.spb())
            .unwrap_or(0)
    }

    fn bm_secs(&self) -> u32 {
        self.dynamic_header.as_ref().map(|h| h.bm_secs()).unwrap_or(0)
    }

    /// Whether this image uses the legacy tapdisk word-order bitmap
    /// encoding (`creator_app == "tap"`, `creator_version == 0x00000001`).
    fn uses_legacy_bitmap_order(&self) -> bool {
        self.footer.creator_is_tap() && self.footer.creator_version == 0x0000_0001
    }

    /// Read the sector-padded allocation bitmap for virtual block `block_index`.
    pub fn read_bitmap(&mut self, block_index: usize) -> Result<Vec<u8>> {
        let bat = self
            .bat
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("fixed VHD has no BAT"))?;

        let sector = bat.get_block_sector(block_index).ok_or_else(|| {
            Error::no_such_entity(format!("block {block_index} is not allocated"))
        })?;

        let bm_bytes = self.bm_secs() as u64 * SECTOR_SIZE;
        self.file
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE))?;
        let mut bitmap = vec![0u8; bm_bytes as usize];
        self.file.read_exact(&mut bitmap)?;
        Ok(bitmap)
    }

    /// Test bit `i` of a bitmap previously returned by [`read_bitmap`],
    /// dispatching on the legacy word-order encoding when applicable.
    pub fn bitmap_test(&self, bitmap: &[u8], i: usize) -> bool {
        if self.uses_legacy_bitmap_order() {
            let word_index = i >> 5;
            let offset = word_index * 4;
            if offset + 4 > bitmap.len() {
                return false;
            }
            let word = u32::from_be_bytes(bitmap[offset..offset + 4].try_into().unwrap());
            (word >> (i & 31)) & 1 != 0
        } else {
            let byte_index = i >> 3;
            if byte_index >= bitmap.len() {
                return false;
            }
            (bitmap[byte_index] >> (7 - (i & 7))) & 1 != 0
        }
    }

    /// Read one data sector of virtual block `block_index` at sector
    /// offset `sector_in_block` within that block (post-bitmap).
    pub fn read_block_sector(
        &mut self,
        block_index: usize,
        sector_in_block: u32,
    ) -> Result<[u8; SECTOR_SIZE as usize]> {
        let bat = self
            .bat
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("fixed VHD has no BAT"))?;

        let sector = bat.get_block_sector(block_index).ok_or_else(|| {
            Error::no_such_entity(format!("block {block_index} is not allocated"))
        })?;

        let bm_secs = self.bm_secs() as u64;
        let offset = (sector as u64 + bm_secs + sector_in_block as u64) * SECTOR_SIZE;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; SECTOR_SIZE as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Byte offset within the file at which virtual block `block_index`'s
    /// `(bitmap || data)` region begins, or `None` if unallocated.
    pub fn block_byte_offset(&self, block_index: usize) -> Option<u64> {
        self.bat
            .as_ref()
            .and_then(|bat| bat.get_block_sector(block_index))
            .map(|sector| sector as u64 * SECTOR_SIZE)
    }

    /// Read a fixed VHD's raw data sector at absolute virtual sector
    /// index `sector_index` (fixed disks have no BAT: content is
    /// contiguous from byte 0).
    pub fn read_fixed_sector(&mut self, sector_index: u64) -> Result<[u8; SECTOR_SIZE as usize]> {
        if self.footer.disk_type != VhdType::Fixed {
            return Err(Error::invalid_argument("not a fixed VHD"));
        }
        self.file
            .seek(SeekFrom::Start(sector_index * SECTOR_SIZE))?;
        let mut buf = [0u8; SECTOR_SIZE as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Resolve this differencing disk's parent, trying parent-locator
    /// entries in order (Mac/MacX first, then the Windows variants) and
    /// returning the first path that exists on disk.
    pub fn parent_path(&mut self) -> Result<PathBuf> {
        let header = self
            .dynamic_header
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("not a differencing VHD"))?;

        let child_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let use_be = self.footer.creator_is_tap() && self.footer.creator_version == 0x0000_0001;

        let mut locators: Vec<_> = header.parent_locators();
        locators.sort_by_key(|l| if l.is_mac() { 0 } else { 1 });

        for locator in locators {
            let name = match self.read_parent_locator_name(&locator, use_be) {
                Ok(name) => name,
                Err(_) => continue,
            };

            let normalized = name.replace('\\', "/");
            let stripped = strip_drive_prefix(&normalized);

            if let Ok(resolved) = vhdindex_format::resolve_relative(&child_dir, stripped) {
                if resolved.is_file() {
                    return Ok(resolved);
                }
            }
        }

        Err(Error::no_such_entity(format!(
            "{}: no readable parent locator",
            self.path.display()
        )))
    }

    fn read_parent_locator_name(&mut self, locator: &ParentLocatorEntry, use_be: bool) -> Result<String> {
        self.file
            .seek(SeekFrom::Start(locator.platform_data_offset))?;
        let mut raw = vec![0u8; locator.platform_data_length as usize];
        self.file.read_exact(&mut raw)?;

        if raw.len() % 2 != 0 {
            return Err(Error::encoding("parent locator data has odd byte length"));
        }

        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| {
                if use_be {
                    u16::from_be_bytes([pair[0], pair[1]])
                } else {
                    u16::from_le_bytes([pair[0], pair[1]])
                }
            })
            .collect();

        String::from_utf16(&units)
            .map(|s| s.trim_end_matches('\0').to_string())
            .map_err(|e| Error::encoding(format!("invalid UTF-16 parent locator name: {e}")))
    }
}

fn strip_drive_prefix(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        path[2..].trim_start_matches('/')
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use types::DiskGeometry;

    fn test_footer(size: u64, disk_type: VhdType, creator_app: &[u8; 4], creator_version: u32) -> VhdFooter {
        let mut footer = VhdFooter {
            cookie: *VhdFooter::COOKIE,
            features: 2,
            version: 0x0001_0000,
            data_offset: if disk_type == VhdType::Fixed {
                u64::MAX
            } else {
                VhdFooter::SIZE as u64
            },
            timestamp: 0,
            creator_app: *creator_app,
            creator_version,
            creator_os: 0x5769326B,
            original_size: size,
            current_size: size,
            geometry: DiskGeometry {
                cylinders: 1024,
                heads: 16,
                sectors: 63,
            },
            disk_type,
            checksum: 0,
            uuid: [0u8; 16],
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.checksum = footer_checksum(&footer);
        footer
    }

    fn footer_checksum(footer: &VhdFooter) -> u32 {
        let mut bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut bytes);
        bytes[64..68].fill(0);
        let mut sum: u32 = 0;
        for &b in bytes.iter() {
            sum = sum.wrapping_add(b as u32);
        }
        !sum
    }

    fn test_dynamic_header(block_count: u32, block_size: u32) -> VhdDynamicHeader {
        let bat_offset = VhdFooter::SIZE + VhdDynamicHeader::SIZE;
        let mut header = VhdDynamicHeader {
            cookie: *VhdDynamicHeader::COOKIE,
            data_offset: u64::MAX,
            table_offset: bat_offset as u64,
            header_version: 0x0001_0000,
            max_table_entries: block_count,
            block_size,
            checksum: 0,
            parent_uuid: [0u8; 16],
            parent_timestamp: 0,
            reserved1: 0,
            parent_unicode_name: [0u16; 256],
            parent_locator_entries: [[0u8; 24]; 8],
            reserved2: [0u8; 256],
        };
        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut bytes);
        bytes[36..40].fill(0);
        let mut sum: u32 = 0;
        for &b in bytes.iter() {
            sum = sum.wrapping_add(b as u32);
        }
        header.checksum = !sum;
        header
    }

    fn build_fixed_vhd(data_size: usize) -> Vec<u8> {
        let mut vhd = Vec::new();
        let data: Vec<u8> = (0..data_size).map(|i| (i % 256) as u8).collect();
        vhd.extend_from_slice(&data);
        let footer = test_footer(data_size as u64, VhdType::Fixed, b"test", 0x0001_0000);
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);
        vhd.extend_from_slice(&footer_bytes);
        vhd
    }

    fn build_dynamic_vhd(
        virtual_size: u64,
        block_size: u32,
        allocated_blocks: &[usize],
    ) -> Vec<u8> {
        let mut vhd = Vec::new();
        let block_count = (virtual_size / block_size as u64) as u32;

        let footer = test_footer(virtual_size, VhdType::Dynamic, b"test", 0x0001_0000);
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);
        vhd.extend_from_slice(&footer_bytes);

        let header = test_dynamic_header(block_count, block_size);
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut header_bytes);
        vhd.extend_from_slice(&header_bytes);

        let bat_offset = vhd.len();
        let bm_secs = vhdindex_format::bitmap_sectors(vhdindex_format::sectors_per_block(block_size));
        let mut bat_entries = vec![0xFFFF_FFFFu32; block_count as usize];
        let mut next_sector = ((bat_offset + block_count as usize * 4 + 511) / 512) as u32;

        for &block_idx in allocated_blocks {
            if block_idx < block_count as usize {
                bat_entries[block_idx] = next_sector;
                let block_total_sectors = bm_secs + block_size / 512;
                next_sector += block_total_sectors;
            }
        }

        for &entry in &bat_entries {
            vhd.extend_from_slice(&entry.to_be_bytes());
        }
        while vhd.len() % 512 != 0 {
            vhd.push(0);
        }

        for &block_idx in allocated_blocks {
            if block_idx < block_count as usize {
                vhd.extend_from_slice(&vec![0xFFu8; (bm_secs * 512) as usize]);
                for i in 0..block_size {
                    let virtual_offset = block_idx as u64 * block_size as u64 + i as u64;
                    vhd.push((virtual_offset % 256) as u8);
                }
                while vhd.len() % 512 != 0 {
                    vhd.push(0);
                }
            }
        }

        vhd.extend_from_slice(&footer_bytes);
        vhd
    }

    #[test]
    fn opens_fixed_vhd() {
        let data = build_fixed_vhd(1024);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let reader = VhdReader::open(tmp.path()).unwrap();
        assert_eq!(reader.footer().current_size, 1024);
        assert!(!reader.is_dynamic());
    }

    #[test]
    fn reads_fixed_sector() {
        let data = build_fixed_vhd(1024);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut reader = VhdReader::open(tmp.path()).unwrap();
        let sector = reader.read_fixed_sector(0).unwrap();
        assert_eq!(&sector[0..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn rejects_invalid_footer() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 1024]).unwrap();
        tmp.flush().unwrap();
        assert!(VhdReader::open(tmp.path()).is_err());
    }

    #[test]
    fn opens_dynamic_vhd_and_reads_allocated_block() {
        let block_size = 4096u32;
        let virtual_size = 16384u64;
        let data = build_dynamic_vhd(virtual_size, block_size, &[0, 2]);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut reader = VhdReader::open(tmp.path()).unwrap();
        assert!(reader.is_dynamic());
        assert_eq!(reader.sectors_per_block(), block_size / 512);

        let sector = reader.read_block_sector(0, 0).unwrap();
        assert_eq!(&sector[0..8], &[0, 1, 2, 3, 4, 5, 6, 7]);

        assert!(reader.block_byte_offset(1).is_none());
        assert!(reader.block_byte_offset(2).is_some());
    }

    #[test]
    fn bitmap_reports_all_sectors_used_when_fully_set() {
        let block_size = 4096u32;
        let virtual_size = 16384u64;
        let data = build_dynamic_vhd(virtual_size, block_size, &[0]);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut reader = VhdReader::open(tmp.path()).unwrap();
        let bitmap = reader.read_bitmap(0).unwrap();
        for i in 0..(block_size / 512) as usize {
            assert!(reader.bitmap_test(&bitmap, i));
        }
    }

    #[test]
    fn bitmap_test_dispatches_legacy_tapdisk_word_order() {
        let block_size = 4096u32;
        let virtual_size = 4096u64;
        let mut vhd = Vec::new();

        let footer = test_footer(virtual_size, VhdType::Dynamic, b"tap\0", 0x0000_0001);
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);
        vhd.extend_from_slice(&footer_bytes);

        let header = test_dynamic_header(1, block_size);
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut header_bytes);
        vhd.extend_from_slice(&header_bytes);

        let bat_offset = vhd.len();
        let bm_secs = vhdindex_format::bitmap_sectors(vhdindex_format::sectors_per_block(block_size));
        let next_sector = ((bat_offset + 4 + 511) / 512) as u32;
        vhd.extend_from_slice(&next_sector.to_be_bytes());
        while vhd.len() % 512 != 0 {
            vhd.push(0);
        }

        // Bit 9, encoded as a big-endian 32-bit word: the legacy tapdisk
        // layout reads this differently than the byte-indexed layout every
        // other creator version uses, so this pattern tells them apart.
        let mut bitmap = vec![0u8; (bm_secs * 512) as usize];
        bitmap[0..4].copy_from_slice(&(1u32 << 9).to_be_bytes());
        vhd.extend_from_slice(&bitmap);
        vhd.extend_from_slice(&vec![0u8; block_size as usize]);
        while vhd.len() % 512 != 0 {
            vhd.push(0);
        }

        vhd.extend_from_slice(&footer_bytes);

        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&vhd).unwrap();
        tmp.flush().unwrap();

        let mut reader = VhdReader::open(tmp.path()).unwrap();
        let bitmap = reader.read_bitmap(0).unwrap();
        assert!(reader.bitmap_test(&bitmap, 9));
        assert!(!reader.bitmap_test(&bitmap, 8));
        assert!(!reader.bitmap_test(&bitmap, 1));
    }

    #[test]
    fn bat_clamps_to_current_size_block_count() {
        let block_size = 4096u32;
        let virtual_size = 8192u64; // 2 blocks
        let data = build_dynamic_vhd(virtual_size, block_size, &[0]);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let reader = VhdReader::open(tmp.path()).unwrap();
        assert_eq!(reader.bat().unwrap().entries.len(), 2);
    }
}

//! On-disk structures for the VHD footer, dynamic header, BAT, and parent
//! locator entries.

use vhdindex_core::Result;

/// VHD disk type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VhdType {
    None = 0,
    Reserved1 = 1,
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
    Reserved5 = 5,
    Reserved6 = 6,
}

impl VhdType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(VhdType::None),
            1 => Ok(VhdType::Reserved1),
            2 => Ok(VhdType::Fixed),
            3 => Ok(VhdType::Dynamic),
            4 => Ok(VhdType::Differencing),
            5 => Ok(VhdType::Reserved5),
            6 => Ok(VhdType::Reserved6),
            _ => Err(vhdindex_core::Error::invalid_argument(format!(
                "invalid VHD disk type: {value}"
            ))),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, VhdType::Dynamic | VhdType::Differencing)
    }

    pub fn is_differencing(&self) -> bool {
        matches!(self, VhdType::Differencing)
    }
}

/// Disk geometry (CHS addressing).
#[derive(Debug, Clone, Copy)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let cyl_bytes = self.cylinders.to_be_bytes();
        [cyl_bytes[0], cyl_bytes[1], self.heads, self.sectors]
    }
}

/// VHD Footer structure (512 bytes). Appears at EOF for all VHDs, and also
/// at offset 0 for dynamic/differencing VHDs as a recovery copy.
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub cookie: [u8; 8],
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: VhdType,
    pub checksum: u32,
    pub uuid: [u8; 16],
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

impl VhdFooter {
    pub const COOKIE: &'static [u8; 8] = b"conectix";
    pub const SIZE: usize = 512;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(vhdindex_core::Error::invalid_argument("VHD footer too small"));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);

        if &cookie != Self::COOKIE {
            return Err(vhdindex_core::Error::checksum_mismatch(format!(
                "invalid footer cookie: '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let features = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let version = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let data_offset = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        let timestamp = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);

        let creator_version = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        let creator_os = u32::from_be_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]);
        let original_size = u64::from_be_bytes(bytes[40..48].try_into().unwrap());
        let current_size = u64::from_be_bytes(bytes[48..56].try_into().unwrap());

        let geometry = DiskGeometry::parse(&bytes[56..60]);

        let disk_type_raw = u32::from_be_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]);
        let disk_type = VhdType::from_u32(disk_type_raw)?;

        let checksum = u32::from_be_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]);

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[68..84]);

        let saved_state = bytes[84];

        let mut reserved = [0u8; 427];
        reserved.copy_from_slice(&bytes[85..512]);

        Ok(Self {
            cookie,
            features,
            version,
            data_offset,
            timestamp,
            creator_app,
            creator_version,
            creator_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            checksum,
            uuid,
            saved_state,
            reserved,
        })
    }

    /// Whether the `hidden` reserved byte is set (legacy tapdisk marker).
    pub fn hidden(&self) -> u8 {
        self.reserved[0]
    }

    pub fn set_hidden(&mut self, value: u8) {
        self.reserved[0] = value;
    }

    /// Whether this footer was produced by tapdisk (`creator_app == "tap "`).
    pub fn creator_is_tap(&self) -> bool {
        &self.creator_app == b"tap\0" || &self.creator_app == b"tap "
    }

    fn checksum_over(&self) -> u32 {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        bytes[64..68].fill(0);

        let mut sum: u32 = 0;
        for &byte in bytes.iter() {
            sum = sum.wrapping_add(byte as u32);
        }
        !sum
    }

    /// Verify the footer checksum, including the legacy "hidden byte was
    /// toggled without rechecksum" recovery for early tapdisk-produced
    /// images (`creator_app == "tap"`, version 0.1 or 1.1, `hidden` set).
    pub fn verify_checksum(&self) -> bool {
        if self.checksum_over() == self.checksum {
            return true;
        }

        if self.hidden() != 0
            && self.creator_is_tap()
            && (self.creator_version == 0x0000_0001 || self.creator_version == 0x0001_0001)
        {
            let mut probe = self.clone();
            probe.set_hidden(0);
            if probe.checksum_over() == self.checksum {
                return true;
            }
        }

        false
    }

    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        bytes[60..64].copy_from_slice(&(self.disk_type as u32).to_be_bytes());
        bytes[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[68..84].copy_from_slice(&self.uuid);
        bytes[84] = self.saved_state;
        bytes[85..512].copy_from_slice(&self.reserved);
    }
}

/// VHD Dynamic Header structure (1024 bytes), at `footer.data_offset` for
/// dynamic and differencing disks.
#[derive(Debug, Clone)]
pub struct VhdDynamicHeader {
    pub cookie: [u8; 8],
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: [u8; 16],
    pub parent_timestamp: u32,
    pub reserved1: u32,
    pub parent_unicode_name: [u16; 256],
    pub parent_locator_entries: [[u8; 24]; 8],
    pub reserved2: [u8; 256],
}

impl VhdDynamicHeader {
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";
    pub const SIZE: usize = 1024;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(vhdindex_core::Error::invalid_argument(
                "VHD dynamic header too small",
            ));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);

        if &cookie != Self::COOKIE {
            return Err(vhdindex_core::Error::checksum_mismatch(format!(
                "invalid dynamic header cookie: '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let data_offset = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let table_offset = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        let header_version = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        let max_table_entries = u32::from_be_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
        let block_size = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        vhdindex_core::security::validate_block_size(block_size)?;
        let checksum = u32::from_be_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]);

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&bytes[40..56]);

        let parent_timestamp = u32::from_be_bytes([bytes[56], bytes[57], bytes[58], bytes[59]]);
        let reserved1 = u32::from_be_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]);

        let mut parent_unicode_name = [0u16; 256];
        for (i, slot) in parent_unicode_name.iter_mut().enumerate() {
            let offset = 64 + i * 2;
            *slot = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        }

        let mut parent_locator_entries = [[0u8; 24]; 8];
        for (i, slot) in parent_locator_entries.iter_mut().enumerate() {
            let offset = 576 + i * 24;
            slot.copy_from_slice(&bytes[offset..offset + 24]);
        }

        let mut reserved2 = [0u8; 256];
        reserved2.copy_from_slice(&bytes[768..1024]);

        Ok(Self {
            cookie,
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            block_size,
            checksum,
            parent_uuid,
            parent_timestamp,
            reserved1,
            parent_unicode_name,
            parent_locator_entries,
            reserved2,
        })
    }

    pub fn verify_checksum(&self) -> bool {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        bytes[36..40].fill(0);

        let mut sum: u32 = 0;
        for &byte in bytes.iter() {
            sum = sum.wrapping_add(byte as u32);
        }

        !sum == self.checksum
    }

    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[40..56].copy_from_slice(&self.parent_uuid);
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        bytes[60..64].copy_from_slice(&self.reserved1.to_be_bytes());

        for (i, value) in self.parent_unicode_name.iter().enumerate() {
            let offset = 64 + i * 2;
            bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        }

        for (i, entry) in self.parent_locator_entries.iter().enumerate() {
            let offset = 576 + i * 24;
            bytes[offset..offset + 24].copy_from_slice(entry);
        }

        bytes[768..1024].copy_from_slice(&self.reserved2);
    }

    pub fn spb(&self) -> u32 {
        vhdindex_format::sectors_per_block(self.block_size)
    }

    pub fn bm_secs(&self) -> u32 {
        vhdindex_format::bitmap_sectors(self.spb())
    }

    pub fn parent_locators(&self) -> Vec<ParentLocatorEntry> {
        self.parent_locator_entries
            .iter()
            .filter_map(|entry| ParentLocatorEntry::parse(entry).ok())
            .filter(|entry| entry.is_valid())
            .collect()
    }
}

/// Block Allocation Table for dynamic VHDs: maps virtual blocks to the
/// sector offset of their `(bitmap || data)` region, or `UNUSED`.
#[derive(Clone)]
pub struct BlockAllocationTable {
    pub entries: Vec<u32>,
    pub block_size: u32,
}

impl BlockAllocationTable {
    pub fn parse(bytes: &[u8], block_size: u32) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(vhdindex_core::Error::invalid_argument(
                "BAT size must be a multiple of 4",
            ));
        }

        let entry_count = bytes.len() / 4;
        let mut entries = Vec::with_capacity(entry_count);

        for i in 0..entry_count {
            let offset = i * 4;
            entries.push(u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]));
        }

        Ok(Self { entries, block_size })
    }

    /// Sector offset of block `block_index`'s `(bitmap || data)` region, or
    /// `None` if unallocated.
    pub fn get_block_sector(&self, block_index: usize) -> Option<u32> {
        let entry = *self.entries.get(block_index)?;
        if entry == vhdindex_core::UNUSED {
            None
        } else {
            Some(entry)
        }
    }
}

/// Parent Locator Entry (24 bytes), used by differencing disks to locate
/// their parent VHD.
#[derive(Debug, Clone)]
pub struct ParentLocatorEntry {
    pub platform_code: [u8; 4],
    pub platform_data_space: u32,
    pub platform_data_length: u32,
    pub reserved: u32,
    pub platform_data_offset: u64,
}

impl ParentLocatorEntry {
    pub const PLATFORM_NONE: &'static [u8; 4] = b"\0\0\0\0";
    pub const PLATFORM_W2KU: &'static [u8; 4] = b"W2ku";
    pub const PLATFORM_W2RU: &'static [u8; 4] = b"W2ru";
    pub const PLATFORM_MAC: &'static [u8; 4] = b"Mac ";
    pub const PLATFORM_MACX: &'static [u8; 4] = b"MacX";

    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(vhdindex_core::Error::invalid_argument(
                "parent locator entry too small",
            ));
        }

        let mut platform_code = [0u8; 4];
        platform_code.copy_from_slice(&bytes[0..4]);

        let platform_data_space = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let platform_data_length = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let reserved = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let platform_data_offset = u64::from_be_bytes(bytes[16..24].try_into().unwrap());

        Ok(Self {
            platform_code,
            platform_data_space,
            platform_data_length,
            reserved,
            platform_data_offset,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.platform_code != *Self::PLATFORM_NONE && self.platform_data_length > 0
    }

    pub fn is_windows_unicode(&self) -> bool {
        &self.platform_code == Self::PLATFORM_W2KU
    }

    pub fn is_windows_ansi(&self) -> bool {
        &self.platform_code == Self::PLATFORM_W2RU
    }

    pub fn is_mac(&self) -> bool {
        &self.platform_code == Self::PLATFORM_MAC || &self.platform_code == Self::PLATFORM_MACX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vhd_type_from_u32() {
        assert!(matches!(VhdType::from_u32(0).unwrap(), VhdType::None));
        assert!(matches!(VhdType::from_u32(2).unwrap(), VhdType::Fixed));
        assert!(matches!(VhdType::from_u32(3).unwrap(), VhdType::Dynamic));
        assert!(matches!(
            VhdType::from_u32(4).unwrap(),
            VhdType::Differencing
        ));
        assert!(VhdType::from_u32(99).is_err());
    }

    #[test]
    fn test_disk_geometry_round_trip() {
        let geom = DiskGeometry {
            cylinders: 1024,
            heads: 16,
            sectors: 63,
        };
        let bytes = geom.to_bytes();
        let parsed = DiskGeometry::parse(&bytes);
        assert_eq!(parsed.cylinders, geom.cylinders);
        assert_eq!(parsed.heads, geom.heads);
        assert_eq!(parsed.sectors, geom.sectors);
    }

    #[test]
    fn test_vhd_footer_invalid_cookie() {
        let mut bytes = [0u8; 512];
        bytes[0..8].copy_from_slice(b"notvalid");
        assert!(VhdFooter::parse(&bytes).is_err());
    }

    #[test]
    fn test_vhd_dynamic_header_invalid_cookie() {
        let mut bytes = [0u8; 1024];
        bytes[0..8].copy_from_slice(b"notvalid");
        assert!(VhdDynamicHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_bat_parse() {
        let mut bytes = vec![0u8; 12];
        bytes[0..4].copy_from_slice(&0x0000_1000u32.to_be_bytes());
        bytes[4..8].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        bytes[8..12].copy_from_slice(&0x0000_2000u32.to_be_bytes());

        let bat = BlockAllocationTable::parse(&bytes, 2 * 1024 * 1024).unwrap();

        assert_eq!(bat.entries.len(), 3);
        assert_eq!(bat.get_block_sector(0), Some(0x1000));
        assert_eq!(bat.get_block_sector(1), None);
        assert_eq!(bat.get_block_sector(2), Some(0x2000));
    }

    #[test]
    fn test_parent_locator_entry_parse() {
        let mut bytes = [0u8; 24];
        bytes[0..4].copy_from_slice(b"W2ku");
        bytes[4..8].copy_from_slice(&512u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&100u32.to_be_bytes());
        bytes[16..24].copy_from_slice(&0x1000u64.to_be_bytes());

        let entry = ParentLocatorEntry::parse(&bytes).unwrap();
        assert!(entry.is_windows_unicode());
        assert!(entry.is_valid());
        assert_eq!(entry.platform_data_length, 100);
        assert_eq!(entry.platform_data_offset, 0x1000);
    }

    #[test]
    fn test_parent_locator_entry_invalid() {
        let bytes = [0u8; 24];
        let entry = ParentLocatorEntry::parse(&bytes).unwrap();
        assert!(!entry.is_valid());
    }

    #[test]
    fn footer_checksum_round_trips() {
        let mut footer = VhdFooter {
            cookie: *VhdFooter::COOKIE,
            features: 2,
            version: 0x0001_0000,
            data_offset: 512,
            timestamp: 0,
            creator_app: *b"tap\0",
            creator_version: 1,
            creator_os: 0,
            original_size: 10 * 1024 * 1024,
            current_size: 10 * 1024 * 1024,
            geometry: DiskGeometry {
                cylinders: 20,
                heads: 16,
                sectors: 63,
            },
            disk_type: VhdType::Dynamic,
            checksum: 0,
            uuid: [7u8; 16],
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.checksum = footer.checksum_over();
        assert!(footer.verify_checksum());
    }

    #[test]
    fn footer_checksum_legacy_hidden_byte_recovery() {
        let mut footer = VhdFooter {
            cookie: *VhdFooter::COOKIE,
            features: 2,
            version: 0x0001_0000,
            data_offset: 512,
            timestamp: 0,
            creator_app: *b"tap\0",
            creator_version: 0x0000_0001,
            creator_os: 0,
            original_size: 10 * 1024 * 1024,
            current_size: 10 * 1024 * 1024,
            geometry: DiskGeometry {
                cylinders: 20,
                heads: 16,
                sectors: 63,
            },
            disk_type: VhdType::Dynamic,
            checksum: 0,
            uuid: [7u8; 16],
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.checksum = footer.checksum_over();
        // Mark hidden after the checksum was taken, as early td-util did.
        footer.set_hidden(1);
        assert!(footer.verify_checksum());
    }
}

//! Walks a VHD differencing chain and folds each allocated sector's
//! `(file_id, offset)` into the on-disk index.
//!
//! Only read-only ancestors are indexed: the child VHD passed to [`build`]
//! is used solely to locate the chain it belongs to and is never itself
//! recorded in the index (it may still be written to).

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use vhdindex_core::{Error, Result};
use vhdindex_store::{BatFile, FileTable, IndexEntry, IndexFile};
use vhdindex_vhd::{VhdReader, VhdType};

/// Path of the per-VHD `.bat` file that accompanies `vhd_path`.
pub fn bat_path_for(vhd_path: &Path) -> PathBuf {
    vhd_path.with_extension("bat")
}

/// The `(.index, .files)` pair that accompanies `index_base`.
pub fn index_paths(index_base: &Path) -> (PathBuf, PathBuf) {
    (index_base.with_extension("index"), index_base.with_extension("files"))
}

/// Ancestors of `child`, nearest first, ending at the chain's root. `child`
/// itself is never included.
fn resolve_ancestor_chain(child: &Path) -> Result<Vec<PathBuf>> {
    let mut chain = Vec::new();
    let mut reader = VhdReader::open(child)?;

    while reader.footer().disk_type.is_differencing() {
        let parent = reader.parent_path()?;
        chain.push(parent.clone());
        reader = VhdReader::open(&parent)?;
    }

    Ok(chain)
}

/// Build or update the index for `child_vhd`'s ancestor chain under
/// `index_base` (`<index_base>.index` / `.files`), choosing the cheapest
/// applicable strategy: `update_bat` when the nearest ancestor already has
/// a `.bat`, `clone_bat` when its own parent does, `add` (a fresh walk)
/// otherwise.
pub fn build(index_base: &Path, child_vhd: &Path) -> Result<()> {
    let chain = resolve_ancestor_chain(child_vhd)?;

    let Some(nearest) = chain.first() else {
        info!(child = %child_vhd.display(), "no read-only ancestors to index");
        return Ok(());
    };

    let nearest_bat = bat_path_for(nearest);
    if nearest_bat.exists() {
        return update_bat(index_base, &chain);
    }

    if chain.len() > 1 && bat_path_for(&chain[1]).exists() {
        return clone_bat(index_base, &chain);
    }

    add(index_base, &chain)
}

struct ChainRoot {
    block_size: u32,
    vhd_blocks: u64,
}

fn chain_root_geometry(nearest: &Path) -> Result<ChainRoot> {
    let reader = VhdReader::open(nearest)?;
    let header = reader.dynamic_header().ok_or_else(|| {
        Error::invalid_argument(format!(
            "{}: chain root must be a dynamic or differencing VHD",
            nearest.display()
        ))
    })?;
    let vhd_blocks = reader.footer().current_size.div_ceil(header.block_size as u64);
    Ok(ChainRoot { block_size: header.block_size, vhd_blocks })
}

fn open_or_create_index(index_base: &Path, block_size: u32) -> Result<(IndexFile, FileTable)> {
    let (index_path, files_path) = index_paths(index_base);

    let index_file = if index_path.exists() {
        IndexFile::open(&index_path)?
    } else {
        IndexFile::create(&index_path, block_size)?
    };

    let file_table = if files_path.exists() {
        FileTable::open(&files_path)?
    } else {
        FileTable::create(&files_path)?
    };

    Ok((index_file, file_table))
}

/// Fresh build: walk the whole chain nearest-to-root, folding each VHD's
/// allocation-bitmap-owned sectors into the index unless a strict child
/// already claimed them.
fn add(index_base: &Path, chain: &[PathBuf]) -> Result<()> {
    let nearest = &chain[0];
    let root = chain_root_geometry(nearest)?;

    let (mut index_file, mut file_table) = open_or_create_index(index_base, root.block_size)?;

    let mut bat = vec![0u32; root.vhd_blocks as usize];
    let mut finished = vec![false; root.vhd_blocks as usize];

    walk_chain(
        chain,
        root.vhd_blocks,
        root.block_size,
        &mut index_file,
        &mut file_table,
        &mut bat,
        &mut finished,
    )?;

    let (index_path, files_path) = index_paths(index_base);
    let bat_path = bat_path_for(nearest);
    let mut bat_file = BatFile::create(
        &bat_path,
        root.vhd_blocks,
        root.block_size,
        nearest,
        &index_path,
        &files_path,
    )?;
    for (b, &sector) in bat.iter().enumerate() {
        if sector != 0 {
            bat_file.set(b as u64, sector)?;
        }
    }

    debug!(bat = %bat_path.display(), "wrote fresh .bat");
    Ok(())
}

/// Treat the nearest ancestor's existing `.bat` as authoritative and fold
/// in only divergent entries from a re-walk of the chain.
fn update_bat(index_base: &Path, chain: &[PathBuf]) -> Result<()> {
    let nearest = &chain[0];
    let bat_path = bat_path_for(nearest);
    let mut bat_file = BatFile::load(&bat_path)?;
    let vhd_blocks = bat_file.vhd_blocks();
    let mut bat = bat_file.load_entries()?;

    let (index_path, files_path) = index_paths(index_base);
    let mut index_file = IndexFile::open(&index_path)?;
    let block_size = index_file.block_size();
    let mut file_table = FileTable::open(&files_path)?;

    let mut finished = vec![false; vhd_blocks as usize];

    walk_chain(
        chain,
        vhd_blocks,
        block_size,
        &mut index_file,
        &mut file_table,
        &mut bat,
        &mut finished,
    )?;

    for (b, &sector) in bat.iter().enumerate() {
        if bat_file.get(b as u64)? != sector {
            bat_file.set(b as u64, sector)?;
        }
    }

    debug!(bat = %bat_path.display(), "updated .bat in place");
    Ok(())
}

/// Seed `B` from the parent's already-built `.bat` and fold in only the
/// nearest ancestor's own delta: a single-level walk, since the parent's
/// `.bat` already reflects everything below it.
fn clone_bat(index_base: &Path, chain: &[PathBuf]) -> Result<()> {
    let nearest = &chain[0];
    let parent = &chain[1];
    let parent_bat_path = bat_path_for(parent);
    let mut parent_bat = BatFile::load(&parent_bat_path)?;
    let vhd_blocks = parent_bat.vhd_blocks();
    let mut bat = parent_bat.load_entries()?;

    let (index_path, files_path) = index_paths(index_base);
    let mut index_file = IndexFile::open(&index_path)?;
    let mut file_table = FileTable::open(&files_path)?;
    let block_size = index_file.block_size();
    let spb = block_size / 512;

    let mut nearest_reader = VhdReader::open(nearest)?;
    let file_id = file_table.ensure(nearest)?;
    let block_count = nearest_reader
        .bat()
        .ok_or_else(|| Error::invalid_argument("clone_bat requires a dynamic nearest ancestor"))?
        .entries
        .len()
        .min(vhd_blocks as usize);

    for b in 0..block_count {
        if nearest_reader.block_byte_offset(b).is_none() {
            continue;
        }

        let bitmap = nearest_reader.read_bitmap(b)?;
        let mut ib = if bat[b] != 0 {
            index_file.read_block(bat[b])?
        } else {
            vec![IndexEntry::EMPTY; spb as usize]
        };

        let base_sector = nearest_reader.block_byte_offset(b).unwrap() / 512;
        let bm_secs = nearest_reader.dynamic_header().unwrap().bm_secs() as u64;

        let mut touched = false;
        for i in 0..spb as usize {
            if !nearest_reader.bitmap_test(&bitmap, i) {
                continue;
            }
            ib[i] = IndexEntry {
                file_id,
                offset: (base_sector + bm_secs + i as u64) as u32,
            };
            touched = true;
        }

        if touched {
            if bat[b] == 0 {
                bat[b] = index_file.append_block(&ib)?;
            } else {
                index_file.write_block(&ib, bat[b])?;
            }
        }
    }

    let bat_path = bat_path_for(nearest);
    let mut bat_file = BatFile::create(
        &bat_path,
        vhd_blocks,
        block_size,
        nearest,
        &index_path,
        &files_path,
    )?;
    for (b, &sector) in bat.iter().enumerate() {
        if sector != 0 {
            bat_file.set(b as u64, sector)?;
        }
    }

    debug!(bat = %bat_path.display(), parent = %parent.display(), "cloned .bat from parent");
    Ok(())
}

/// The core chain walk shared by `add` and `update_bat`: nearest ancestor
/// to root, filling `bat`/`finished` in place.
fn walk_chain(
    chain: &[PathBuf],
    vhd_blocks: u64,
    block_size: u32,
    index_file: &mut IndexFile,
    file_table: &mut FileTable,
    bat: &mut [u32],
    finished: &mut [bool],
) -> Result<()> {
    let spb = (block_size / 512) as usize;

    for w_path in chain {
        let mut w = VhdReader::open(w_path)?;
        let is_fixed = w.footer().disk_type == VhdType::Fixed;

        if !is_fixed && w.dynamic_header().is_none() {
            return Err(Error::invalid_argument(format!(
                "{}: expected a dynamic or differencing VHD",
                w_path.display()
            )));
        }

        let block_count = if is_fixed {
            vhd_blocks as usize
        } else {
            w.bat().unwrap().entries.len().min(vhd_blocks as usize)
        };

        let file_id = file_table.ensure(w_path)?;
        let bm_secs = w.dynamic_header().map(|h| h.bm_secs() as u64).unwrap_or(0);

        for b in 0..block_count {
            if finished[b] {
                continue;
            }

            if !is_fixed && w.block_byte_offset(b).is_none() {
                continue;
            }

            let bitmap = if is_fixed { None } else { Some(w.read_bitmap(b)?) };

            let mut ib = if bat[b] != 0 {
                index_file.read_block(bat[b])?
            } else {
                vec![IndexEntry::EMPTY; spb]
            };

            let mut count = 0usize;
            let mut touched = false;

            for i in 0..spb {
                if !ib[i].is_empty() {
                    count += 1;
                    continue;
                }

                let owned = match &bitmap {
                    Some(bm) => w.bitmap_test(bm, i),
                    None => true,
                };
                if !owned {
                    continue;
                }

                let absolute_sector = if is_fixed {
                    b as u64 * spb as u64 + i as u64
                } else {
                    w.block_byte_offset(b).unwrap() / 512 + bm_secs + i as u64
                };

                ib[i] = IndexEntry { file_id, offset: absolute_sector as u32 };
                count += 1;
                touched = true;
            }

            if touched {
                if bat[b] == 0 {
                    bat[b] = index_file.append_block(&ib)?;
                } else {
                    index_file.write_block(&ib, bat[b])?;
                }
            }

            if count == spb {
                finished[b] = true;
            }
        }

        if finished.iter().all(|&f| f) {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;
    use vhdindex_vhd::{DiskGeometry, VhdDynamicHeader, VhdFooter};

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

    fn header_checksum(header: &VhdDynamicHeader) -> u32 {
        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut bytes);
        bytes[36..40].fill(0);
        let mut sum: u32 = 0;
        for &b in bytes.iter() {
            sum = sum.wrapping_add(b as u32);
        }
        !sum
    }

    fn build_leaf_dynamic_vhd(virtual_size: u64, block_size: u32, allocated: &[usize]) -> Vec<u8> {
        let block_count = (virtual_size / block_size as u64) as u32;
        let mut footer = VhdFooter {
            cookie: *VhdFooter::COOKIE,
            features: 2,
            version: 0x0001_0000,
            data_offset: VhdFooter::SIZE as u64,
            timestamp: 0,
            creator_app: *b"test",
            creator_version: 0x0001_0000,
            creator_os: 0x5769326B,
            original_size: virtual_size,
            current_size: virtual_size,
            geometry: DiskGeometry { cylinders: 1024, heads: 16, sectors: 63 },
            disk_type: VhdType::Dynamic,
            checksum: 0,
            uuid: [9u8; 16],
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.checksum = footer_checksum(&footer);
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);

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
        header.checksum = header_checksum(&header);
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut header_bytes);

        let bm_secs = vhdindex_format::bitmap_sectors(vhdindex_format::sectors_per_block(block_size));

        let mut vhd = Vec::new();
        vhd.extend_from_slice(&footer_bytes);
        vhd.extend_from_slice(&header_bytes);

        let mut bat_entries = vec![0xFFFF_FFFFu32; block_count as usize];
        let mut next_sector = ((vhd.len() + block_count as usize * 4 + 511) / 512) as u32;
        for &block_idx in allocated {
            bat_entries[block_idx] = next_sector;
            next_sector += bm_secs + block_size / 512;
        }
        for &entry in &bat_entries {
            vhd.extend_from_slice(&entry.to_be_bytes());
        }
        while vhd.len() % 512 != 0 {
            vhd.push(0);
        }

        for &block_idx in allocated {
            vhd.extend_from_slice(&vec![0xFFu8; (bm_secs * 512) as usize]);
            for i in 0..block_size {
                let virtual_offset = block_idx as u64 * block_size as u64 + i as u64;
                vhd.push((virtual_offset % 256) as u8);
            }
            while vhd.len() % 512 != 0 {
                vhd.push(0);
            }
        }

        vhd.extend_from_slice(&footer_bytes);
        vhd
    }

    #[test]
    fn fresh_build_indexes_single_ancestor() {
        let dir = TempDir::new().unwrap();
        let parent_path = dir.path().join("parent.vhd");
        let mut parent_file = fs::File::create(&parent_path).unwrap();
        parent_file
            .write_all(&build_leaf_dynamic_vhd(16384, 4096, &[0, 2]))
            .unwrap();
        drop(parent_file);

        // The "child" is just used to locate the chain; since it has no
        // parent locator here, treat `parent_path` itself as the chain
        // entry point by resolving its own ancestor chain directly.
        let chain = vec![parent_path.clone()];
        let index_base = dir.path().join("chain");

        add(&index_base, &chain).unwrap();

        let bat_path = bat_path_for(&parent_path);
        assert!(bat_path.exists());
        let mut bat_file = BatFile::load(&bat_path).unwrap();
        let entries = bat_file.load_entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert_ne!(entries[0], 0);
        assert_eq!(entries[1], 0);
        assert_ne!(entries[2], 0);
        assert_eq!(entries[3], 0);
    }

    #[test]
    fn build_returns_ok_with_no_ancestors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("root.vhd");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&build_leaf_dynamic_vhd(16384, 4096, &[0])).unwrap();
        drop(file);

        let index_base = dir.path().join("chain");
        // `root.vhd` has disk_type Dynamic (not Differencing), so it has
        // no parent locator to walk: the chain is empty.
        build(&index_base, &path).unwrap();
    }
}

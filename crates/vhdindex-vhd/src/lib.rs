//! VHD footer/header/BAT parsing and sector-level reads.
//!
//! This crate knows how to open and validate a single VHD file and serve
//! sector, bitmap, and parent-locator reads from it. Walking a whole VHD
//! chain and building the sector index lives one layer up, in
//! `vhdindex-builder`.

pub mod vhd;

pub use vhd::{
    BlockAllocationTable, DiskGeometry, ParentLocatorEntry, VhdDynamicHeader, VhdFooter, VhdReader,
    VhdType,
};

//! The on-disk index store: `.index` (appended sector-aligned entry
//! blocks), `.files` (the file table), and `.bat` (per-child block
//! pointers into `.index`).

pub mod bat_file;
pub mod file_table;
pub mod index_file;

pub use bat_file::BatFile;
pub use file_table::{FileTable, FileTableEntry};
pub use index_file::{IndexEntry, IndexFile};

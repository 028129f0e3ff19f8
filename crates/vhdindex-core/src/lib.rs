//! Shared error taxonomy, stream traits, and VHD-epoch/sector constants used
//! by every `vhdindex-*` crate.

pub mod error;
pub mod security;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use security::*;
pub use traits::{ReadSeek, ReadWriteSeek};
pub use types::{
    bytes_padded, sectors_round_up, unix_to_vhd_time, vhd_epoch_start, vhd_time_to_unix, SECTOR_SIZE,
    UNUSED,
};

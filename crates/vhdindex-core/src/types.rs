//! Shared constants and the VHD epoch conversion.

use chrono::{DateTime, TimeZone, Utc};

/// Size in bytes of one sector, the fixed unit of addressing throughout the index.
pub const SECTOR_SIZE: u64 = 512;

/// Sentinel value meaning "no sector here" in a BAT entry or index entry offset.
pub const UNUSED: u32 = 0xFFFF_FFFF;

/// VHD timestamps are seconds since 2000-01-01 00:00:00 UTC, not the Unix epoch.
pub fn vhd_epoch_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

/// Convert a Unix timestamp (seconds) to the VHD's 2000-01-01 epoch.
pub fn unix_to_vhd_time(unix_secs: i64) -> u32 {
    let delta = unix_secs - vhd_epoch_start().timestamp();
    delta.max(0) as u32
}

/// Convert a VHD epoch timestamp back to a Unix timestamp (seconds).
pub fn vhd_time_to_unix(vhd_secs: u32) -> i64 {
    vhd_epoch_start().timestamp() + vhd_secs as i64
}

/// Round a byte length up to the next sector boundary.
pub fn sectors_round_up(bytes: u64) -> u64 {
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Pad a byte length up to the next sector boundary.
pub fn bytes_padded(bytes: u64) -> u64 {
    sectors_round_up(bytes) * SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vhd_epoch_round_trips() {
        let unix_now = 1_700_000_000i64;
        let vhd = unix_to_vhd_time(unix_now);
        assert_eq!(vhd_time_to_unix(vhd), unix_now);
    }

    #[test]
    fn padding_rounds_up_to_sector() {
        assert_eq!(bytes_padded(0), 0);
        assert_eq!(bytes_padded(1), 512);
        assert_eq!(bytes_padded(512), 512);
        assert_eq!(bytes_padded(513), 1024);
    }
}

//! Big-endian integer transforms. Every persisted integer in `.index`,
//! `.files`, `.bat`, and the VHD structures this workspace reads is
//! big-endian; these are the total-function primitives the rest of the
//! codec builds on. In and out are exact inverses of each other by
//! construction — there is no shared "out-only" helper doing double duty
//! for both directions.

use vhdindex_core::{Error, Result};

pub fn read_u16(buf: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = buf
        .get(..2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::short_io(2, buf.len()))?;
    Ok(u16::from_be_bytes(bytes))
}

pub fn read_u32(buf: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = buf
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::short_io(4, buf.len()))?;
    Ok(u32::from_be_bytes(bytes))
}

pub fn read_u64(buf: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = buf
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::short_io(8, buf.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 0x1234);
        write_u32(&mut buf, 0xDEAD_BEEF);
        write_u64(&mut buf, 0x0102_0304_0506_0708);

        assert_eq!(read_u16(&buf[0..]).unwrap(), 0x1234);
        assert_eq!(read_u32(&buf[2..]).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(&buf[6..]).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn short_buffer_is_short_io() {
        assert!(read_u32(&[0u8; 2]).is_err());
    }
}

//! Shared stream abstractions.

use std::io::{Read, Seek, Write};

/// Combined trait for Read + Seek, implemented by anything backing a VHD or
/// index file: a plain `File`, a `Cursor<Vec<u8>>` in tests, etc.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Combined trait for Read + Write + Seek, used by the index store when
/// appending or overwriting blocks.
pub trait ReadWriteSeek: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ReadWriteSeek for T {}

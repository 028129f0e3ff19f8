//! Fixed-capacity path fields and relative-path encoding.
//!
//! Every path stored on disk (in `.files` and `.bat`) is relative to the
//! directory of the file that references it, computed from the longest
//! common ancestor of the two canonicalized absolute paths.

use std::path::{Component, Path, PathBuf};
use vhdindex_core::security::{validate_file_path, validate_path_field_len, MAX_PATH_BYTES};
use vhdindex_core::{Error, Result};

/// Encode `path` (already relative or absolute, as stored verbatim) as the
/// on-disk `{bytes: u16, chars[1024]}` field: `bytes` counts the encoded
/// string plus its terminating NUL.
pub fn encode_path_field(path: &str) -> Result<Vec<u8>> {
    let mut chars = path.as_bytes().to_vec();
    chars.push(0);

    validate_path_field_len(chars.len())?;

    let mut out = Vec::with_capacity(2 + MAX_PATH_BYTES);
    crate::be::write_u16(&mut out, chars.len() as u16);
    out.extend_from_slice(&chars);
    out.resize(2 + MAX_PATH_BYTES, 0);
    Ok(out)
}

/// Decode a `{bytes: u16, chars[1024]}` field back to a path string. Fails
/// if the declared length reaches the field capacity, or if no NUL
/// terminator is found within the declared length.
pub fn decode_path_field(buf: &[u8]) -> Result<String> {
    if buf.len() < 2 + MAX_PATH_BYTES {
        return Err(Error::short_io(2 + MAX_PATH_BYTES, buf.len()));
    }

    let declared_len = crate::be::read_u16(buf)? as usize;
    validate_path_field_len(declared_len)?;

    let chars = &buf[2..2 + declared_len];
    let nul_pos = chars
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::invalid_argument("path field has no NUL terminator within declared length"))?;

    String::from_utf8(chars[..nul_pos].to_vec())
        .map_err(|e| Error::encoding(format!("path field is not valid UTF-8: {e}")))
}

/// Compute the path from `from_dir` (a directory) to `to` (a file),
/// expressed relative to `from_dir`, using the longest common ancestor of
/// their canonicalized absolute forms. Emits one `../` per component of
/// `from_dir` below the common ancestor, or a bare `./` prefix when
/// `from_dir` *is* the common ancestor.
pub fn relative_path_to(from_dir: &Path, to: &Path) -> Result<String> {
    let from_abs = validate_file_path_dir(from_dir)?;
    let to_abs = validate_file_path(to.to_string_lossy().as_ref())?;

    let from_components: Vec<Component> = from_abs.components().collect();
    let to_components: Vec<Component> = to_abs.components().collect();

    let common = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let ups = from_components.len() - common;

    let mut rel = PathBuf::new();
    if ups == 0 {
        rel.push(".");
    } else {
        for _ in 0..ups {
            rel.push("..");
        }
    }
    for comp in &to_components[common..] {
        rel.push(comp.as_os_str());
    }

    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Resolve a stored relative path string against the directory of the
/// referencing file, returning a canonicalized absolute path.
pub fn resolve_relative(referencing_dir: &Path, relative: &str) -> Result<PathBuf> {
    let joined = referencing_dir.join(relative);
    joined
        .canonicalize()
        .map_err(|e| Error::no_such_entity(format!("{}: {e}", joined.display())))
}

fn validate_file_path_dir(dir: &Path) -> Result<PathBuf> {
    dir.canonicalize()
        .map_err(|e| Error::no_such_entity(format!("{}: {e}", dir.display())))
}

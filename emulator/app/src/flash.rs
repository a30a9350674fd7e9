/*++

Licensed under the Apache-2.0 license.

File Name:

    flash.rs

Abstract:

    Image loading helpers.

--*/

use std::io;
use std::path::{Path, PathBuf};

/// Reads a binary image, reporting its size.
pub fn load_file(path: &Path) -> io::Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("loading {} failed: {}", path.display(), err),
        )
    })?;
    log::info!("loaded {} ({} bytes)", path.display(), data.len());
    Ok(data)
}

/// Reads an optional image; absent paths yield an empty buffer.
pub fn load_optional(path: Option<&PathBuf>) -> io::Result<Vec<u8>> {
    match path {
        Some(path) => load_file(path),
        None => Ok(Vec::new()),
    }
}

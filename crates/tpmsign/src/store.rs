// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handle files: one saved context per file, stored as raw bytes

use log::debug;
use std::fs;
use std::path::Path;

use crate::context::ContextBlob;
use crate::error::{Error, Result};

/// Write a context to `path`, replacing any previous contents
pub fn save_context(path: &Path, context: &ContextBlob) -> Result<()> {
    fs::write(path, context.as_bytes()).map_err(|source| Error::Persist {
        op: "write",
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Wrote {} byte context to {}", context.len(), path.display());
    Ok(())
}

/// Read a context previously written by [`save_context`]
pub fn load_context(path: &Path) -> Result<ContextBlob> {
    let bytes = fs::read(path).map_err(|source| Error::Persist {
        op: "read",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ContextBlob::from_bytes(bytes))
}

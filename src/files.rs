// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Simple file operations for front-ends.

use std::fs;
use std::io;
use std::path::Path;

pub fn exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_file()
}

/// Delete a downloaded file. Returns `false` if there was nothing to delete.
pub fn delete(path: impl AsRef<Path>) -> io::Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => {
            tracing::debug!(path = %path.as_ref().display(), "deleted file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

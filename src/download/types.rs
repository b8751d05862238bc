// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the bridge and its callers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque handle the platform assigns to a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// One progress notification for a download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes written by this event.
    pub bytes_written: u64,
    /// Bytes written so far.
    pub total_bytes_written: u64,
    /// Expected size, when the server announced one.
    pub total_bytes_expected: Option<u64>,
}

impl TransferProgress {
    /// Get progress percentage (0-100) if the total is known.
    pub fn percent(&self) -> Option<f64> {
        self.total_bytes_expected.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.total_bytes_written as f64 / total as f64) * 100.0
            }
        })
    }

    /// Human readable "written of expected" string.
    pub fn summary(&self) -> String {
        match self.total_bytes_expected {
            Some(total) => format!(
                "{} of {}",
                format_bytes(self.total_bytes_written),
                format_bytes(total)
            ),
            None => format_bytes(self.total_bytes_written),
        }
    }
}

/// Progress callback. Invoked in order, never concurrently for the same
/// download and never after the download has resolved.
pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Format a byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

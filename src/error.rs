// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download errors and user-facing error formatting.

use std::fmt;
use std::io;

use thiserror::Error;

pub use crate::platform::TransferError;

/// Terminal failure of a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request could not be turned into a platform task. Raised
    /// before anything is registered.
    #[error("invalid download request: {0}")]
    RequestConstruction(String),

    /// The platform reported a network or I/O failure.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// The caller's cancellation signal fired first.
    #[error("download was canceled")]
    Canceled,

    /// The transfer finished without ever delivering a file.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Claiming the downloaded file failed.
    #[error("failed to claim downloaded file: {0}")]
    Io(#[from] io::Error),

    /// The background session could not be created.
    #[error("background session unavailable: {0}")]
    Session(String),
}

impl DownloadError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, DownloadError::Canceled)
    }

    /// Formatted explanation with likely causes and fixes, for the CLI.
    pub fn explain(&self) -> ErrorBuilder {
        match self {
            DownloadError::RequestConstruction(detail) => ErrorBuilder::new("Could not start download")
                .cause(detail.clone())
                .fix("Check that the URL starts with http:// or https://")
                .fix("Check header syntax: -H 'Name: value'"),
            DownloadError::Transfer(err) => ErrorBuilder::new("Download failed")
                .cause(err.to_string())
                .fix("Check your network connection")
                .fix("Retry the download"),
            DownloadError::Canceled => ErrorBuilder::new("Download canceled"),
            DownloadError::Protocol(detail) => ErrorBuilder::new("Server closed the transfer without data")
                .cause(detail.clone())
                .fix("Retry the download"),
            DownloadError::Io(err) => ErrorBuilder::new("Could not save downloaded file")
                .cause(err.to_string())
                .fix("Check that the destination directory exists and is writable")
                .fix("Check free disk space"),
            DownloadError::Session(detail) => ErrorBuilder::new("Background session unavailable")
                .cause(detail.clone())
                .fix("Check the staging_dir setting: bgfetch config show"),
        }
    }
}

/// Builder for "[✗] title / causes / fixes" error messages.
///
/// ```
/// use bgfetch::error::ErrorBuilder;
///
/// let msg = ErrorBuilder::new("Download failed")
///     .cause("Connection reset")
///     .fix("Retry the download")
///     .build();
/// assert!(msg.contains("Connection reset"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let mut output = format!("[✗] {}\n", self.title);

        if !self.causes.is_empty() {
            output.push_str("\nPossible causes:\n");
            for cause in &self.causes {
                output.push_str(&format!("  - {}\n", cause));
            }
        }

        if !self.fixes.is_empty() {
            output.push_str("\nTry these fixes:\n");
            for (i, fix) in self.fixes.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, fix));
            }
        }

        output
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! bgfetch - awaitable downloads over background transfer sessions
//!
//! Background transfer subsystems run downloads outside the caller's
//! control and report back through callbacks, possibly after the process
//! was relaunched. bgfetch bridges those callbacks into ordinary futures
//! with progress, cancellation, redirect and cookie propagation.
//!
//! # Core Modules
//!
//! - [`platform`] - Background session traits and the reqwest-backed session
//! - [`download`] - In-flight registry, completion bridge, response types
//! - [`session`] - Process-wide session handle
//! - [`relaunch`] - Wake-up entry point and completion notification
//! - [`config`] - Settings in `~/.bgfetch/config.json`
//! - [`error`] - Download errors and CLI error formatting

pub mod config;
pub mod download;
pub mod error;
pub mod files;
pub mod locks;
pub mod logging;
pub mod platform;
pub mod relaunch;
pub mod session;

pub use config::{load_config, save_config, Config};
pub use download::{
    DownloadContent, DownloadHandle, DownloadOptions, DownloadRequest, DownloadResponse, TaskId,
    TransferProgress,
};
pub use error::{DownloadError, TransferError};
pub use relaunch::{LogNotifier, Notification, Notifier, RelaunchHandler};
pub use session::{ensure_initialized, shared, BackgroundDownloader};

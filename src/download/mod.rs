// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download bridge for background transfer sessions.
//!
//! Background sessions report through callbacks that can arrive on any
//! thread, after the caller lost interest, or after the process was
//! relaunched. This module turns them into ordinary awaitable downloads:
//! - In-flight registry correlating platform task handles to requests
//! - Exactly-once resolution (success, cancellation or failure)
//! - Progress reporting via callback and `watch` channel
//! - Claiming the downloaded file before the platform deletes it
//! - Redirect and cookie propagation onto the response
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │ CompletionBridge │────▶│ InFlightRegistry │
//! │ (SessionDelegate)│     │ TaskId → record  │
//! └────────┬─────────┘     └────────┬─────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌──────────────────┐     ┌──────────────────┐
//! │ TransferSession  │     │ PendingDownload  │
//! │ (platform)       │     │ (result slot)    │
//! └──────────────────┘     └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use bgfetch::download::{DownloadOptions, DownloadRequest};
//! use bgfetch::session::BackgroundDownloader;
//!
//! # async fn example(downloader: BackgroundDownloader) -> anyhow::Result<()> {
//! let request = DownloadRequest::get("https://example.com/archive.zip")?;
//! let options = DownloadOptions::new()
//!     .destination("/tmp/archive.zip")
//!     .on_progress(|p| println!("{}", p.summary()));
//!
//! let response = downloader.download(request, options).await?;
//! println!("saved to {}", response.content());
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod content;
pub mod cookies;
pub mod request;
pub mod response;
pub mod types;

mod record;
mod registry;

pub use bridge::{BridgeOptions, CompletionBridge, DownloadHandle, DownloadOptions};
pub use content::{ContentReader, DownloadContent};
pub use cookies::{Cookie, CookieJar};
pub use request::DownloadRequest;
pub use response::DownloadResponse;
pub use types::{format_bytes, ProgressCallback, TaskId, TransferProgress};

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background transfer subsystem abstraction.
//!
//! A background transfer session is owned by the host, not by us: it
//! creates tasks, runs them on its own threads (or in another process)
//! and reports back through a [`SessionDelegate`]. Everything the
//! completion bridge needs from such a subsystem is captured by the
//! traits here, so the bridge itself never depends on a concrete
//! platform.
//!
//! ```text
//! ┌──────────────────┐ create/resume/cancel ┌──────────────────┐
//! │ CompletionBridge │─────────────────────▶│ TransferSession  │
//! │ (SessionDelegate)│◀─────────────────────│  + TransferTask  │
//! └──────────────────┘  progress/file/done  └──────────────────┘
//! ```
//!
//! [`http::HttpTransferSession`] is the portable implementation backed by
//! reqwest and tokio.

pub mod http;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use thiserror::Error;

use crate::download::cookies::Cookie;
use crate::download::types::TaskId;

pub use http::HttpTransferSession;

/// Lifecycle state of a platform task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not started; `resume` starts it.
    Suspended,
    /// Transferring data.
    Running,
    /// Cancel requested, terminal callback pending.
    Canceling,
    /// Terminal callback delivered.
    Completed,
}

/// Failure reported by the platform through the terminal callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Connection, TLS or protocol failure.
    #[error("network error: {0}")]
    Network(String),
    /// Local I/O failure while writing the staging file.
    #[error("i/o error: {0}")]
    Io(String),
    /// The task was cancelled before its data completed.
    #[error("transfer cancelled")]
    Cancelled,
    /// The request could not be turned into a task.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Request as handed to the platform.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub follow_redirects: bool,
}

/// What the platform knows about the server's response.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    /// Final URL the response came from.
    pub url: Option<Url>,
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub suggested_filename: Option<String>,
    pub mime_type: Option<String>,
    pub expected_content_length: Option<u64>,
}

/// Configuration for a background-capable session.
#[derive(Debug, Clone)]
pub struct SessionConfiguration {
    /// Stable identifier the host uses to wake us for this session.
    pub identifier: String,
    /// Where raw downloads are written before the file-ready callback.
    pub staging_dir: PathBuf,
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
    /// Wake the process when transfers finish in the background.
    pub sends_launch_events: bool,
    /// Keep a native cookie store for this session.
    pub use_native_cookies: bool,
}

impl SessionConfiguration {
    /// Background configuration for `identifier` with default settings.
    pub fn background(identifier: impl Into<String>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            staging_dir: staging_dir.into(),
            user_agent: None,
            connect_timeout: Duration::from_secs(30),
            sends_launch_events: true,
            use_native_cookies: true,
        }
    }
}

/// Platform cookie storage, separate from the managed cookie jar.
pub trait NativeCookieStorage: Send + Sync {
    /// Cookies that apply to `url`.
    fn cookies_for_url(&self, url: &Url) -> Vec<Cookie>;
}

/// One transfer owned by the platform.
pub trait TransferTask: Send + Sync + fmt::Debug {
    /// Opaque handle, stable for the lifetime of the transfer.
    fn id(&self) -> TaskId;
    fn state(&self) -> TaskState;
    fn resume(&self);
    fn cancel(&self);
    /// URL of the request the task was created with.
    fn original_url(&self) -> Option<Url>;
    /// URL currently being fetched; differs from the original after a redirect.
    fn current_url(&self) -> Option<Url>;
    /// Response metadata, once headers have arrived.
    fn response(&self) -> Option<ResponseInfo>;
}

/// A background transfer session.
pub trait TransferSession: Send + Sync {
    fn identifier(&self) -> &str;

    /// Create a suspended download task.
    fn create_download_task(
        &self,
        request: TransferRequest,
    ) -> Result<Arc<dyn TransferTask>, TransferError>;

    /// Native cookie store, if the session keeps one.
    fn cookie_storage(&self) -> Option<Arc<dyn NativeCookieStorage>>;

    /// Attach the delegate that receives callbacks. Events raised while no
    /// delegate is attached are buffered until [`dispatch_buffered_events`].
    ///
    /// [`dispatch_buffered_events`]: TransferSession::dispatch_buffered_events
    fn attach(&self, delegate: Weak<dyn SessionDelegate>);

    /// Replay buffered events to the attached delegate, then signal
    /// [`SessionDelegate::did_finish_events`]. Returns the number replayed.
    fn dispatch_buffered_events(&self) -> usize;
}

/// Callbacks delivered by a [`TransferSession`].
///
/// Callbacks for one task arrive in order and never concurrently with
/// each other; callbacks for different tasks may run concurrently.
pub trait SessionDelegate: Send + Sync {
    fn did_write_data(
        &self,
        task: &dyn TransferTask,
        bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected: Option<u64>,
    );

    /// The data is complete and sits at `location`. The platform deletes
    /// `location` as soon as this returns.
    fn did_finish_downloading(&self, task: &dyn TransferTask, location: &Path);

    /// Terminal callback, exactly once per task.
    fn did_complete(&self, task: &dyn TransferTask, error: Option<TransferError>);

    /// A previously interrupted transfer picked up again at `file_offset`.
    fn did_resume(&self, _task: &dyn TransferTask, _file_offset: u64, _expected_total: Option<u64>) {}

    /// All buffered events for the session have been delivered.
    fn did_finish_events(&self, _session_identifier: &str) {}
}

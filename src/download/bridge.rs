// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completion bridge: turns session callbacks into awaitable downloads.
//!
//! ```text
//! start_download ──▶ create task ──▶ registry.insert ──▶ resume
//!                                          │
//!        did_write_data ───────lookup──────┤──▶ progress callback
//!        did_finish_downloading ─lookup────┤──▶ move file, build response
//!        did_complete ───────────remove────┤──▶ resolve Success/Failed
//!        cancellation signal ────remove────┘──▶ resolve Canceled
//! ```
//!
//! Every path that resolves a download first takes its record out of (or
//! finds it in) the registry, and the record's result slot accepts only
//! one outcome. Whichever path gets there first decides the result; the
//! others find nothing and return.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
use reqwest::StatusCode;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::content::DownloadContent;
use super::cookies::CookieJar;
use super::record::{DownloadResult, PendingDownload};
use super::registry::InFlightRegistry;
use super::request::DownloadRequest;
use super::response::DownloadResponse;
use super::types::{ProgressCallback, TaskId, TransferProgress};
use crate::error::DownloadError;
use crate::platform::{SessionDelegate, TaskState, TransferError, TransferSession, TransferTask};

/// Bridge-wide settings.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Send managed cookies with outgoing requests.
    pub use_cookies: bool,
    /// Directory for self-deleting content. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            use_cookies: true,
            temp_dir: None,
        }
    }
}

/// Per-download options.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    destination: Option<PathBuf>,
    progress: Option<ProgressCallback>,
    cancellation: Option<CancellationToken>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the finished file here. Without a destination the file goes to
    /// a private temporary path and is deleted with the content.
    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("destination", &self.destination)
            .field("progress", &self.progress.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

/// Handle to an in-flight download.
///
/// Dropping the handle does not cancel the transfer; use [`cancel`] or the
/// cancellation token passed in [`DownloadOptions`]. The token is observed
/// whether or not anyone is waiting on the handle.
///
/// [`cancel`]: DownloadHandle::cancel
pub struct DownloadHandle {
    task_id: TaskId,
    result_rx: oneshot::Receiver<DownloadResult>,
    progress_rx: watch::Receiver<TransferProgress>,
    cancellation: CancellationToken,
    bridge: Arc<CompletionBridge>,
}

impl DownloadHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Latest progress reported for this download.
    pub fn progress(&self) -> TransferProgress {
        *self.progress_rx.borrow()
    }

    /// Receiver that observes every progress update.
    pub fn progress_updates(&self) -> watch::Receiver<TransferProgress> {
        self.progress_rx.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Request cancellation. The outcome is `Canceled` unless the download
    /// already resolved.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Wait for the download to resolve. Also observes the token itself,
    /// for downloads started outside a tokio runtime.
    pub async fn wait(self) -> Result<DownloadResponse, DownloadError> {
        let DownloadHandle {
            task_id,
            mut result_rx,
            cancellation,
            bridge,
            ..
        } = self;

        tokio::select! {
            biased;
            outcome = &mut result_rx => return settle(outcome),
            _ = cancellation.cancelled() => {
                bridge.cancel_inflight(task_id);
            }
        }

        settle(result_rx.await)
    }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("task_id", &self.task_id)
            .field("progress", &*self.progress_rx.borrow())
            .finish()
    }
}

fn settle(outcome: Result<DownloadResult, oneshot::error::RecvError>) -> DownloadResult {
    outcome.unwrap_or_else(|_| {
        Err(DownloadError::Protocol(
            "download record dropped before it resolved".to_string(),
        ))
    })
}

/// Correlates session callbacks with caller requests.
pub struct CompletionBridge {
    session: Arc<dyn TransferSession>,
    registry: InFlightRegistry,
    cookies: Arc<CookieJar>,
    options: BridgeOptions,
}

impl CompletionBridge {
    pub fn new(session: Arc<dyn TransferSession>, cookies: Arc<CookieJar>, options: BridgeOptions) -> Self {
        Self {
            session,
            registry: InFlightRegistry::new(),
            cookies,
            options,
        }
    }

    pub fn session(&self) -> &Arc<dyn TransferSession> {
        &self.session
    }

    /// Managed cookie jar shared with the rest of the HTTP stack.
    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.cookies
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn in_flight_tasks(&self) -> Vec<TaskId> {
        self.registry.task_ids()
    }

    pub fn is_in_flight(&self, id: TaskId) -> bool {
        self.registry.contains(id)
    }

    /// Start a download and return a handle to await it.
    ///
    /// Request construction errors are returned here, before anything is
    /// registered. Everything else arrives through [`DownloadHandle::wait`].
    pub fn start_download(
        self: &Arc<Self>,
        request: DownloadRequest,
        options: DownloadOptions,
    ) -> Result<DownloadHandle, DownloadError> {
        let cookie_header = if self.options.use_cookies {
            self.cookies.cookie_header(&request.url)
        } else {
            None
        };
        let transfer = request.to_transfer_request(cookie_header)?;
        let task = self
            .session
            .create_download_task(transfer)
            .map_err(|e| DownloadError::RequestConstruction(e.to_string()))?;
        let task_id = task.id();

        let DownloadOptions {
            destination,
            progress,
            cancellation,
        } = options;

        debug!(task = %task_id, url = %request.url, destination = ?destination, "download task created");

        let cancellation = cancellation.unwrap_or_default();
        let (record, result_rx, progress_rx) = PendingDownload::new(
            Arc::clone(&task),
            request,
            destination,
            progress,
            cancellation.clone(),
        );
        let record = Arc::new(record);
        if let Some(stale) = self.registry.insert(task_id, Arc::clone(&record)) {
            warn!(task = %task_id, "platform reused a task handle; failing the stale download");
            stale.resolve(Err(DownloadError::Protocol(format!("task handle {} reused", task_id))));
        }

        if cancellation.is_cancelled() {
            debug!(task = %task_id, "cancellation already requested; not resuming");
            self.cancel_inflight(task_id);
        } else {
            self.watch_cancellation(task_id, &record);
            if task.state() == TaskState::Suspended {
                task.resume();
            }
        }

        Ok(DownloadHandle {
            task_id,
            result_rx,
            progress_rx,
            cancellation,
            bridge: Arc::clone(self),
        })
    }

    /// Start a download and wait for it.
    pub async fn download(
        self: &Arc<Self>,
        request: DownloadRequest,
        options: DownloadOptions,
    ) -> Result<DownloadResponse, DownloadError> {
        self.start_download(request, options)?.wait().await
    }

    /// Cancellation path. Returns `false` if the download was no longer
    /// registered.
    pub fn cancel_inflight(&self, id: TaskId) -> bool {
        let Some(record) = self.registry.remove(id) else {
            return false;
        };
        if record.resolve(Err(DownloadError::Canceled)) {
            record.discard_response();
        }
        record.task().cancel();
        debug!(task = %id, "download canceled");
        true
    }

    /// Run the cancellation path as soon as the caller's token fires, even
    /// if nobody is waiting on the handle.
    fn watch_cancellation(self: &Arc<Self>, id: TaskId, record: &PendingDownload) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(task = %id, "no tokio runtime; cancellation is observed by callbacks and wait()");
            return;
        };
        let bridge = Arc::downgrade(self);
        let token = record.cancellation().clone();
        let watcher = runtime.spawn(async move {
            token.cancelled().await;
            if let Some(bridge) = bridge.upgrade() {
                bridge.cancel_inflight(id);
            }
        });
        record.set_watcher(watcher.abort_handle());
    }

    /// Registered record for `id`, unless the caller cancelled it. A fired
    /// token the watcher has not acted on yet is handled here.
    fn tracked(&self, id: TaskId) -> Option<Arc<PendingDownload>> {
        let record = self.registry.lookup(id)?;
        if record.cancel_requested() {
            self.cancel_inflight(id);
            return None;
        }
        Some(record)
    }

    fn claim_download(
        &self,
        record: &PendingDownload,
        task: &dyn TransferTask,
        location: &Path,
    ) -> Result<(), DownloadError> {
        if record.is_resolved() {
            return Ok(());
        }

        let (destination, self_deleting) = match record.target_path() {
            Some(path) => (path.to_path_buf(), false),
            None => (self.allocate_temp_path()?, true),
        };

        let info = task.response().unwrap_or_default();
        // Built before the move so a failed move still cleans up the temp path.
        let content = DownloadContent::new(
            &destination,
            info.suggested_filename.clone(),
            info.mime_type.clone(),
            self_deleting,
        );
        move_into_place(location, &destination)?;
        debug!(task = %task.id(), path = %destination.display(), "claimed downloaded file");

        // Data is in hand; no further native callbacks are needed.
        if !record.is_completed() {
            task.cancel();
        }

        let mut request = record.request().clone();
        if let Some(current) = task.current_url() {
            if task.original_url().as_ref() != Some(&current) {
                debug!(task = %task.id(), from = %request.url, to = %current, "download was redirected");
                request.url = current;
            }
        }

        let mut headers = HeaderMap::new();
        for (name, value) in info.headers.iter() {
            if name != SET_COOKIE {
                headers.append(name.clone(), value.clone());
            }
        }

        let final_url = info.url.clone().or_else(|| task.current_url());
        if let (Some(storage), Some(url)) = (self.session.cookie_storage(), final_url) {
            let cookies = storage.cookies_for_url(&url);
            for cookie in &cookies {
                match HeaderValue::from_str(&cookie.to_set_cookie_string()) {
                    Ok(value) => {
                        headers.append(SET_COOKIE, value);
                    }
                    Err(_) => trace!(cookie = cookie.name(), "skipping cookie with unrepresentable header value"),
                }
            }
            self.cookies.merge(cookies);
        }

        let status = info.status.unwrap_or(StatusCode::OK);
        record.set_response(DownloadResponse::new(status, headers, content, request));
        if record.is_resolved() {
            // Cancellation won while the file was being claimed.
            record.discard_response();
            return Ok(());
        }

        if task.state() == TaskState::Suspended {
            task.resume();
        }
        Ok(())
    }

    fn allocate_temp_path(&self) -> io::Result<PathBuf> {
        let dir = self.options.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&dir)?;
        tempfile::Builder::new()
            .prefix("bgfetch-")
            .suffix(".download")
            .tempfile_in(&dir)?
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)
    }
}

impl fmt::Debug for CompletionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionBridge")
            .field("session", &self.session.identifier())
            .field("in_flight", &self.registry.len())
            .field("options", &self.options)
            .finish()
    }
}

impl SessionDelegate for CompletionBridge {
    fn did_write_data(
        &self,
        task: &dyn TransferTask,
        bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected: Option<u64>,
    ) {
        let Some(record) = self.tracked(task.id()) else {
            trace!(task = %task.id(), "progress for a download that is no longer tracked");
            return;
        };
        record.report_progress(TransferProgress {
            bytes_written,
            total_bytes_written,
            total_bytes_expected,
        });
    }

    fn did_finish_downloading(&self, task: &dyn TransferTask, location: &Path) {
        let id = task.id();
        let Some(record) = self.tracked(id) else {
            trace!(task = %id, "file ready for a download that is no longer tracked");
            return;
        };

        if let Err(err) = self.claim_download(&record, task, location) {
            warn!(task = %id, error = %err, "failed to claim downloaded file");
            record.resolve(Err(err));
            self.registry.remove(id);
        }
    }

    fn did_complete(&self, task: &dyn TransferTask, error: Option<TransferError>) {
        let id = task.id();
        let Some(record) = self.registry.remove(id) else {
            trace!(task = %id, "terminal callback for a download that is no longer tracked");
            return;
        };
        record.mark_completed();

        if record.cancel_requested() {
            if record.resolve(Err(DownloadError::Canceled)) {
                record.discard_response();
            }
            debug!(task = %id, "download canceled");
            return;
        }

        let outcome = match error {
            None => record.take_response().ok_or_else(|| {
                DownloadError::Protocol("transfer completed without delivering a file".to_string())
            }),
            // Our own cancel after the file was claimed is benign; any other
            // platform-side cancel is a transfer failure.
            Some(TransferError::Cancelled) => record
                .take_response()
                .ok_or(DownloadError::Transfer(TransferError::Cancelled)),
            Some(err) => Err(DownloadError::Transfer(err)),
        };

        if let Err(err) = &outcome {
            debug!(task = %id, error = %err, "download failed");
        }
        record.resolve(outcome);
    }

    fn did_resume(&self, task: &dyn TransferTask, file_offset: u64, expected_total: Option<u64>) {
        debug!(task = %task.id(), file_offset, expected_total = ?expected_total, "transfer resumed");
    }

    fn did_finish_events(&self, session_identifier: &str) {
        debug!(session = session_identifier, in_flight = self.registry.len(), "background events delivered");
    }
}

/// Move `source` to `destination`, replacing whatever is there.
///
/// A plain rename when both live on the same filesystem. Otherwise the data
/// is copied next to the destination and renamed over it, so the
/// destination only ever holds complete data and the source is removed
/// last.
pub(crate) fn move_into_place(source: &Path, destination: &Path) -> io::Result<()> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(rename_err) if source.exists() => {
            debug!(error = %rename_err, "rename failed; copying across filesystems");
            let staged = tempfile::Builder::new().prefix(".bgfetch-").tempfile_in(parent)?;
            fs::copy(source, staged.path())?;
            staged.persist(destination).map_err(|e| e.error)?;
            if let Err(e) = fs::remove_file(source) {
                debug!(error = %e, "failed to remove source after copy");
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

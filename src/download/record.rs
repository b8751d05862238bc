// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-download bookkeeping.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::request::DownloadRequest;
use super::response::DownloadResponse;
use super::types::{ProgressCallback, TransferProgress};
use crate::error::DownloadError;
use crate::locks::resilient_lock;
use crate::platform::TransferTask;

pub(crate) type DownloadResult = Result<DownloadResponse, DownloadError>;

/// Single-assignment container for a download's terminal outcome.
///
/// The first `resolve` wins. Later attempts return `false` and drop
/// their value, which deletes any self-deleting content it carried.
/// `is_resolved` is a lock-free read so progress delivery never waits on
/// a resolution in flight.
pub(crate) struct ResultSlot {
    sender: Mutex<Option<oneshot::Sender<DownloadResult>>>,
    resolved: AtomicBool,
}

impl ResultSlot {
    pub(crate) fn new() -> (Self, oneshot::Receiver<DownloadResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
                resolved: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub(crate) fn resolve(&self, outcome: DownloadResult) -> bool {
        let sender = {
            let mut guard = resilient_lock(&self.sender);
            let sender = guard.take();
            if sender.is_some() {
                self.resolved.store(true, Ordering::SeqCst);
            }
            sender
        };
        match sender {
            Some(tx) => {
                // A caller that stopped waiting just drops the outcome.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordState {
    response: Option<DownloadResponse>,
    completed: bool,
}

/// In-flight record for one download.
pub(crate) struct PendingDownload {
    task: Arc<dyn TransferTask>,
    request: DownloadRequest,
    target_path: Option<PathBuf>,
    progress_callback: Option<ProgressCallback>,
    progress_tx: watch::Sender<TransferProgress>,
    cancellation: CancellationToken,
    watcher: Mutex<Option<AbortHandle>>,
    slot: ResultSlot,
    state: Mutex<RecordState>,
    started: Instant,
}

impl PendingDownload {
    pub(crate) fn new(
        task: Arc<dyn TransferTask>,
        request: DownloadRequest,
        target_path: Option<PathBuf>,
        progress_callback: Option<ProgressCallback>,
        cancellation: CancellationToken,
    ) -> (Self, oneshot::Receiver<DownloadResult>, watch::Receiver<TransferProgress>) {
        let (slot, result_rx) = ResultSlot::new();
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::default());
        let record = Self {
            task,
            request,
            target_path,
            progress_callback,
            progress_tx,
            cancellation,
            watcher: Mutex::new(None),
            slot,
            state: Mutex::new(RecordState::default()),
            started: Instant::now(),
        };
        (record, result_rx, progress_rx)
    }

    pub(crate) fn task(&self) -> &Arc<dyn TransferTask> {
        &self.task
    }

    pub(crate) fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub(crate) fn target_path(&self) -> Option<&Path> {
        self.target_path.as_deref()
    }

    /// The caller's cancellation signal has fired.
    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Attach the task observing the cancellation signal. It is aborted on
    /// resolution, immediately if that already happened.
    pub(crate) fn set_watcher(&self, watcher: AbortHandle) {
        let mut current = resilient_lock(&self.watcher);
        if self.slot.is_resolved() {
            watcher.abort();
        } else {
            *current = Some(watcher);
        }
    }

    /// Publish progress unless the download already resolved. The callback
    /// runs without any lock held, so it may cancel or block freely.
    pub(crate) fn report_progress(&self, progress: TransferProgress) {
        if self.slot.is_resolved() {
            return;
        }
        self.progress_tx.send_replace(progress);
        if let Some(callback) = &self.progress_callback {
            callback(&progress);
        }
    }

    pub(crate) fn resolve(&self, outcome: DownloadResult) -> bool {
        let resolved = self.slot.resolve(outcome);
        if resolved {
            if let Some(watcher) = resilient_lock(&self.watcher).take() {
                watcher.abort();
            }
            tracing::debug!(
                task = %self.task.id(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "download resolved"
            );
        }
        resolved
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    pub(crate) fn set_response(&self, response: DownloadResponse) {
        resilient_lock(&self.state).response = Some(response);
    }

    pub(crate) fn take_response(&self) -> Option<DownloadResponse> {
        resilient_lock(&self.state).response.take()
    }

    /// Drop an assembled response that lost to cancellation, deleting the
    /// file it claimed even when it sits at the caller's destination.
    pub(crate) fn discard_response(&self) {
        if let Some(response) = self.take_response() {
            tracing::debug!(task = %self.task.id(), path = %response.content().path().display(), "discarding claimed file");
            response.into_content().discard();
        }
    }

    pub(crate) fn mark_completed(&self) {
        resilient_lock(&self.state).completed = true;
    }

    pub(crate) fn is_completed(&self) -> bool {
        resilient_lock(&self.state).completed
    }
}

impl fmt::Debug for PendingDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDownload")
            .field("task", &self.task.id())
            .field("url", &self.request.url.as_str())
            .field("target_path", &self.target_path)
            .field("resolved", &self.slot.is_resolved())
            .finish()
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session handle: one background session and its completion bridge.
//!
//! The host's transfer subsystem is process-scoped and outlives us across
//! relaunches, so the process keeps exactly one [`BackgroundDownloader`]
//! for it. [`ensure_initialized`] creates it lazily under a lock; every
//! later call, from any thread, gets the same instance.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use tracing::info;

use crate::config::Config;
use crate::download::{
    BridgeOptions, CompletionBridge, CookieJar, DownloadHandle, DownloadOptions, DownloadRequest,
    DownloadResponse, TaskId,
};
use crate::error::DownloadError;
use crate::locks::resilient_lock;
use crate::platform::{HttpTransferSession, SessionDelegate, TransferSession};

/// Awaitable downloads over one background session.
pub struct BackgroundDownloader {
    bridge: Arc<CompletionBridge>,
}

impl BackgroundDownloader {
    /// Wrap `session` and attach the completion bridge as its delegate.
    pub fn new(session: Arc<dyn TransferSession>, cookies: Arc<CookieJar>, options: BridgeOptions) -> Self {
        let bridge = Arc::new(CompletionBridge::new(Arc::clone(&session), cookies, options));
        let weak: Weak<CompletionBridge> = Arc::downgrade(&bridge);
        let delegate: Weak<dyn SessionDelegate> = weak;
        session.attach(delegate);
        Self { bridge }
    }

    /// Build the reqwest-backed session described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, DownloadError> {
        let session = HttpTransferSession::new(config.session_configuration())?;
        Ok(Self::new(
            Arc::new(session),
            Arc::new(CookieJar::new()),
            config.bridge_options(),
        ))
    }

    pub fn session_identifier(&self) -> &str {
        self.bridge.session().identifier()
    }

    pub fn bridge(&self) -> &Arc<CompletionBridge> {
        &self.bridge
    }

    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        self.bridge.cookie_jar()
    }

    pub fn in_flight(&self) -> usize {
        self.bridge.in_flight()
    }

    pub fn in_flight_tasks(&self) -> Vec<TaskId> {
        self.bridge.in_flight_tasks()
    }

    pub fn start(&self, request: DownloadRequest, options: DownloadOptions) -> Result<DownloadHandle, DownloadError> {
        self.bridge.start_download(request, options)
    }

    pub async fn download(
        &self,
        request: DownloadRequest,
        options: DownloadOptions,
    ) -> Result<DownloadResponse, DownloadError> {
        self.bridge.download(request, options).await
    }

    /// GET `url` into `destination`.
    pub async fn download_url(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<DownloadResponse, DownloadError> {
        let request = DownloadRequest::get(url)?;
        self.download(request, DownloadOptions::new().destination(destination))
            .await
    }

    /// Replay events the session buffered while nobody was listening.
    pub fn dispatch_buffered_events(&self) -> usize {
        self.bridge.session().dispatch_buffered_events()
    }
}

impl fmt::Debug for BackgroundDownloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundDownloader")
            .field("bridge", &self.bridge)
            .finish()
    }
}

static SHARED: Mutex<Option<Arc<BackgroundDownloader>>> = Mutex::new(None);

/// The process-wide downloader, creating it from `config` on first use.
pub fn ensure_initialized(config: &Config) -> Result<Arc<BackgroundDownloader>, DownloadError> {
    ensure_initialized_with(|| BackgroundDownloader::from_config(config))
}

/// Like [`ensure_initialized`] with a caller-supplied constructor. `init`
/// runs at most once per process, and only if nothing is installed yet.
pub fn ensure_initialized_with<F>(init: F) -> Result<Arc<BackgroundDownloader>, DownloadError>
where
    F: FnOnce() -> Result<BackgroundDownloader, DownloadError>,
{
    let mut shared = resilient_lock(&SHARED);
    if let Some(existing) = shared.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let downloader = Arc::new(init()?);
    info!(session = downloader.session_identifier(), "background session initialised");
    *shared = Some(Arc::clone(&downloader));
    Ok(downloader)
}

/// The process-wide downloader, if one was initialised.
pub fn shared() -> Option<Arc<BackgroundDownloader>> {
    resilient_lock(&SHARED).clone()
}

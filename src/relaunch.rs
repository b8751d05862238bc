// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wake-up entry point for background sessions.
//!
//! The host calls [`RelaunchHandler::handle_events_for_background_session`]
//! when it relaunches the process to deliver events for a session. The
//! handler makes sure the session handle exists before anything is
//! replayed, replays, tells the user, and hands control back to the host.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::DownloadError;
use crate::session;

pub const NOTIFICATION_IDENTIFIER: &str = "ALERT_REQUEST";
pub const NOTIFICATION_CATEGORY: &str = "COMPLETE";

/// A local notification to show the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub identifier: String,
    pub category: String,
    pub title: String,
    pub body: String,
    /// Delay before the notification is shown.
    pub delay: Duration,
}

impl Notification {
    pub fn download_complete() -> Self {
        Self {
            identifier: NOTIFICATION_IDENTIFIER.to_string(),
            category: NOTIFICATION_CATEGORY.to_string(),
            title: "Download complete".to_string(),
            body: "Your background download has finished.".to_string(),
            delay: Duration::from_secs(1),
        }
    }
}

/// Host notification surface.
pub trait Notifier: Send + Sync {
    /// Ask the user for permission to post. Called at most once per handler.
    fn request_permission(&self) -> bool;
    fn post(&self, notification: Notification) -> Result<()>;
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn request_permission(&self) -> bool {
        true
    }

    fn post(&self, notification: Notification) -> Result<()> {
        info!(
            id = %notification.identifier,
            category = %notification.category,
            delay_ms = notification.delay.as_millis() as u64,
            "{}: {}",
            notification.title,
            notification.body
        );
        Ok(())
    }
}

pub struct RelaunchHandler {
    config: Config,
    notifier: Arc<dyn Notifier>,
    permission: OnceLock<bool>,
}

impl RelaunchHandler {
    pub fn new(config: Config, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            permission: OnceLock::new(),
        }
    }

    pub fn owns(&self, session_identifier: &str) -> bool {
        session_identifier == self.config.session_identifier
    }

    /// Continue `session_identifier` after a relaunch.
    ///
    /// `completion` is the host's completion handler. It is always called,
    /// exactly once, after the work is done or has failed. Returns the
    /// number of replayed events; sessions we do not own replay nothing.
    pub fn handle_events_for_background_session<F>(
        &self,
        session_identifier: &str,
        completion: F,
    ) -> Result<usize, DownloadError>
    where
        F: FnOnce(),
    {
        let outcome = self.continue_session(session_identifier);
        completion();
        outcome
    }

    fn continue_session(&self, session_identifier: &str) -> Result<usize, DownloadError> {
        if !self.owns(session_identifier) {
            debug!(session = session_identifier, "ignoring events for a foreign session");
            return Ok(0);
        }

        let downloader = session::ensure_initialized(&self.config)?;
        let replayed = downloader.dispatch_buffered_events();
        info!(session = session_identifier, replayed, "background session events handled");

        if self.config.notifications_enabled {
            self.notify_complete();
        }
        Ok(replayed)
    }

    fn notify_complete(&self) {
        let permitted = *self
            .permission
            .get_or_init(|| self.notifier.request_permission());
        if !permitted {
            debug!("notification permission denied");
            return;
        }
        if let Err(e) = self.notifier.post(Notification::download_complete()) {
            warn!(error = %e, "failed to post completion notification");
        }
    }
}

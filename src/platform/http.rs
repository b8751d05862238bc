// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Portable background session backed by reqwest.
//!
//! Behaves like an OS transfer daemon as far as the delegate can tell:
//! - tasks are created suspended and start on `resume`
//! - data is written to a private staging file, never to the caller's path
//! - callbacks run on tokio worker tasks, in order per task
//! - the staging file is deleted as soon as `did_finish_downloading`
//!   returns, whether or not the delegate claimed it
//! - events raised while no delegate is attached are buffered and replayed
//!   by `dispatch_buffered_events`

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{redirect, Client, Url};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    NativeCookieStorage, ResponseInfo, SessionConfiguration, SessionDelegate, TaskState,
    TransferError, TransferRequest, TransferSession, TransferTask,
};
use crate::download::cookies::CookieJar;
use crate::download::types::TaskId;
use crate::error::DownloadError;
use crate::locks::resilient_lock;

/// Event waiting for, or on its way to, the delegate.
enum SessionEvent {
    WroteData {
        task: Arc<HttpTask>,
        bytes_written: u64,
        total_bytes_written: u64,
        total_bytes_expected: Option<u64>,
    },
    FinishedDownloading {
        task: Arc<HttpTask>,
        location: TempPath,
    },
    Completed {
        task: Arc<HttpTask>,
        error: Option<TransferError>,
    },
}

impl SessionEvent {
    fn deliver(self, delegate: &dyn SessionDelegate) {
        match self {
            SessionEvent::WroteData {
                task,
                bytes_written,
                total_bytes_written,
                total_bytes_expected,
            } => delegate.did_write_data(&*task, bytes_written, total_bytes_written, total_bytes_expected),
            SessionEvent::FinishedDownloading { task, location } => {
                delegate.did_finish_downloading(&*task, &location);
                // Dropping the TempPath deletes whatever the delegate left behind.
                drop(location);
            }
            SessionEvent::Completed { task, error } => delegate.did_complete(&*task, error),
        }
    }
}

#[derive(Default)]
struct Dispatcher {
    delegate: Option<Weak<dyn SessionDelegate>>,
    buffered: VecDeque<SessionEvent>,
    replaying: bool,
}

struct SessionInner {
    config: SessionConfiguration,
    follow: Client,
    no_follow: Client,
    cookies: Option<Arc<CookieJar>>,
    runtime: Handle,
    next_id: AtomicU64,
    dispatcher: Mutex<Dispatcher>,
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let delegate = {
            let mut dispatcher = resilient_lock(&self.dispatcher);
            let live = dispatcher.delegate.as_ref().and_then(Weak::upgrade);
            match live {
                Some(delegate) if !dispatcher.replaying && dispatcher.buffered.is_empty() => delegate,
                _ => {
                    dispatcher.buffered.push_back(event);
                    return;
                }
            }
        };
        event.deliver(&*delegate);
    }
}

/// reqwest-driven [`TransferSession`].
pub struct HttpTransferSession {
    inner: Arc<SessionInner>,
}

impl HttpTransferSession {
    /// Create a session on the current tokio runtime.
    pub fn new(config: SessionConfiguration) -> Result<Self, DownloadError> {
        let runtime = Handle::try_current()
            .map_err(|e| DownloadError::Session(format!("no async runtime: {}", e)))?;
        Self::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: SessionConfiguration, runtime: Handle) -> Result<Self, DownloadError> {
        std::fs::create_dir_all(&config.staging_dir).map_err(|e| {
            DownloadError::Session(format!(
                "cannot create staging directory {}: {}",
                config.staging_dir.display(),
                e
            ))
        })?;

        let cookies = config.use_native_cookies.then(|| Arc::new(CookieJar::new()));
        let follow = build_client(&config, cookies.as_ref(), redirect::Policy::default())?;
        let no_follow = build_client(&config, cookies.as_ref(), redirect::Policy::none())?;

        debug!(session = %config.identifier, staging = %config.staging_dir.display(), "background session created");

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                follow,
                no_follow,
                cookies,
                runtime,
                next_id: AtomicU64::new(0),
                dispatcher: Mutex::new(Dispatcher::default()),
            }),
        })
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.inner.config
    }

    /// Events waiting for a delegate.
    pub fn buffered_events(&self) -> usize {
        resilient_lock(&self.inner.dispatcher).buffered.len()
    }
}

impl fmt::Debug for HttpTransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransferSession")
            .field("identifier", &self.inner.config.identifier)
            .field("buffered_events", &self.buffered_events())
            .finish()
    }
}

fn build_client(
    config: &SessionConfiguration,
    cookies: Option<&Arc<CookieJar>>,
    policy: redirect::Policy,
) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .redirect(policy);
    if let Some(agent) = &config.user_agent {
        builder = builder.user_agent(agent.clone());
    }
    if let Some(jar) = cookies {
        builder = builder.cookie_provider(Arc::clone(jar));
    }
    builder
        .build()
        .map_err(|e| DownloadError::Session(format!("cannot build HTTP client: {}", e)))
}

impl TransferSession for HttpTransferSession {
    fn identifier(&self) -> &str {
        &self.inner.config.identifier
    }

    fn create_download_task(
        &self,
        request: TransferRequest,
    ) -> Result<Arc<dyn TransferTask>, TransferError> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(TransferError::InvalidRequest(format!(
                "unsupported scheme '{}'",
                request.url.scheme()
            )));
        }

        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Arc::downgrade(&self.inner);
        let task = Arc::new_cyclic(|me| HttpTask {
            id,
            current_url: Mutex::new(Some(request.url.clone())),
            request,
            state: Mutex::new(TaskState::Suspended),
            response: Mutex::new(None),
            cancel: CancellationToken::new(),
            data_complete: AtomicBool::new(false),
            session,
            me: me.clone(),
        });
        Ok(task as Arc<dyn TransferTask>)
    }

    fn cookie_storage(&self) -> Option<Arc<dyn NativeCookieStorage>> {
        self.inner
            .cookies
            .as_ref()
            .map(|jar| Arc::clone(jar) as Arc<dyn NativeCookieStorage>)
    }

    fn attach(&self, delegate: Weak<dyn SessionDelegate>) {
        resilient_lock(&self.inner.dispatcher).delegate = Some(delegate);
    }

    fn dispatch_buffered_events(&self) -> usize {
        let delegate = {
            let mut dispatcher = resilient_lock(&self.inner.dispatcher);
            let Some(delegate) = dispatcher.delegate.as_ref().and_then(Weak::upgrade) else {
                return 0;
            };
            if dispatcher.replaying {
                return 0;
            }
            dispatcher.replaying = true;
            delegate
        };

        let mut replayed = 0;
        loop {
            let next = {
                let mut dispatcher = resilient_lock(&self.inner.dispatcher);
                match dispatcher.buffered.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatcher.replaying = false;
                        break;
                    }
                }
            };
            next.deliver(&*delegate);
            replayed += 1;
        }

        if replayed > 0 {
            debug!(session = %self.inner.config.identifier, replayed, "replayed buffered session events");
        }
        delegate.did_finish_events(&self.inner.config.identifier);
        replayed
    }
}

/// One reqwest-driven transfer.
pub struct HttpTask {
    id: TaskId,
    request: TransferRequest,
    state: Mutex<TaskState>,
    current_url: Mutex<Option<Url>>,
    response: Mutex<Option<ResponseInfo>>,
    cancel: CancellationToken,
    data_complete: AtomicBool,
    session: Weak<SessionInner>,
    me: Weak<HttpTask>,
}

impl HttpTask {
    fn set_state(&self, state: TaskState) {
        *resilient_lock(&self.state) = state;
    }
}

impl fmt::Debug for HttpTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTask")
            .field("id", &self.id)
            .field("url", &self.request.url.as_str())
            .field("state", &*resilient_lock(&self.state))
            .finish()
    }
}

impl TransferTask for HttpTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        *resilient_lock(&self.state)
    }

    fn resume(&self) {
        {
            let mut state = resilient_lock(&self.state);
            if *state != TaskState::Suspended {
                return;
            }
            *state = TaskState::Running;
        }
        let (Some(session), Some(task)) = (self.session.upgrade(), self.me.upgrade()) else {
            return;
        };
        trace!(task = %self.id, "task resumed");
        let runtime = session.runtime.clone();
        runtime.spawn(run_transfer(session, task));
    }

    fn cancel(&self) {
        if self.data_complete.load(Ordering::SeqCst) {
            // Nothing left to cancel once the file has been delivered.
            return;
        }
        let previous = {
            let mut state = resilient_lock(&self.state);
            let previous = *state;
            if matches!(previous, TaskState::Suspended | TaskState::Running) {
                *state = TaskState::Canceling;
            }
            previous
        };
        match previous {
            TaskState::Running => self.cancel.cancel(),
            TaskState::Suspended => {
                // Never started: report the terminal callback ourselves.
                if let (Some(session), Some(task)) = (self.session.upgrade(), self.me.upgrade()) {
                    let runtime = session.runtime.clone();
                    runtime.spawn(async move {
                        session.emit(SessionEvent::Completed {
                            task: Arc::clone(&task),
                            error: Some(TransferError::Cancelled),
                        });
                        task.set_state(TaskState::Completed);
                    });
                }
            }
            TaskState::Canceling | TaskState::Completed => {}
        }
    }

    fn original_url(&self) -> Option<Url> {
        Some(self.request.url.clone())
    }

    fn current_url(&self) -> Option<Url> {
        resilient_lock(&self.current_url).clone()
    }

    fn response(&self) -> Option<ResponseInfo> {
        resilient_lock(&self.response).clone()
    }
}

async fn run_transfer(session: Arc<SessionInner>, task: Arc<HttpTask>) {
    let outcome = tokio::select! {
        biased;
        _ = task.cancel.cancelled() => Err(TransferError::Cancelled),
        result = fetch(&session, &task) => result,
    };

    match outcome {
        Ok(location) => {
            task.data_complete.store(true, Ordering::SeqCst);
            session.emit(SessionEvent::FinishedDownloading {
                task: Arc::clone(&task),
                location,
            });
            session.emit(SessionEvent::Completed {
                task: Arc::clone(&task),
                error: None,
            });
            task.set_state(TaskState::Completed);
        }
        Err(error) => {
            debug!(task = %task.id, error = %error, "transfer failed");
            session.emit(SessionEvent::Completed {
                task: Arc::clone(&task),
                error: Some(error),
            });
            task.set_state(TaskState::Completed);
        }
    }
}

async fn fetch(session: &Arc<SessionInner>, task: &Arc<HttpTask>) -> Result<TempPath, TransferError> {
    let request = &task.request;
    let client = if request.follow_redirects {
        &session.follow
    } else {
        &session.no_follow
    };

    let response = client
        .request(request.method.clone(), request.url.clone())
        .headers(request.headers.clone())
        .send()
        .await
        .map_err(|e| TransferError::Network(e.to_string()))?;

    let info = response_info(&response);
    let expected = info.expected_content_length;
    *resilient_lock(&task.current_url) = Some(response.url().clone());
    *resilient_lock(&task.response) = Some(info);

    let staged = tempfile::Builder::new()
        .prefix("transfer-")
        .suffix(".tmp")
        .tempfile_in(&session.config.staging_dir)
        .map_err(|e| TransferError::Io(e.to_string()))?;
    let (file, location) = staged.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransferError::Network(e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        total += chunk.len() as u64;
        session.emit(SessionEvent::WroteData {
            task: Arc::clone(task),
            bytes_written: chunk.len() as u64,
            total_bytes_written: total,
            total_bytes_expected: expected,
        });
    }
    file.flush().await.map_err(|e| TransferError::Io(e.to_string()))?;
    drop(file);

    Ok(location)
}

fn response_info(response: &reqwest::Response) -> ResponseInfo {
    let headers = response.headers().clone();
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let disposition = headers.get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok());

    ResponseInfo {
        url: Some(response.url().clone()),
        status: Some(response.status()),
        suggested_filename: suggested_filename(response.url(), disposition),
        mime_type,
        expected_content_length: response.content_length(),
        headers,
    }
}

/// File name from `Content-Disposition`, else the last URL path segment.
pub(crate) fn suggested_filename(url: &Url, content_disposition: Option<&str>) -> Option<String> {
    let from_header = content_disposition.and_then(|value| {
        value.split(';').map(str::trim).find_map(|part| {
            let (key, val) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("filename")
                .then(|| val.trim().trim_matches('"').to_string())
        })
    });

    from_header
        .filter(|name| !name.is_empty())
        .or_else(|| {
            url.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(str::to_string)
        })
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted in-memory transfer session.
//!
//! Tasks never do any I/O on their own. Tests drive every callback
//! explicitly, which makes orderings and races reproducible.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bgfetch::download::{BridgeOptions, Cookie, CookieJar, TaskId};
use bgfetch::platform::{
    NativeCookieStorage, ResponseInfo, SessionDelegate, TaskState, TransferError, TransferRequest,
    TransferSession, TransferTask,
};
use bgfetch::BackgroundDownloader;
use reqwest::Url;
use tempfile::TempDir;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ScriptedTask {
    id: TaskId,
    request: TransferRequest,
    state: Mutex<TaskState>,
    current_url: Mutex<Url>,
    response: Mutex<Option<ResponseInfo>>,
    pub resumes: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl ScriptedTask {
    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn redirect_to(&self, url: &str) {
        *self.current_url.lock().unwrap() = Url::parse(url).unwrap();
    }

    pub fn set_response(&self, info: ResponseInfo) {
        *self.response.lock().unwrap() = Some(info);
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl TransferTask for ScriptedTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Suspended {
            *state = TaskState::Running;
        }
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state != TaskState::Completed {
            *state = TaskState::Canceling;
        }
    }

    fn original_url(&self) -> Option<Url> {
        Some(self.request.url.clone())
    }

    fn current_url(&self) -> Option<Url> {
        Some(self.current_url.lock().unwrap().clone())
    }

    fn response(&self) -> Option<ResponseInfo> {
        self.response.lock().unwrap().clone()
    }
}

/// Callback the session will deliver.
pub enum Event {
    Progress { written: u64, total: u64, expected: Option<u64> },
    Finished(Vec<u8>),
    Completed(Option<TransferError>),
}

pub struct ScriptedSession {
    identifier: String,
    next_id: AtomicU64,
    tasks: Mutex<Vec<Arc<ScriptedTask>>>,
    delegate: Mutex<Option<Weak<dyn SessionDelegate>>>,
    buffered: Mutex<Vec<(Arc<ScriptedTask>, Event)>>,
    native_cookies: Option<Arc<CookieJar>>,
    staging: TempDir,
    pub finished_events: AtomicUsize,
}

impl ScriptedSession {
    pub fn new(identifier: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            delegate: Mutex::new(None),
            buffered: Mutex::new(Vec::new()),
            native_cookies: None,
            staging: TempDir::new().unwrap(),
            finished_events: AtomicUsize::new(0),
        })
    }

    pub fn with_native_cookies(identifier: &str, cookies: Vec<Cookie>) -> Arc<Self> {
        let jar = Arc::new(CookieJar::new());
        jar.merge(cookies);
        Arc::new(Self {
            identifier: identifier.to_string(),
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            delegate: Mutex::new(None),
            buffered: Mutex::new(Vec::new()),
            native_cookies: Some(jar),
            staging: TempDir::new().unwrap(),
            finished_events: AtomicUsize::new(0),
        })
    }

    pub fn task(&self, id: TaskId) -> Arc<ScriptedTask> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .expect("unknown task")
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    fn delegate(&self) -> Arc<dyn SessionDelegate> {
        self.delegate
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("no delegate attached")
    }

    /// Deliver `event` for `task` right now on the calling thread.
    pub fn deliver(&self, task: &Arc<ScriptedTask>, event: Event) {
        let delegate = self.delegate();
        match event {
            Event::Progress { written, total, expected } => {
                delegate.did_write_data(&**task, written, total, expected)
            }
            Event::Finished(data) => {
                let location = self.staging.path().join(format!("{}.tmp", task.id));
                std::fs::write(&location, &data).unwrap();
                delegate.did_finish_downloading(&**task, &location);
                // The platform reclaims its staging file once the callback returns.
                let _ = std::fs::remove_file(&location);
            }
            Event::Completed(error) => {
                *task.state.lock().unwrap() = TaskState::Completed;
                delegate.did_complete(&**task, error);
            }
        }
    }

    pub fn progress(&self, task: &Arc<ScriptedTask>, written: u64, total: u64, expected: Option<u64>) {
        self.deliver(task, Event::Progress { written, total, expected });
    }

    pub fn finish(&self, task: &Arc<ScriptedTask>, data: &[u8]) {
        self.deliver(task, Event::Finished(data.to_vec()));
    }

    pub fn complete(&self, task: &Arc<ScriptedTask>, error: Option<TransferError>) {
        self.deliver(task, Event::Completed(error));
    }

    /// Queue an event as if it happened while the process was not running.
    pub fn buffer(&self, task: &Arc<ScriptedTask>, event: Event) {
        self.buffered.lock().unwrap().push((Arc::clone(task), event));
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging.path().to_path_buf()
    }
}

impl TransferSession for ScriptedSession {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn create_download_task(&self, request: TransferRequest) -> Result<Arc<dyn TransferTask>, TransferError> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let task = Arc::new(ScriptedTask {
            id,
            current_url: Mutex::new(request.url.clone()),
            request,
            state: Mutex::new(TaskState::Suspended),
            response: Mutex::new(None),
            resumes: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        });
        self.tasks.lock().unwrap().push(Arc::clone(&task));
        Ok(task as Arc<dyn TransferTask>)
    }

    fn cookie_storage(&self) -> Option<Arc<dyn NativeCookieStorage>> {
        self.native_cookies
            .as_ref()
            .map(|jar| Arc::clone(jar) as Arc<dyn NativeCookieStorage>)
    }

    fn attach(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }

    fn dispatch_buffered_events(&self) -> usize {
        let events: Vec<_> = self.buffered.lock().unwrap().drain(..).collect();
        let count = events.len();
        for (task, event) in events {
            self.deliver(&task, event);
        }
        self.finished_events.fetch_add(1, Ordering::SeqCst);
        self.delegate().did_finish_events(&self.identifier);
        count
    }
}

pub fn downloader(session: &Arc<ScriptedSession>, temp_dir: &TempDir) -> BackgroundDownloader {
    let options = BridgeOptions {
        use_cookies: true,
        temp_dir: Some(temp_dir.path().to_path_buf()),
    };
    BackgroundDownloader::new(
        Arc::clone(session) as Arc<dyn TransferSession>,
        Arc::new(CookieJar::new()),
        options,
    )
}

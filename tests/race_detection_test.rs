// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for bgfetch
//!
//! These tests verify thread safety of the completion bridge and the
//! process-wide session handle. They are designed to detect data races when
//! run with ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! # On Linux with nightly Rust:
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Many downloads resolving concurrently through one bridge
//! - Cancellation racing platform callbacks
//! - Managed cookie jar under concurrent writers
//! - Session handle initialisation under concurrent wake events

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bgfetch::config::Config;
use bgfetch::download::{Cookie, CookieJar, DownloadOptions, DownloadRequest};
use bgfetch::platform::TransferSession;
use bgfetch::relaunch::{Notification, Notifier, RelaunchHandler};
use bgfetch::session::{self, BackgroundDownloader};
use bgfetch::download::BridgeOptions;
use common::{downloader, Event, ScriptedSession};
use reqwest::Url;
use tempfile::TempDir;
use tokio::time::timeout;

// Test configuration
const CONCURRENCY_LEVEL: usize = 64;
const ITERATIONS_PER_TASK: usize = 25;
const TEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// BRIDGE CONCURRENT RESOLUTION TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bridge_concurrent_downloads() {
    let temp = TempDir::new().unwrap();
    let session = ScriptedSession::new("race.session");
    let downloader = Arc::new(downloader(&session, &temp));
    let successes = Arc::new(AtomicU64::new(0));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let downloader = downloader.clone();
        let session = session.clone();
        let successes = successes.clone();
        handles.push(tokio::spawn(async move {
            let request = DownloadRequest::get(&format!("https://example.com/{}", i)).unwrap();
            let handle = downloader.start(request, DownloadOptions::new()).unwrap();
            let task = session.task(handle.task_id());

            let driver = tokio::task::spawn_blocking(move || {
                for step in 1..=ITERATIONS_PER_TASK as u64 {
                    session.progress(&task, 1, step, Some(ITERATIONS_PER_TASK as u64));
                }
                session.finish(&task, &[1u8; ITERATIONS_PER_TASK]);
                session.complete(&task, None);
            });

            let response = handle.wait().await.expect("download failed");
            driver.await.expect("driver panicked");
            assert_eq!(response.content_length(), Some(ITERATIONS_PER_TASK as u64));
            successes.fetch_add(1, Ordering::Relaxed);
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
    assert_eq!(successes.load(Ordering::Relaxed), CONCURRENCY_LEVEL as u64);
    assert_eq!(downloader.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_races_every_callback() {
    let temp = TempDir::new().unwrap();
    let session = ScriptedSession::new("race.session");
    let downloader = Arc::new(downloader(&session, &temp));
    let canceled = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let downloader = downloader.clone();
        let session = session.clone();
        let canceled = canceled.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            let request = DownloadRequest::get(&format!("https://example.com/c/{}", i)).unwrap();
            let handle = downloader.start(request, DownloadOptions::new()).unwrap();
            let task = session.task(handle.task_id());
            let token = handle.cancellation_token();

            let driver = tokio::task::spawn_blocking(move || {
                session.progress(&task, 4, 4, Some(4));
                session.finish(&task, b"data");
                session.complete(&task, None);
            });
            if i % 2 == 0 {
                token.cancel();
            }

            match handle.wait().await {
                Ok(_) => completed.fetch_add(1, Ordering::Relaxed),
                Err(e) if e.is_canceled() => canceled.fetch_add(1, Ordering::Relaxed),
                Err(e) => panic!("unexpected error: {:?}", e),
            };
            driver.await.expect("driver panicked");
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
    // Every download resolved exactly once, one way or the other.
    assert_eq!(
        canceled.load(Ordering::Relaxed) + completed.load(Ordering::Relaxed),
        CONCURRENCY_LEVEL
    );
    assert!(completed.load(Ordering::Relaxed) >= CONCURRENCY_LEVEL / 2);
    assert_eq!(downloader.in_flight(), 0);
}

// =============================================================================
// COOKIE JAR TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cookie_jar_concurrent_store_and_read() {
    let jar = Arc::new(CookieJar::new());
    let url = Url::parse("https://example.com/").unwrap();
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let jar = jar.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK {
                if j % 2 == 0 {
                    jar.store(Cookie::new(format!("c{}", j % 8), format!("v{}", i), "example.com"));
                } else {
                    let _ = jar.cookie_header(&url);
                }
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
    // Keyed by (domain, path, name): no duplicates however many writers.
    assert_eq!(jar.len(), 8);
}

// =============================================================================
// SESSION HANDLE TESTS
// =============================================================================

#[derive(Default)]
struct CountingNotifier {
    permission_requests: AtomicUsize,
    posted: AtomicUsize,
}

impl Notifier for CountingNotifier {
    fn request_permission(&self) -> bool {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn post(&self, notification: Notification) -> anyhow::Result<()> {
        assert_eq!(notification.identifier, "ALERT_REQUEST");
        self.posted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The only test in this binary that touches the process-wide handle.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_handle_initialised_once_then_relaunch_replays() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        session_identifier: "race.relaunch".to_string(),
        ..Config::default()
    };
    let scripted = ScriptedSession::new("race.relaunch");
    let inits = Arc::new(AtomicUsize::new(0));

    // Concurrent wake events all race to create the handle.
    let mut threads = vec![];
    for _ in 0..16 {
        let scripted = scripted.clone();
        let inits = inits.clone();
        let temp_path = temp.path().to_path_buf();
        threads.push(std::thread::spawn(move || {
            session::ensure_initialized_with(|| {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(BackgroundDownloader::new(
                    scripted as Arc<dyn TransferSession>,
                    Arc::new(CookieJar::new()),
                    BridgeOptions {
                        use_cookies: true,
                        temp_dir: Some(temp_path),
                    },
                ))
            })
            .unwrap()
        }));
    }
    let instances: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert!(instances.iter().all(|d| Arc::ptr_eq(d, &instances[0])));
    let shared = session::shared().expect("handle installed");
    assert!(Arc::ptr_eq(&shared, &instances[0]));

    // A download whose events arrive while the process is "asleep".
    let dest = temp.path().join("relaunched.bin");
    let handle = shared
        .start(
            DownloadRequest::get("https://example.com/bg").unwrap(),
            DownloadOptions::new().destination(&dest),
        )
        .unwrap();
    let task = scripted.task(handle.task_id());
    scripted.buffer(&task, Event::Progress { written: 5, total: 5, expected: Some(5) });
    scripted.buffer(&task, Event::Finished(b"hello".to_vec()));
    scripted.buffer(&task, Event::Completed(None));

    let notifier = Arc::new(CountingNotifier::default());
    let handler = RelaunchHandler::new(config, notifier.clone());
    let completion_calls = AtomicUsize::new(0);

    let replayed = handler
        .handle_events_for_background_session("race.relaunch", || {
            completion_calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(replayed, 3);
    assert_eq!(completion_calls.load(Ordering::SeqCst), 1);
    assert_eq!(scripted.finished_events.load(Ordering::SeqCst), 1);

    let response = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.content_length(), Some(5));
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello");

    // A second wake-up replays nothing but still notifies; permission is
    // only requested once.
    let replayed = handler
        .handle_events_for_background_session("race.relaunch", || {
            completion_calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(replayed, 0);
    assert_eq!(completion_calls.load(Ordering::SeqCst), 2);
    assert_eq!(notifier.permission_requests.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.posted.load(Ordering::SeqCst), 2);

    // Foreign sessions are ignored but the host is still released.
    let replayed = handler
        .handle_events_for_background_session("someone.else", || {
            completion_calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(replayed, 0);
    assert_eq!(completion_calls.load(Ordering::SeqCst), 3);
    assert_eq!(notifier.posted.load(Ordering::SeqCst), 2);
}

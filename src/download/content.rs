// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed response bodies.
//!
//! A downloaded body is never loaded into memory by the bridge. It stays
//! on disk and is read lazily through [`DownloadContent::open`]. When the
//! caller did not choose a destination the file lives at a private
//! temporary path and is deleted once the content is consumed or dropped.

use std::fmt;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::bridge::move_into_place;

/// Deletes a file on drop when armed. Failures are swallowed.
#[derive(Debug)]
struct DeleteGuard {
    path: PathBuf,
    armed: bool,
}

impl DeleteGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DeleteGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.path.display(), error = %e, "failed to delete download content");
                }
            }
        }
    }
}

/// Response body backed by a downloaded file.
#[derive(Debug)]
pub struct DownloadContent {
    suggested_filename: Option<String>,
    mime_type: Option<String>,
    guard: DeleteGuard,
}

impl DownloadContent {
    pub fn new(
        path: impl Into<PathBuf>,
        suggested_filename: Option<String>,
        mime_type: Option<String>,
        delete_on_consume: bool,
    ) -> Self {
        Self {
            suggested_filename,
            mime_type: mime_type.filter(|m| !m.is_empty()),
            guard: DeleteGuard {
                path: path.into(),
                armed: delete_on_consume,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    /// File name the server suggested, if any.
    pub fn suggested_filename(&self) -> Option<&str> {
        self.suggested_filename.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Whether the backing file is deleted when this content goes away.
    pub fn is_self_deleting(&self) -> bool {
        self.guard.armed
    }

    /// Current size of the backing file, or `None` if it no longer exists.
    pub fn len(&self) -> Option<u64> {
        fs::metadata(&self.guard.path).ok().map(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len().map(|len| len == 0).unwrap_or(true)
    }

    /// Open the body for streaming. The reader takes over deletion.
    pub async fn open(self) -> io::Result<ContentReader> {
        let file = tokio::fs::File::open(&self.guard.path).await?;
        Ok(ContentReader {
            file,
            _guard: self.guard,
        })
    }

    /// Read the whole body, consuming the content.
    pub async fn bytes(self) -> io::Result<Vec<u8>> {
        let mut reader = self.open().await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Move the backing file to `to` and keep it there. Returns the new path.
    pub fn persist(mut self, to: impl AsRef<Path>) -> io::Result<PathBuf> {
        let to = to.as_ref().to_path_buf();
        move_into_place(&self.guard.path, &to)?;
        self.guard.disarm();
        Ok(to)
    }

    /// Dispose of the content now instead of waiting for drop.
    pub fn release(self) {
        drop(self);
    }

    /// Delete the backing file whether or not it is self-deleting.
    pub(crate) fn discard(mut self) {
        self.guard.armed = true;
    }

    /// Give up deletion and return the path. Used when handing the file
    /// to code that manages its lifetime itself.
    pub fn into_path(mut self) -> PathBuf {
        self.guard.disarm();
        mem::take(&mut self.guard.path)
    }
}

impl fmt::Display for DownloadContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.guard.path.display())
    }
}

/// Lazy reader over a [`DownloadContent`].
#[derive(Debug)]
pub struct ContentReader {
    // Field order matters: the file handle closes before the guard deletes.
    file: tokio::fs::File,
    _guard: DeleteGuard,
}

impl AsyncRead for ContentReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_len_from_filesystem() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.bin", &[0u8; 1234]);
        let content = DownloadContent::new(&path, None, None, false);
        assert_eq!(content.len(), Some(1234));

        fs::remove_file(&path).unwrap();
        assert_eq!(content.len(), None);
    }

    #[test]
    fn test_drop_deletes_self_deleting_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tmp.bin", b"data");
        let content = DownloadContent::new(&path, None, None, true);
        assert!(content.is_self_deleting());
        content.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_keeps_caller_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "keep.bin", b"data");
        drop(DownloadContent::new(&path, None, None, false));
        assert!(path.exists());
    }

    #[test]
    fn test_drop_swallows_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never-created.bin");
        drop(DownloadContent::new(&path, None, None, true));
    }

    #[test]
    fn test_empty_mime_type_is_none() {
        let content = DownloadContent::new("/nonexistent", Some("a.zip".into()), Some(String::new()), false);
        assert_eq!(content.mime_type(), None);
        assert_eq!(content.suggested_filename(), Some("a.zip"));
        assert_eq!(content.to_string(), "/nonexistent");
    }

    #[tokio::test]
    async fn test_bytes_consumes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "body.bin", b"hello world");
        let content = DownloadContent::new(&path, None, None, true);

        let body = content.bytes().await.unwrap();
        assert_eq!(body, b"hello world");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reader_keeps_file_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "stream.bin", b"abc");
        let mut reader = DownloadContent::new(&path, None, None, true).open().await.unwrap();

        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"a");
        assert!(path.exists());

        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn test_discard_deletes_caller_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "claimed.bin", b"data");
        DownloadContent::new(&path, None, None, false).discard();
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_disarms_deletion() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "tmp.bin", b"data");
        let dest = dir.path().join("kept.bin");

        let content = DownloadContent::new(&path, None, None, true);
        let kept = content.persist(&dest).unwrap();

        assert_eq!(kept, dest);
        assert!(dest.exists());
        assert!(!path.exists());
    }
}

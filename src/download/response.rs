// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completed download responses.

use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{StatusCode, Url};

use super::content::DownloadContent;
use super::request::DownloadRequest;

/// Result of a successful download.
#[derive(Debug)]
pub struct DownloadResponse {
    status: StatusCode,
    headers: HeaderMap,
    content: DownloadContent,
    request: DownloadRequest,
}

impl DownloadResponse {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        content: DownloadContent,
        request: DownloadRequest,
    ) -> Self {
        Self {
            status,
            headers,
            content,
            request,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers, including reconciled `Set-Cookie` entries.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Values of every `Set-Cookie` header.
    pub fn set_cookies(&self) -> Vec<&str> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// The request that produced this response. Its URL is the final URL
    /// when the transfer was redirected.
    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn content(&self) -> &DownloadContent {
        &self.content
    }

    pub fn into_content(self) -> DownloadContent {
        self.content
    }

    /// Body length as currently on disk.
    pub fn content_length(&self) -> Option<u64> {
        self.content.len()
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Caller-level download requests.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use reqwest::{Method, Url};

use crate::error::DownloadError;
use crate::platform::TransferRequest;

/// An outbound request to download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub follow_redirects: bool,
}

impl DownloadRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            follow_redirects: true,
        }
    }

    /// GET request for `url`.
    pub fn get(url: &str) -> Result<Self, DownloadError> {
        let url = Url::parse(url)
            .map_err(|e| DownloadError::RequestConstruction(format!("invalid URL '{}': {}", url, e)))?;
        Ok(Self::new(Method::GET, url))
    }

    /// Add a header, validating name and value.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, DownloadError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DownloadError::RequestConstruction(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DownloadError::RequestConstruction(format!("invalid value for header '{}': {}", name, e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Build the platform-level request. `cookie_header` comes from the
    /// managed cookie jar and is only added when the caller did not set
    /// a `Cookie` header themselves.
    pub(crate) fn to_transfer_request(
        &self,
        cookie_header: Option<String>,
    ) -> Result<TransferRequest, DownloadError> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DownloadError::RequestConstruction(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }
        if self.url.host_str().is_none() {
            return Err(DownloadError::RequestConstruction(format!(
                "URL '{}' has no host",
                self.url
            )));
        }

        let mut headers = self.headers.clone();
        if let Some(cookies) = cookie_header {
            if !headers.contains_key(COOKIE) {
                let value = HeaderValue::from_str(&cookies)
                    .map_err(|e| DownloadError::RequestConstruction(format!("invalid cookie header: {}", e)))?;
                headers.insert(COOKIE, value);
            }
        }

        Ok(TransferRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            follow_redirects: self.follow_redirects,
        })
    }
}

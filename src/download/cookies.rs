// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cookie storage.
//!
//! Two stores are involved in a download. The transfer session keeps a
//! native store that it fills from `Set-Cookie` headers on its own, out of
//! our sight. The managed [`CookieJar`] is what the rest of the HTTP stack
//! reads from. After each download the bridge copies the native cookies for
//! the final URL into the managed jar so both agree.
//!
//! Parsing, expiry and domain/path matching are done by `cookie_store`,
//! the same store reqwest uses for its `cookies` feature. [`CookieJar`]
//! also implements [`NativeCookieStorage`] and reqwest's `CookieStore`, so
//! the portable session uses the same type as its native store.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use cookie::Cookie as RawCookie;
use reqwest::header::HeaderValue;
use reqwest::Url;
use tracing::trace;

use crate::locks::{resilient_read, resilient_write};
use crate::platform::NativeCookieStorage;

/// A single HTTP cookie together with the URL it was set for.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    raw: RawCookie<'static>,
    origin: Option<Url>,
}

impl Cookie {
    /// Host-only session cookie for `domain` with path `/`.
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl AsRef<str>) -> Self {
        let mut raw = RawCookie::new(name.into(), value.into());
        raw.set_path("/");
        let host = domain.as_ref().trim_start_matches('.').to_ascii_lowercase();
        Self {
            raw,
            origin: Url::parse(&format!("https://{}/", host)).ok(),
        }
    }

    /// Parse a `Set-Cookie` header value received from `url`.
    pub fn parse(header: &str, url: &Url) -> Option<Self> {
        let raw = RawCookie::parse(header.to_string()).ok()?;
        if raw.name().is_empty() {
            return None;
        }
        Some(Self {
            raw,
            origin: Some(url.clone()),
        })
    }

    fn from_store(cookie: &cookie_store::Cookie<'static>, url: &Url) -> Self {
        let raw: &RawCookie<'static> = cookie;
        Self {
            raw: raw.clone(),
            origin: Some(url.clone()),
        }
    }

    pub fn name(&self) -> &str {
        self.raw.name()
    }

    pub fn value(&self) -> &str {
        self.raw.value()
    }

    /// `Domain` attribute; `None` for host-only cookies.
    pub fn domain(&self) -> Option<&str> {
        self.raw.domain()
    }

    pub fn path(&self) -> Option<&str> {
        self.raw.path()
    }

    pub fn secure(&self) -> bool {
        self.raw.secure().unwrap_or(false)
    }

    pub fn http_only(&self) -> bool {
        self.raw.http_only().unwrap_or(false)
    }

    /// Absolute expiry from `Expires`; session cookies have none.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        let at = self.raw.expires_datetime()?;
        DateTime::from_timestamp(at.unix_timestamp(), 0)
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_set_cookie_string(&self) -> String {
        self.raw.to_string()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Thread-safe cookie store.
///
/// Cookies are keyed by (domain, path, name): storing one with an existing
/// key replaces it, so merging the same cookies repeatedly never
/// duplicates them. Storing an expired cookie removes its key.
#[derive(Default)]
pub struct CookieJar {
    store: RwLock<cookie_store::CookieStore>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cookie.
    pub fn store(&self, cookie: Cookie) {
        let Some(origin) = cookie.origin.as_ref() else {
            trace!(cookie = cookie.name(), "dropping cookie without an origin");
            return;
        };
        if let Err(e) = resilient_write(&self.store).insert_raw(&cookie.raw, origin) {
            trace!(cookie = cookie.name(), error = %e, "cookie rejected");
        }
    }

    /// Merge a batch of cookies, as received from the native store.
    pub fn merge<I>(&self, cookies: I)
    where
        I: IntoIterator<Item = Cookie>,
    {
        for cookie in cookies {
            self.store(cookie);
        }
    }

    /// Unexpired cookies that would be sent to `url`.
    pub fn cookies_for_url(&self, url: &Url) -> Vec<Cookie> {
        resilient_read(&self.store)
            .matches(url)
            .into_iter()
            .map(|c| Cookie::from_store(c, url))
            .collect()
    }

    /// `Cookie` request header value for `url`, if any cookie applies.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let store = resilient_read(&self.store);
        let pairs: Vec<String> = store
            .get_request_values(url)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.store).iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        resilient_write(&self.store).clear();
    }
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieJar").field("len", &self.len()).finish()
    }
}

impl NativeCookieStorage for CookieJar {
    fn cookies_for_url(&self, url: &Url) -> Vec<Cookie> {
        CookieJar::cookies_for_url(self, url)
    }
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let mut store = resilient_write(&self.store);
        for header in cookie_headers.filter_map(|h| h.to_str().ok()) {
            if let Err(e) = store.parse(header, url) {
                trace!(url = %url, error = %e, "ignoring Set-Cookie header");
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.cookie_header(url)
            .and_then(|header| HeaderValue::from_str(&header).ok())
    }
}

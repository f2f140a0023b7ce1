//! Provider abstraction: the three capabilities every remote media source
//! offers, and the closed set of concrete providers.
//!
//! The pipeline only talks to [`MediaProvider`]. Calls are single-shot;
//! callers wrap them in [`crate::retry::retry_with_backoff`] so the policy
//! stays in one place.

pub mod error;
pub mod gopro;
pub mod responses;
pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::{AuthFailure, ProviderError, SessionError};
pub use gopro::GoProProvider;
pub use session::SessionMaterial;

use crate::types::ProviderKind;

/// Opaque pagination cursor. Only the provider that issued it interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated request context produced by [`MediaProvider::authenticate`].
#[derive(Clone)]
pub struct AuthContext {
    pub provider_id: String,
    pub(crate) cookie_header: String,
    pub(crate) user_agent: String,
    /// Set when only the minimal credential subset authenticated.
    pub degraded: bool,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("provider_id", &self.provider_id)
            .field("cookie_header", &"<redacted>")
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// A catalog entry exactly as the provider reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMediaRecord {
    pub id: String,
    pub filename: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub size_bytes: Option<u64>,
}

/// One page of the remote catalog.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub items: Vec<RawMediaRecord>,
    pub next_cursor: Option<PageToken>,
    /// Total item count, if the provider reports it. Progress only.
    pub total_hint: Option<u64>,
}

/// Final, transient location of an item's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub requires_auth_header: bool,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Stable identifier used in state keys and destination keys.
    fn provider_id(&self) -> &str;

    async fn authenticate(&self, material: &SessionMaterial) -> Result<AuthContext, ProviderError>;

    /// Fetch one page. `cursor = None` means the first page.
    async fn list_page(
        &self,
        auth: &AuthContext,
        cursor: Option<&PageToken>,
        page_size: u32,
    ) -> Result<CatalogPage, ProviderError>;

    /// Two-step resolution of the item's download URL, exposed as one call.
    async fn resolve_download(
        &self,
        auth: &AuthContext,
        media_id: &str,
    ) -> Result<DownloadTarget, ProviderError>;
}

/// The closed set of supported providers.
#[derive(Debug)]
pub enum Provider {
    GoPro(GoProProvider),
}

impl Provider {
    /// Build the provider for `kind`. `base_url` overrides the production
    /// API endpoint.
    pub fn new(
        kind: ProviderKind,
        base_url: Option<&str>,
        request_timeout: std::time::Duration,
    ) -> Result<Self, ProviderError> {
        match kind {
            ProviderKind::GoPro => Ok(Self::GoPro(GoProProvider::new(
                base_url.unwrap_or(gopro::DEFAULT_BASE_URL),
                request_timeout,
            )?)),
        }
    }
}

#[async_trait]
impl MediaProvider for Provider {
    fn provider_id(&self) -> &str {
        match self {
            Self::GoPro(p) => p.provider_id(),
        }
    }

    async fn authenticate(&self, material: &SessionMaterial) -> Result<AuthContext, ProviderError> {
        match self {
            Self::GoPro(p) => p.authenticate(material).await,
        }
    }

    async fn list_page(
        &self,
        auth: &AuthContext,
        cursor: Option<&PageToken>,
        page_size: u32,
    ) -> Result<CatalogPage, ProviderError> {
        match self {
            Self::GoPro(p) => p.list_page(auth, cursor, page_size).await,
        }
    }

    async fn resolve_download(
        &self,
        auth: &AuthContext,
        media_id: &str,
    ) -> Result<DownloadTarget, ProviderError> {
        match self {
            Self::GoPro(p) => p.resolve_download(auth, media_id).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory provider for pipeline tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Serves pre-built pages keyed by cursor and download targets keyed by
    /// media id. Unknown cursors fail with a 503.
    #[derive(Default)]
    pub struct FakeProvider {
        pub pages: HashMap<Option<String>, CatalogPage>,
        pub targets: HashMap<String, DownloadTarget>,
        /// Cookie header values that authenticate. Empty accepts any.
        pub accepted_headers: Vec<String>,
        pub list_calls: AtomicU32,
        pub resolve_calls: AtomicU32,
        pub requested_page_sizes: Mutex<Vec<u32>>,
    }

    impl FakeProvider {
        pub fn with_page(mut self, cursor: Option<&str>, page: CatalogPage) -> Self {
            self.pages.insert(cursor.map(str::to_string), page);
            self
        }

        pub fn with_target(mut self, media_id: &str, url: &str) -> Self {
            self.targets.insert(
                media_id.to_string(),
                DownloadTarget {
                    url: url.to_string(),
                    expires_at: None,
                    requires_auth_header: false,
                },
            );
            self
        }
    }

    pub fn raw(id: &str, filename: &str, size: Option<u64>) -> RawMediaRecord {
        RawMediaRecord {
            id: id.to_string(),
            filename: Some(filename.to_string()),
            captured_at: None,
            duration_ms: Some(1500),
            size_bytes: size,
        }
    }

    pub fn page(items: Vec<RawMediaRecord>, next: Option<&str>) -> CatalogPage {
        CatalogPage {
            items,
            next_cursor: next.map(PageToken::new),
            total_hint: None,
        }
    }

    #[async_trait]
    impl MediaProvider for FakeProvider {
        fn provider_id(&self) -> &str {
            "fake"
        }

        async fn authenticate(
            &self,
            material: &SessionMaterial,
        ) -> Result<AuthContext, ProviderError> {
            Ok(AuthContext {
                provider_id: "fake".to_string(),
                cookie_header: material.cookie_header(),
                user_agent: material.user_agent().to_string(),
                degraded: false,
            })
        }

        async fn list_page(
            &self,
            auth: &AuthContext,
            cursor: Option<&PageToken>,
            page_size: u32,
        ) -> Result<CatalogPage, ProviderError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut sizes) = self.requested_page_sizes.lock() {
                sizes.push(page_size);
            }
            if !self.accepted_headers.is_empty()
                && !self.accepted_headers.contains(&auth.cookie_header)
            {
                return Err(ProviderError::from_status(401, "fake://list"));
            }
            self.pages
                .get(&cursor.map(|c| c.as_str().to_string()))
                .cloned()
                .ok_or_else(|| ProviderError::from_status(503, "fake://list"))
        }

        async fn resolve_download(
            &self,
            _auth: &AuthContext,
            media_id: &str,
        ) -> Result<DownloadTarget, ProviderError> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.targets
                .get(media_id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(media_id.to_string()))
        }
    }
}

//! Catalog lister: drives provider pagination and yields candidate items
//! lazily, so transfers can start as soon as the first page arrives.
//!
//! The produced stream is forward-only. It ends when the provider stops
//! returning a cursor, or with a single [`ListingError`] when a page fetch
//! exhausts its retries. Items already yielded stay valid in that case.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use thiserror::Error;

use crate::provider::{AuthContext, CatalogPage, MediaProvider, PageToken, ProviderError, RawMediaRecord};
use crate::retry::{self, RetryAction, RetryError, RetryPolicy};

/// Filename prefixes written by the cameras themselves.
const CAMERA_PREFIXES: [&str; 2] = ["GH", "GO"];

/// Where an asset came from, judged by its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    CameraOrigin,
    OtherOrigin,
}

impl SourceType {
    /// `GH*` and `GO*` are camera-origin. Everything else, including phone
    /// uploads (`PXL_*`) and empty names, is not.
    pub fn classify(filename: &str) -> Self {
        if CAMERA_PREFIXES.iter().any(|p| filename.starts_with(p)) {
            Self::CameraOrigin
        } else {
            Self::OtherOrigin
        }
    }
}

/// A candidate asset, normalized from a [`RawMediaRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub filename: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub size_bytes: Option<u64>,
    pub source_type: SourceType,
}

impl MediaItem {
    /// Normalize a raw record. Returns `None` for records that are not
    /// camera-origin content.
    pub fn from_raw(raw: RawMediaRecord) -> Option<Self> {
        let filename = raw.filename.filter(|f| !f.is_empty())?;
        let source_type = SourceType::classify(&filename);
        if source_type != SourceType::CameraOrigin {
            return None;
        }
        Some(Self {
            id: raw.id,
            filename,
            captured_at: raw.captured_at,
            duration_seconds: raw.duration_ms.map(|ms| ms / 1000),
            size_bytes: raw.size_bytes,
            source_type,
        })
    }
}

/// Optional narrowing on top of the mandatory filename rule.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub captured_after: Option<DateTime<Utc>>,
    pub captured_before: Option<DateTime<Utc>>,
    /// Stop after this many candidates.
    pub max_items: Option<usize>,
}

impl CatalogFilter {
    /// Items without a capture time pass the date bounds.
    fn admits(&self, item: &MediaItem) -> bool {
        let Some(captured) = item.captured_at else {
            return true;
        };
        if self.captured_after.is_some_and(|after| captured < after) {
            return false;
        }
        if self.captured_before.is_some_and(|before| captured > before) {
            return false;
        }
        true
    }
}

/// A page fetch failed for good. Carries where the listing stood so an
/// operator can resume with [`CatalogLister::list_from`].
#[derive(Debug, Error)]
#[error("Listing failed at {} after {yielded} items: {source}", cursor_label(.cursor.as_ref()))]
pub struct ListingError {
    pub cursor: Option<PageToken>,
    pub yielded: usize,
    #[source]
    pub source: RetryError<ProviderError>,
}

fn cursor_label(cursor: Option<&PageToken>) -> String {
    match cursor {
        Some(c) => format!("cursor '{}'", c),
        None => "first page".to_string(),
    }
}

type HintCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub struct CatalogLister<P: ?Sized> {
    provider: Arc<P>,
    retry: RetryPolicy,
    page_size: u32,
    on_total_hint: Option<HintCallback>,
}

struct ListState {
    cursor: Option<PageToken>,
    buffered: VecDeque<MediaItem>,
    yielded: usize,
    pages: usize,
    dropped: usize,
    done: bool,
}

impl<P: MediaProvider + ?Sized> CatalogLister<P> {
    pub fn new(provider: Arc<P>, retry: RetryPolicy, page_size: u32) -> Self {
        Self {
            provider,
            retry,
            page_size: page_size.max(1),
            on_total_hint: None,
        }
    }

    /// Called with the provider's total-count hint whenever a page reports one.
    pub fn with_total_hint_callback(mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_total_hint = Some(Arc::new(callback));
        self
    }

    /// Lazily list the whole catalog from the first page.
    pub fn list_all<'a>(
        &'a self,
        auth: &'a AuthContext,
        filter: &'a CatalogFilter,
    ) -> impl Stream<Item = Result<MediaItem, ListingError>> + 'a {
        self.list_from(auth, filter, None)
    }

    /// Lazily list starting at `start` (the first page when `None`).
    pub fn list_from<'a>(
        &'a self,
        auth: &'a AuthContext,
        filter: &'a CatalogFilter,
        start: Option<PageToken>,
    ) -> impl Stream<Item = Result<MediaItem, ListingError>> + 'a {
        let state = ListState {
            cursor: start,
            buffered: VecDeque::new(),
            yielded: 0,
            pages: 0,
            dropped: 0,
            done: false,
        };

        stream::unfold(state, move |mut st| async move {
            loop {
                if filter.max_items.is_some_and(|max| st.yielded >= max) {
                    tracing::debug!(yielded = st.yielded, "Reached listing cap");
                    return None;
                }
                if let Some(item) = st.buffered.pop_front() {
                    st.yielded += 1;
                    return Some((Ok(item), st));
                }
                if st.done {
                    tracing::debug!(
                        pages = st.pages,
                        yielded = st.yielded,
                        dropped = st.dropped,
                        "Catalog listing finished"
                    );
                    return None;
                }

                let cursor = st.cursor.clone();
                match self.fetch_page(auth, cursor.as_ref()).await {
                    Ok(page) => {
                        st.pages += 1;
                        if let (Some(total), Some(callback)) = (page.total_hint, &self.on_total_hint) {
                            callback(total);
                        }
                        st.done = page.next_cursor.is_none();
                        st.cursor = page.next_cursor;
                        for raw in page.items {
                            match MediaItem::from_raw(raw) {
                                Some(item) if filter.admits(&item) => st.buffered.push_back(item),
                                Some(item) => {
                                    tracing::debug!(media_id = %item.id, "Outside capture window, skipping");
                                }
                                None => st.dropped += 1,
                            }
                        }
                    }
                    Err(source) => {
                        st.done = true;
                        let err = ListingError {
                            cursor,
                            yielded: st.yielded,
                            source,
                        };
                        return Some((Err(err), st));
                    }
                }
            }
        })
    }

    async fn fetch_page(
        &self,
        auth: &AuthContext,
        cursor: Option<&PageToken>,
    ) -> Result<CatalogPage, RetryError<ProviderError>> {
        retry::retry_with_backoff(
            &self.retry,
            "list page",
            |e: &ProviderError| RetryAction::from_retryable(e.is_retryable()),
            || self.provider.list_page(auth, cursor, self.page_size),
        )
        .await
    }
}

//! Paginated entity fetchers.
//!
//! A fetcher drives one full offset-paginated sequence through an
//! [`ApiClient`] and folds every item of every page into metric buckets.
//!
//! ```text
//! PageCursor{0,100} ──GET──▶ page 0 ──fold──▶ buckets
//!        │                     │
//!        │         meta.pagination.next
//!        ▼                     ▼
//! PageCursor{100,100} ─GET─▶ page 1 ──fold──▶ buckets
//!        ⋮
//! next absent / offset ≥ last / empty page / next not advancing ─▶ done
//! ```
//!
//! Items are decoded one by one; an item with an unexpected shape is logged
//! and skipped. A page that cannot be decoded at all fails the sequence.

mod jobs;
mod storage;

use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ApiClient, endpoint_url};
use crate::error::{ErrorKind, FetchError};
use crate::instrument::Instrumentation;
use crate::model::{Page, Pagination};

pub use jobs::{JOBS_ENDPOINT, JobBuckets, JobMetrics, JobsFetcher};
pub use storage::{STORAGE_ENDPOINT, StorageFetcher, StorageMetrics};

/// Largest page the API serves in one call.
pub const PAGE_LIMIT: u64 = 100;

/// Hard stop for a single sequence.
pub const MAX_PAGES: usize = 10_000;

/// Offset/limit window of the next unread page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u64,
    pub limit: u64,
}

impl PageCursor {
    pub fn first() -> Self {
        Self {
            offset: 0,
            limit: PAGE_LIMIT,
        }
    }

    fn apply(&self, url: &mut Url) {
        url.query_pairs_mut()
            .append_pair("page[limit]", &self.limit.to_string())
            .append_pair("page[offset]", &self.offset.to_string());
    }

    /// Cursor for the page after this one, or `None` at end of sequence.
    ///
    /// `received` is the raw item count of the current page.
    pub fn next_from(&self, pagination: Option<&Pagination>, received: usize) -> Option<Self> {
        let pagination = pagination?;
        if received == 0 {
            return None;
        }
        let next = pagination.next?;
        let current = pagination.offset.unwrap_or(self.offset);
        if let Some(last) = pagination.last {
            if current >= last {
                return None;
            }
        }
        if next <= self.offset {
            warn!(
                offset = self.offset,
                next, "pagination cursor does not advance, ending sequence"
            );
            return None;
        }
        Some(Self {
            offset: next,
            limit: self.limit,
        })
    }
}

/// Decoded items of one page plus the cursor for the following page.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Items dropped because their shape was unexpected.
    pub skipped: usize,
    pub next: Option<PageCursor>,
}

/// Result of a full sequence.
#[derive(Debug, Clone, Default)]
pub struct Folded<M> {
    pub metrics: M,
    pub items: usize,
    pub skipped: usize,
    pub pages: usize,
}

/// One paginated endpoint and how its items fold into metrics.
pub trait PagedSource: Send + Sync {
    type Item: DeserializeOwned + Send;
    type Metrics: Default + Send;

    /// Path below the base URL.
    const ENDPOINT: &'static str;
    /// Operation reported for a full sequence.
    const OPERATION: &'static str;
    /// Operation reported for each page, if pages are instrumented.
    const PAGE_OPERATION: Option<&'static str> = None;

    /// Extra query parameters sent with every page.
    fn query(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn fold(&self, metrics: &mut Self::Metrics, item: Self::Item);

    fn instrumentation(&self) -> &Instrumentation;
}

/// Fetches and decodes one page.
pub async fn fetch_page<C, S>(
    cancel: &CancellationToken,
    client: &C,
    source: &S,
    cursor: PageCursor,
) -> Result<Batch<S::Item>, FetchError>
where
    C: ApiClient,
    S: PagedSource,
{
    let mut span = S::PAGE_OPERATION.map(|op| source.instrumentation().span(op));
    if let Some(span) = span.as_mut() {
        span.attr("endpoint", S::ENDPOINT);
        span.attr("offset", cursor.offset);
    }

    let result = load_page(cancel, client, source, cursor).await;

    if let Some(span) = span.as_mut() {
        match &result {
            Ok(batch) => {
                span.attr("items", batch.items.len());
                span.attr("status", "ok");
            }
            Err(e) => {
                span.attr("status", status_label(e));
                span.record_error(e);
            }
        }
    }
    result
}

async fn load_page<C, S>(
    cancel: &CancellationToken,
    client: &C,
    source: &S,
    cursor: PageCursor,
) -> Result<Batch<S::Item>, FetchError>
where
    C: ApiClient,
    S: PagedSource,
{
    let mut url = endpoint_url(client.base_url(), S::ENDPOINT)?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in source.query() {
            pairs.append_pair(key, &value);
        }
    }
    cursor.apply(&mut url);

    let page: Page<serde_json::Value> = client.fetch_data(cancel, url).await?;
    let received = page.data.len();
    let pagination = page.meta.as_ref().and_then(|m| m.pagination.as_ref());
    let next = cursor.next_from(pagination, received);

    let mut items = Vec::with_capacity(received);
    let mut skipped = 0;
    for raw in page.data {
        match serde_json::from_value::<S::Item>(raw) {
            Ok(item) => items.push(item),
            Err(e) => {
                skipped += 1;
                warn!(
                    endpoint = S::ENDPOINT,
                    offset = cursor.offset,
                    error = %e,
                    "skipping item with unexpected shape"
                );
            }
        }
    }

    debug!(
        endpoint = S::ENDPOINT,
        offset = cursor.offset,
        items = items.len(),
        skipped,
        has_next = next.is_some(),
        "fetched page"
    );
    Ok(Batch {
        items,
        skipped,
        next,
    })
}

/// Drives the whole sequence, folding every item.
///
/// Cancellation discards everything folded so far.
pub async fn fetch_all<C, S>(
    cancel: &CancellationToken,
    client: &C,
    source: &S,
) -> Result<Folded<S::Metrics>, FetchError>
where
    C: ApiClient,
    S: PagedSource,
{
    let mut span = source.instrumentation().span(S::OPERATION);
    span.attr("endpoint", S::ENDPOINT);

    let result = drive(cancel, client, source).await;

    match &result {
        Ok(folded) => {
            span.attr("items", folded.items);
            span.attr("pages", folded.pages);
            span.attr("status", "ok");
        }
        Err(e) => {
            span.attr("status", status_label(e));
            span.record_error(e);
        }
    }
    result
}

async fn drive<C, S>(
    cancel: &CancellationToken,
    client: &C,
    source: &S,
) -> Result<Folded<S::Metrics>, FetchError>
where
    C: ApiClient,
    S: PagedSource,
{
    let mut folded = Folded::<S::Metrics>::default();
    let mut cursor = Some(PageCursor::first());

    while let Some(current) = cursor {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if folded.pages >= MAX_PAGES {
            warn!(
                endpoint = S::ENDPOINT,
                pages = folded.pages,
                "page cap reached, ending sequence"
            );
            break;
        }

        let batch = fetch_page(cancel, client, source, current).await?;
        folded.pages += 1;
        folded.skipped += batch.skipped;
        folded.items += batch.items.len();
        for item in batch.items {
            source.fold(&mut folded.metrics, item);
        }
        cursor = batch.next;
    }

    Ok(folded)
}

fn status_label(e: &FetchError) -> &'static str {
    match e.kind() {
        ErrorKind::Cancelled => "cancelled",
        _ => "error",
    }
}

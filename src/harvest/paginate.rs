//! Offset pagination over count-then-page upstream APIs.

use std::collections::HashSet;

use async_stream::stream;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::model::{HarvestWindow, HarvestedRecord};
use crate::traits::{HarvestError, RecordStream};

/// An upstream that reports how many records a window holds and serves them
/// in `LIMIT`/`OFFSET` pages.
#[async_trait]
pub trait PagedSource: Send + Sync {
    fn page_size(&self) -> usize;

    /// Number of records the upstream holds for `window`; bounds the paging.
    async fn get_total(&self, window: &HarvestWindow) -> Result<usize, HarvestError>;

    async fn get_page(
        &self,
        window: &HarvestWindow,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HarvestedRecord>, HarvestError>;
}

/// Streams every page of `source` for `window`.
///
/// Any failed page ends the stream with that error. A provider id repeated
/// across pages (rows shifting between requests) is yielded once.
pub fn paginate<P>(source: &P, window: HarvestWindow) -> RecordStream<'_>
where
    P: PagedSource + ?Sized,
{
    Box::pin(stream! {
        let total = match source.get_total(&window).await {
            Ok(total) => total,
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        let limit = source.page_size().max(1);
        info!(total, limit, "Paging upstream window");

        let mut seen = HashSet::new();
        let mut offset = 0;
        while offset < total {
            let page = match source.get_page(&window, limit, offset).await {
                Ok(page) => page,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            debug!(offset, received = page.len(), "Fetched page");

            // The window shrank upstream since the count was taken.
            if page.is_empty() {
                break;
            }

            for record in page {
                if seen.insert(record.provider_id.clone()) {
                    yield Ok(record);
                }
            }
            offset = offset.saturating_add(limit);
        }
    })
}

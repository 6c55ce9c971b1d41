//! Paginated, retrying, optionally parallel page download.

use std::sync::Arc;

use biosync_core::RawRecord;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::warehouse::{PageSource, WarehousePage, WarehouseQuery};
use crate::{with_retries, FetchError, RetryPolicy};

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub page_size: u32,
    pub retry: RetryPolicy,
    /// Concurrent page downloads in parallel mode; `None` means available parallelism.
    pub workers: Option<usize>,
    /// Above this reported total, pages after the first are refused.
    pub max_total: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            retry: RetryPolicy::default(),
            workers: None,
            max_total: 1_000_000,
        }
    }
}

#[derive(Debug)]
pub enum PageOutcome {
    Fetched(WarehousePage),
    /// Retries exhausted; the page's records are lost for this run.
    Failed,
}

#[derive(Debug, Default)]
pub struct FetchedRange {
    pub records: Vec<RawRecord>,
    pub pages_fetched: u32,
    pub failed_pages: u32,
    /// Estimated records lost: one full page per failed page.
    pub failed_count: u64,
}

impl FetchedRange {
    fn absorb(&mut self, outcome: PageOutcome, page_size: u32) {
        match outcome {
            PageOutcome::Fetched(page) => {
                self.pages_fetched += 1;
                self.records.extend(page.records);
            }
            PageOutcome::Failed => self.record_failure(page_size),
        }
    }

    fn record_failure(&mut self, page_size: u32) {
        self.failed_pages += 1;
        self.failed_count += u64::from(page_size);
    }
}

#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn PageSource>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(source: Arc<dyn PageSource>, settings: FetchSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    fn workers(&self) -> usize {
        self.settings
            .workers
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1)
    }

    /// Fetch one page. Transport failures surviving the retry budget become
    /// [`PageOutcome::Failed`]; only query-level errors are returned as `Err`.
    pub async fn fetch_page(&self, query: &WarehouseQuery, page: u32) -> Result<PageOutcome, FetchError> {
        let page_size = self.settings.page_size;
        let what = format!("page {page}");
        let result = with_retries(&self.settings.retry, &what, || {
            self.source.fetch_page(query, page, page_size)
        })
        .await;

        match result {
            Ok(fetched) => {
                if page > 1 && fetched.total > self.settings.max_total {
                    return Err(FetchError::TooManyResults {
                        total: fetched.total,
                        limit: self.settings.max_total,
                    });
                }
                debug!(page, records = fetched.records.len(), "page fetched");
                Ok(PageOutcome::Fetched(fetched))
            }
            Err(err) if err.is_query_error() => Err(err),
            Err(err) => {
                warn!(page, error = %err, "page lost after exhausting retries");
                Ok(PageOutcome::Failed)
            }
        }
    }

    /// Fetch pages `start..=end` and concatenate their records in arrival order.
    pub async fn fetch_range(
        &self,
        query: &WarehouseQuery,
        start: u32,
        end: u32,
        parallel: bool,
    ) -> Result<FetchedRange, FetchError> {
        let mut range = FetchedRange::default();
        if start > end {
            return Ok(range);
        }
        let page_size = self.settings.page_size;

        if !parallel {
            for page in start..=end {
                let outcome = self.fetch_page(query, page).await?;
                range.absorb(outcome, page_size);
            }
            return Ok(range);
        }

        let limit = Arc::new(Semaphore::new(self.workers()));
        let mut tasks = JoinSet::new();
        for page in start..=end {
            let fetcher = self.clone();
            let query = query.clone();
            let limit = Arc::clone(&limit);
            tasks.spawn(async move {
                let Ok(_permit) = limit.acquire_owned().await else {
                    return Ok(PageOutcome::Failed);
                };
                fetcher.fetch_page(&query, page).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => range.absorb(outcome?, page_size),
                Err(err) => {
                    warn!(error = %err, "page task aborted");
                    range.record_failure(page_size);
                }
            }
        }
        Ok(range)
    }

    /// Number of pages the query spans, from the count endpoint.
    pub async fn last_page(&self, query: &WarehouseQuery) -> Result<u32, FetchError> {
        let total = with_retries(&self.settings.retry, "record count", || self.source.fetch_total(query)).await?;
        Ok(pages_for(total, self.settings.page_size))
    }
}

pub fn pages_for(total: u64, page_size: u32) -> u32 {
    let page_size = u64::from(page_size.max(1));
    u32::try_from(total.div_ceil(page_size)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use biosync_core::{fields, point};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves `total` synthetic records; pages listed in `failures` fail that many times first.
    struct ScriptedSource {
        total: u64,
        failures: Mutex<HashMap<u32, u32>>,
        malformed_page: Option<u32>,
    }

    impl ScriptedSource {
        fn new(total: u64) -> Self {
            Self {
                total,
                failures: Mutex::new(HashMap::new()),
                malformed_page: None,
            }
        }

        fn failing(self, page: u32, times: u32) -> Self {
            self.failures.lock().unwrap().insert(page, times);
            self
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, _query: &WarehouseQuery, page: u32, page_size: u32) -> Result<WarehousePage, FetchError> {
            if self.malformed_page == Some(page) {
                return Err(FetchError::Malformed {
                    url: "scripted".into(),
                    message: "missing features".into(),
                });
            }
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&page) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(FetchError::HttpStatus {
                            status: 502,
                            url: "scripted".into(),
                        });
                    }
                }
            }
            let first = u64::from(page - 1) * u64::from(page_size);
            let last = (first + u64::from(page_size)).min(self.total);
            let records = (first..last)
                .map(|i| {
                    RawRecord::new()
                        .with_field(fields::NATURAL_KEY, format!("http://tun.fi/JX.{i}#1"))
                        .with_geometry(point(i as f64, 0.0))
                })
                .collect();
            Ok(WarehousePage {
                page,
                total: self.total,
                last_page: Some(pages_for(self.total, page_size)),
                records,
            })
        }

        async fn fetch_total(&self, _query: &WarehouseQuery) -> Result<u64, FetchError> {
            Ok(self.total)
        }
    }

    fn settings(page_size: u32, max_attempts: u32) -> FetchSettings {
        FetchSettings {
            page_size,
            retry: RetryPolicy {
                max_attempts,
                delay: Duration::from_millis(1),
            },
            workers: Some(4),
            max_total: 1_000_000,
        }
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(pages_for(0, 10), 0);
        assert_eq!(pages_for(10, 10), 1);
        assert_eq!(pages_for(225_001, 10_000), 23);
    }

    #[tokio::test]
    async fn parallel_range_concatenates_all_pages() {
        let fetcher = Fetcher::new(Arc::new(ScriptedSource::new(95).failing(3, 2)), settings(10, 5));
        let query = WarehouseQuery::new();
        let pages = fetcher.last_page(&query).await.expect("count");
        assert_eq!(pages, 10);

        let range = fetcher.fetch_range(&query, 1, pages, true).await.expect("range");
        assert_eq!(range.failed_pages, 0);
        assert_eq!(range.pages_fetched, 10);
        assert_eq!(range.records.len(), 95);
    }

    #[tokio::test]
    async fn exhausted_page_counts_a_full_page_as_failed() {
        let fetcher = Fetcher::new(Arc::new(ScriptedSource::new(30).failing(2, 10)), settings(10, 3));
        let range = fetcher
            .fetch_range(&WarehouseQuery::new(), 1, 3, false)
            .await
            .expect("range");
        assert_eq!(range.failed_pages, 1);
        assert_eq!(range.failed_count, 10);
        assert_eq!(range.records.len(), 20);
    }

    #[tokio::test]
    async fn query_errors_surface_from_parallel_range() {
        let mut source = ScriptedSource::new(50);
        source.malformed_page = Some(4);
        let fetcher = Fetcher::new(Arc::new(source), settings(10, 3));
        let err = fetcher
            .fetch_range(&WarehouseQuery::new(), 1, 5, true)
            .await
            .unwrap_err();
        assert!(err.is_query_error());
    }

    #[tokio::test]
    async fn oversized_queries_fail_after_the_first_page() {
        let mut config = settings(10, 1);
        config.max_total = 15;
        let fetcher = Fetcher::new(Arc::new(ScriptedSource::new(30)), config);
        let query = WarehouseQuery::new();
        assert!(matches!(
            fetcher.fetch_page(&query, 1).await,
            Ok(PageOutcome::Fetched(_))
        ));
        assert!(matches!(
            fetcher.fetch_page(&query, 2).await,
            Err(FetchError::TooManyResults { total: 30, limit: 15 })
        ));
    }
}

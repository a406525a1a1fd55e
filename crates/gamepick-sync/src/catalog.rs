//! Incremental catalog listing into the pending table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gamepick_adapters::CatalogSource;
use gamepick_core::{CatalogCursor, JobState, StateKey};
use gamepick_storage::CatalogStore;
use tracing::{debug, error, info, warn};

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Init,
    Paging,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogSyncReport {
    pub pages: u32,
    pub discovered: u64,
    pub newly_pending: u64,
    /// Every page was consumed and the watermark was advanced.
    pub completed: bool,
}

pub struct CatalogSync {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn CatalogSource>,
    cursor: CatalogCursor,
    phase: SyncPhase,
    started_at: DateTime<Utc>,
}

impl CatalogSync {
    pub fn new(store: Arc<dyn CatalogStore>, source: Arc<dyn CatalogSource>) -> Self {
        Self {
            store,
            source,
            cursor: CatalogCursor::default(),
            phase: SyncPhase::Init,
            started_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn cursor(&self) -> CatalogCursor {
        self.cursor
    }

    /// Loads the persisted watermark. Fails fast when the upstream is not
    /// configured or the state cannot be read.
    pub async fn init(&mut self) -> Result<(), SyncError> {
        if !self.source.is_configured() {
            return Err(SyncError::MissingConfig("STEAM_KEY"));
        }
        let state = self
            .store
            .load_job_state(StateKey::CatalogSync)
            .await
            .map_err(|source| SyncError::StateLoad {
                key: StateKey::CatalogSync.as_str(),
                source,
            })?;

        self.started_at = Utc::now();
        // Only the watermark survives between passes; paging restarts from the top.
        self.cursor = CatalogCursor {
            last_modified_watermark: state.and_then(|s| s.last_success_at),
            last_seen_id: None,
        };
        self.phase = SyncPhase::Paging;
        info!(watermark = ?self.cursor.last_modified_watermark, "catalog sync initialised");
        Ok(())
    }

    /// Pages through the listing until it reports no more results. A failed
    /// page ends the pass early without touching the stored watermark.
    pub async fn run(&mut self) -> Result<CatalogSyncReport, SyncError> {
        if self.phase == SyncPhase::Init {
            self.init().await?;
        }
        let mut report = CatalogSyncReport::default();

        loop {
            let page = match self.source.fetch_page(&self.cursor).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, cursor = ?self.cursor.last_seen_id, "catalog page failed, ending pass early");
                    break;
                }
            };
            report.pages += 1;
            report.discovered += page.ids.len() as u64;

            match self.store.upsert_pending(&page.ids).await {
                Ok(added) => report.newly_pending += added,
                Err(err) => {
                    error!(error = %err, "failed to record pending ids, ending pass early");
                    break;
                }
            }
            debug!(page = report.pages, ids = page.ids.len(), has_more = page.has_more, "catalog page stored");

            if !page.has_more {
                report.completed = true;
                break;
            }
            match page.last_id.or_else(|| page.ids.iter().copied().max()) {
                Some(last) if Some(last) != self.cursor.last_seen_id => {
                    self.cursor.last_seen_id = Some(last);
                }
                _ => {
                    warn!(cursor = ?self.cursor.last_seen_id, "catalog cursor did not advance, ending pass early");
                    break;
                }
            }
        }

        self.phase = SyncPhase::Done;
        if report.completed {
            let state = JobState::succeeded(StateKey::CatalogSync, self.started_at);
            if let Err(err) = self.store.save_job_state(&state).await {
                error!(error = %err, "failed to persist catalog watermark");
                report.completed = false;
            }
        }
        info!(
            pages = report.pages,
            discovered = report.discovered,
            newly_pending = report.newly_pending,
            completed = report.completed,
            "catalog sync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gamepick_adapters::{CatalogPage, SourceError};
    use gamepick_storage::MemoryStore;
    use std::sync::Mutex;

    struct PagedCatalog {
        pages: Vec<Result<CatalogPage, u16>>,
        seen: Mutex<Vec<CatalogCursor>>,
        configured: bool,
    }

    impl PagedCatalog {
        fn new(pages: Vec<Result<CatalogPage, u16>>) -> Self {
            Self {
                pages,
                seen: Mutex::new(Vec::new()),
                configured: true,
            }
        }
    }

    #[async_trait]
    impl CatalogSource for PagedCatalog {
        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn fetch_page(&self, cursor: &CatalogCursor) -> Result<CatalogPage, SourceError> {
            let mut seen = self.seen.lock().expect("lock");
            let index = seen.len();
            seen.push(*cursor);
            match self.pages.get(index) {
                Some(Ok(page)) => Ok(page.clone()),
                Some(Err(code)) => Err(SourceError::Status(*code)),
                None => Ok(CatalogPage::default()),
            }
        }
    }

    fn page(ids: &[i64], has_more: bool) -> CatalogPage {
        CatalogPage {
            ids: ids.to_vec(),
            has_more,
            last_id: ids.last().copied(),
        }
    }

    #[tokio::test]
    async fn full_pass_records_pending_and_advances_watermark() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(PagedCatalog::new(vec![
            Ok(page(&[10, 20], true)),
            Ok(page(&[20, 30], false)),
        ]));
        let mut sync = CatalogSync::new(store.clone(), source.clone());

        let report = sync.run().await.expect("sync");
        assert!(report.completed);
        assert_eq!(report.pages, 2);
        assert_eq!(report.newly_pending, 3);
        assert_eq!(store.pending().await, vec![10, 20, 30]);
        assert_eq!(sync.phase(), SyncPhase::Done);

        let cursors = source.seen.lock().expect("lock").clone();
        assert_eq!(cursors[0].last_seen_id, None);
        assert_eq!(cursors[1].last_seen_id, Some(20));

        let state = store
            .load_job_state(StateKey::CatalogSync)
            .await
            .expect("load")
            .expect("state written");
        assert!(state.last_success_at.is_some());
    }

    #[tokio::test]
    async fn failed_page_keeps_previous_watermark() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(PagedCatalog::new(vec![Ok(page(&[1, 2], true)), Err(500)]));
        let mut sync = CatalogSync::new(store.clone(), source);

        let report = sync.run().await.expect("sync");
        assert!(!report.completed);
        assert_eq!(store.pending().await, vec![1, 2]);
        assert!(store
            .load_job_state(StateKey::CatalogSync)
            .await
            .expect("load")
            .is_none());
    }

    #[tokio::test]
    async fn next_pass_starts_from_stored_watermark() {
        let store = Arc::new(MemoryStore::new());
        let watermark = Utc::now() - chrono::Duration::hours(1);
        store
            .save_job_state(&JobState::succeeded(StateKey::CatalogSync, watermark))
            .await
            .expect("seed state");
        let source = Arc::new(PagedCatalog::new(vec![Ok(page(&[], false))]));
        let mut sync = CatalogSync::new(store, source.clone());

        sync.init().await.expect("init");
        assert_eq!(sync.cursor().last_modified_watermark, Some(watermark));
        sync.run().await.expect("sync");
        let cursors = source.seen.lock().expect("lock").clone();
        assert_eq!(cursors[0].last_modified_watermark, Some(watermark));
    }

    #[tokio::test]
    async fn paging_position_is_not_carried_into_next_pass() {
        let store = Arc::new(MemoryStore::new());
        let first = Arc::new(PagedCatalog::new(vec![
            Ok(page(&[5, 6], true)),
            Ok(page(&[], false)),
        ]));
        let mut sync = CatalogSync::new(store.clone(), first);
        sync.run().await.expect("first pass");
        assert_eq!(sync.cursor().last_seen_id, Some(6));

        let second = Arc::new(PagedCatalog::new(vec![Ok(page(&[], false))]));
        let mut next = CatalogSync::new(store.clone(), second);
        next.init().await.expect("init");
        assert_eq!(next.cursor().last_seen_id, None);
        assert!(next.cursor().last_modified_watermark.is_some());
    }

    #[tokio::test]
    async fn unconfigured_source_fails_init() {
        let store = Arc::new(MemoryStore::new());
        let mut source = PagedCatalog::new(vec![]);
        source.configured = false;
        let mut sync = CatalogSync::new(store, Arc::new(source));

        let err = sync.init().await.expect_err("init must fail");
        assert!(matches!(err, SyncError::MissingConfig("STEAM_KEY")));
        assert_eq!(sync.phase(), SyncPhase::Init);
    }

    #[tokio::test]
    async fn unreadable_state_fails_init() {
        let store = Arc::new(MemoryStore::new());
        store.fail_state_loads().await;
        let mut sync = CatalogSync::new(store, Arc::new(PagedCatalog::new(vec![])));

        let err = sync.run().await.expect_err("run must fail");
        assert!(matches!(err, SyncError::StateLoad { .. }));
    }
}

/*!
Background sync of registered users' history
*/
use std::sync::Arc;
use std::time::Duration;

use crate::lastfm::HistorySource;
use crate::models::ScanWatermark;
use crate::scanner::{IncrementalScanner, ScanSettings, StopReason};
use crate::store::Store;
use crate::{utils, Result, LOG};

#[derive(Debug)]
pub struct SyncReport {
    pub pages: u32,
    pub stop: StopReason,
    // records committed by this sync
    pub added: usize,
    // watermark in effect after this sync
    pub watermark: i64,
}

#[derive(Debug, Default)]
pub struct TickSummary {
    pub users: usize,
    pub synced: usize,
    pub failed: usize,
    pub added: usize,
}

/// Scan one user from their stored watermark and commit whatever is new.
/// Nothing is written unless the scan is complete and found records.
pub async fn sync_user(
    store: &Store,
    source: &dyn HistorySource,
    username: &str,
    settings: ScanSettings,
) -> Result<SyncReport> {
    let watermark = store.get_watermark(username)?;
    let outcome = IncrementalScanner::new(
        source,
        username,
        watermark.max_record_timestamp,
        settings,
    )
    .scan()
    .await?;

    let mut report = SyncReport {
        pages: outcome.pages,
        stop: outcome.stop,
        added: 0,
        watermark: watermark.max_record_timestamp,
    };
    if !outcome.stop.is_complete() {
        slog::warn!(
            LOG, "incomplete scan, not committing";
            "user" => username,
            "stop" => format!("{:?}", outcome.stop),
            "pages" => outcome.pages,
            "records" => outcome.records.len(),
        );
        return Ok(report);
    }
    if outcome.records.is_empty() {
        return Ok(report);
    }

    let scan = ScanWatermark::from_batch(username, &outcome.records, utils::now_seconds());
    report.added = store.commit_scan(username, &outcome.records, &scan)?;
    report.watermark = store.get_watermark(username)?.max_record_timestamp;
    Ok(report)
}

/// Sync every registered user once, one after the other. A failing user
/// is logged and skipped. Only failing to read the registry fails the tick.
pub async fn sync_tick(
    store: &Store,
    source: &dyn HistorySource,
    settings: ScanSettings,
    log: &slog::Logger,
) -> Result<TickSummary> {
    let info = store.get_system_info()?;
    let mut summary = TickSummary {
        users: info.users.len(),
        ..TickSummary::default()
    };
    for username in &info.users {
        slog::debug!(log, "syncing user"; "user" => username);
        match sync_user(store, source, username, settings).await {
            Ok(report) => {
                summary.synced += 1;
                summary.added += report.added;
                slog::info!(
                    log, "synced user";
                    "user" => username,
                    "pages" => report.pages,
                    "stop" => format!("{:?}", report.stop),
                    "added" => report.added,
                    "watermark" => utils::display_ts(report.watermark),
                );
            }
            Err(e) => {
                summary.failed += 1;
                slog::error!(
                    log, "error syncing user, skipping until next tick";
                    "user" => username,
                    "transient" => e.is_transient(),
                    "error" => e.to_string(),
                );
            }
        }
    }
    Ok(summary)
}

pub async fn background_sync_poll(
    store: Store,
    source: Arc<dyn HistorySource>,
    settings: ScanSettings,
    delay: Duration,
) {
    loop {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let log = LOG.new(slog::o!("run_id" => run_id));
        match sync_tick(&store, source.as_ref(), settings, &log).await {
            Ok(summary) => slog::info!(
                log, "sync tick complete";
                "users" => summary.users,
                "synced" => summary.synced,
                "failed" => summary.failed,
                "added" => summary.added,
            ),
            Err(e) => slog::error!(log, "error loading users, skipping tick {}", e),
        }
        slog::debug!(log, "sleeping {:?}", delay);
        async_std::task::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lastfm::testing::ScriptedHistory;
    use crate::lastfm::HistoryPage;
    use crate::models::record;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Commits a newer play to the store the first time a page is
    /// fetched, like a second sync finishing while this one scans.
    struct RacingHistory {
        inner: ScriptedHistory,
        store: Store,
        raced: AtomicBool,
    }

    #[async_trait::async_trait]
    impl HistorySource for RacingHistory {
        async fn fetch_page(&self, username: &str, page: u32, limit: u32) -> Result<HistoryPage> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let batch = vec![record(2000)];
                self.store
                    .commit_scan(username, &batch, &ScanWatermark::from_batch(username, &batch, 1))?;
            }
            self.inner.fetch_page(username, page, limit).await
        }
    }

    fn open() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("stat.db")).unwrap();
        (dir, store)
    }

    fn descending(count: usize, newest: i64, step: i64) -> Vec<i64> {
        (0..count as i64).map(|i| newest - i * step).collect()
    }

    #[async_std::test]
    async fn first_sync_backfills_everything() {
        let (_dir, store) = open();
        let mut timestamps = descending(450, 500_000, 1000);
        *timestamps.last_mut().unwrap() = 100;
        let pages = vec![
            timestamps[..200].to_vec(),
            timestamps[200..400].to_vec(),
            timestamps[400..].to_vec(),
        ];
        let source = ScriptedHistory::new().user("rj", pages);

        let report = sync_user(&store, &source, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.added, 450);
        assert_eq!(report.watermark, 500_000);
        assert_eq!(store.get_records("rj").unwrap().len(), 450);
        let stored = store.get_watermark("rj").unwrap();
        assert_eq!(stored.max_record_timestamp, 500_000);
        assert_eq!(stored.records_found, 450);
        assert!(stored.run_timestamp > 0);
    }

    #[async_std::test]
    async fn resync_without_new_plays_changes_nothing() {
        let (_dir, store) = open();
        let source = ScriptedHistory::new().user(
            "rj",
            vec![descending(5, 1100, 10), descending(5, 1040, 10)],
        );
        sync_user(&store, &source, "rj", ScanSettings::default())
            .await
            .unwrap();
        let records = store.get_records("rj").unwrap();
        let watermark = store.get_watermark("rj").unwrap();

        let report = sync_user(&store, &source, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.pages, 1);
        assert_eq!(store.get_records("rj").unwrap(), records);
        assert_eq!(store.get_watermark("rj").unwrap(), watermark);
    }

    #[async_std::test]
    async fn new_plays_are_appended_and_watermark_advances() {
        let (_dir, store) = open();
        let before = ScriptedHistory::new().user("rj", vec![vec![1050, 1010, 995]]);
        sync_user(&store, &before, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(store.get_watermark("rj").unwrap().max_record_timestamp, 1050);

        let after = ScriptedHistory::new().user("rj", vec![vec![1300, 1200, 1050], vec![1010, 995]]);
        let report = sync_user(&store, &after, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(after.pages_requested("rj"), vec![1, 2]);
        let stored = store.get_watermark("rj").unwrap();
        assert_eq!(stored.max_record_timestamp, 1300);
        assert_eq!(stored.records_found, 2);
        let ts: Vec<i64> = store
            .get_records("rj")
            .unwrap()
            .iter()
            .map(|r| r.date_timestamp)
            .collect();
        assert_eq!(ts, vec![1050, 1010, 995, 1300, 1200]);
    }

    #[async_std::test]
    async fn empty_remote_leaves_state_alone() {
        let (_dir, store) = open();
        let seeded = ScriptedHistory::new().user("rj", vec![vec![1050, 1010]]);
        sync_user(&store, &seeded, "rj", ScanSettings::default())
            .await
            .unwrap();
        let records = store.get_records("rj").unwrap();
        let watermark = store.get_watermark("rj").unwrap();

        let empty = ScriptedHistory::new().user("rj", vec![]);
        let report = sync_user(&store, &empty, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(store.get_records("rj").unwrap(), records);
        assert_eq!(store.get_watermark("rj").unwrap(), watermark);
    }

    #[async_std::test]
    async fn reported_watermark_is_the_stored_one() {
        let (_dir, store) = open();
        let source = RacingHistory {
            inner: ScriptedHistory::new().user("rj", vec![vec![1050, 1010]]),
            store: store.clone(),
            raced: AtomicBool::new(false),
        };
        let report = sync_user(&store, &source, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(report.watermark, 2000);
        assert_eq!(store.get_watermark("rj").unwrap().max_record_timestamp, 2000);
    }

    #[async_std::test]
    async fn misreported_pages_are_not_committed() {
        let (_dir, store) = open();
        let source = ScriptedHistory::new()
            .user("rj", vec![vec![1050, 1010], vec![1000, 990], vec![980]])
            .misreport("rj", 1, 3);
        let report = sync_user(&store, &source, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.stop, StopReason::PageMismatch);
        assert_eq!(report.added, 0);
        assert!(store.get_records("rj").unwrap().is_empty());
        assert_eq!(store.get_watermark("rj").unwrap(), ScanWatermark::default());
    }

    #[async_std::test]
    async fn incomplete_scans_are_not_committed() {
        let (_dir, store) = open();
        let source = ScriptedHistory::new()
            .user("rj", vec![vec![1050, 1010], vec![1000, 990]])
            .malformed_at("rj", 2);
        let report = sync_user(&store, &source, "rj", ScanSettings::default())
            .await
            .unwrap();
        assert_eq!(report.stop, StopReason::Malformed);
        assert_eq!(report.added, 0);
        assert!(store.get_records("rj").unwrap().is_empty());
        assert_eq!(store.get_watermark("rj").unwrap(), ScanWatermark::default());
    }

    #[async_std::test]
    async fn one_failing_user_does_not_stop_the_others() {
        let (_dir, store) = open();
        store.add_user("broken").unwrap();
        store.add_user("rj").unwrap();
        store.add_user("nobody").unwrap();
        let source = ScriptedHistory::new()
            .failing("broken")
            .user("rj", vec![vec![1050, 1010]]);

        let summary = sync_tick(&store, &source, ScanSettings::default(), &LOG)
            .await
            .unwrap();
        assert_eq!(summary.users, 3);
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.added, 2);
        assert_eq!(store.get_records("rj").unwrap().len(), 2);
        assert!(store.get_records("broken").unwrap().is_empty());

        let order: Vec<String> = source.requests().into_iter().map(|(u, _)| u).collect();
        assert_eq!(order, vec!["broken", "rj", "nobody"]);
    }
}

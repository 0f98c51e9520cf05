//! Pipeline orchestrator: ties scraper → detection → alerts together.
//!
//! ## Refresh cycle
//!
//! `refresh()` runs one crawl (scheduler or cron use):
//!   1. Scan the facility directory, then fetch every facility's availability
//!      window concurrently → fresh [`Snapshot`]. Facilities unfinished at the
//!      run budget deadline are dropped from it; the rest is kept.
//!   2. Replace the cached + persisted snapshot
//!   3. Under the state lock: expire old alerts, prune baselines and the
//!      seen-set, detect new slots, persist the seen-set
//!   4. Notify matching subscribers
//!   Idempotent: re-running on an unchanged site detects 0 new slots.
//!
//! Overlapping refreshes are skipped, not queued, both within a process and
//! across processes sharing a data directory.

mod cache;

pub use cache::SnapshotCache;

use crate::alerts::{dispatch, expire_conditions, prune_baselines};
use crate::config::{PipelineConfig, ScraperConfig};
use crate::detect::{detect_new, prune_seen};
use crate::error::CrawlError;
use crate::models::{AlertCondition, Availability, Baselines, SeenSet, Snapshot};
use crate::notify::Notifier;
use crate::scraper::cleaner::matches_category;
use crate::scraper::{ReservationSource, fetch_availability, scan_facilities};
use crate::storage::{KEY_ALARMS, KEY_BASELINES, KEY_SEEN, KEY_SNAPSHOT, RunLock, StateStore};
use crate::utils::{self, Timer};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub facilities: usize,
    /// Facilities whose availability was still loading when the run budget ran out.
    pub unfinished_facilities: usize,
    pub open_slots: usize,
    pub new_slots: usize,
    pub notified_subscribers: usize,
    pub notify_failures: usize,
    pub persist_failures: usize,
    pub expired_alerts: usize,
    pub pruned_baseline_keys: usize,
    pub pruned_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another refresh held the run guard.
    Skipped,
}

pub struct Pipeline<S: ReservationSource + ?Sized> {
    source: Arc<S>,
    store: StateStore,
    notifier: Arc<dyn Notifier>,
    cache: SnapshotCache,
    category_keyword: String,
    max_pages: u32,
    config: PipelineConfig,
    run_guard: Mutex<()>,
}

impl<S: ReservationSource + ?Sized> Pipeline<S> {
    pub fn new(
        source: Arc<S>,
        store: StateStore,
        notifier: Arc<dyn Notifier>,
        scraper: &ScraperConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            cache: SnapshotCache::default(),
            category_keyword: scraper.category_keyword.clone(),
            max_pages: scraper.max_pages,
            config,
            run_guard: Mutex::new(()),
        }
    }

    pub fn today(&self) -> NaiveDate {
        utils::today(self.config.utc_offset_hours)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs.max(1))
    }

    // ── Crawl ─────────────────────────────────────────────────────────────────

    /// Directory scan followed by a concurrent per-facility availability fetch.
    /// Facilities without any open date are kept in `facilities` but left out
    /// of `availability`.
    pub async fn run_crawl(&self, today: NaiveDate) -> Result<Snapshot, CrawlError> {
        self.crawl(today).await.map(|(snapshot, _)| snapshot)
    }

    /// Like [`Self::run_crawl`], bounded by the run budget. Facilities still
    /// fetching at the deadline are aborted and left out of `availability`;
    /// their count is returned alongside the snapshot.
    async fn crawl(&self, today: NaiveDate) -> Result<(Snapshot, usize), CrawlError> {
        let _t = Timer::start("Crawl");
        let deadline = Instant::now() + Duration::from_secs(self.config.run_budget_secs);

        let keyword = self.category_keyword.clone();
        let facilities = scan_facilities(
            Arc::clone(&self.source),
            move |f| matches_category(f, &keyword),
            self.max_pages,
        )
        .await?;

        info!("=== Fetching availability ({} facilities) ===", facilities.len());
        let mut pending: BTreeSet<String> = facilities.keys().cloned().collect();
        let mut tasks = JoinSet::new();
        for id in facilities.keys() {
            let source = Arc::clone(&self.source);
            let id = id.clone();
            tasks.spawn(async move {
                let dates = fetch_availability(source, &id, today).await;
                (id, dates)
            });
        }

        let mut availability = Availability::new();
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, dates)))) => {
                    info!("{}: {} open dates", id, dates.len());
                    pending.remove(&id);
                    if !dates.is_empty() {
                        availability.insert(id, dates);
                    }
                }
                Ok(Some(Err(e))) => error!("Facility task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    warn!(
                        budget_secs = self.config.run_budget_secs,
                        unfinished = ?pending,
                        "run budget exhausted, keeping partial availability"
                    );
                    break;
                }
            }
        }

        let snapshot = Snapshot {
            facilities,
            availability,
            updated_at: Utc::now(),
        };
        Ok((snapshot, pending.len()))
    }

    // ── Refresh ───────────────────────────────────────────────────────────────

    pub async fn refresh(&self) -> Result<RefreshOutcome, CrawlError> {
        self.refresh_on(self.today()).await
    }

    pub async fn refresh_on(&self, today: NaiveDate) -> Result<RefreshOutcome, CrawlError> {
        let Ok(_running) = self.run_guard.try_lock() else {
            warn!("refresh already running, skipping");
            return Ok(RefreshOutcome::Skipped);
        };
        let RunLock::Acquired(_run_file) = self.store.try_lock_run() else {
            warn!("refresh running in another process, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let (snapshot, unfinished) = match self.crawl(today).await {
            Ok((s, unfinished)) => (Arc::new(s), unfinished),
            Err(e) => {
                error!(error = %e, "crawl failed, keeping previous snapshot");
                self.store.record_run(0, Some(&e.to_string()));
                return Err(e);
            }
        };

        self.cache.replace(Arc::clone(&snapshot)).await;
        let mut report = RefreshReport {
            facilities: snapshot.facilities.len(),
            unfinished_facilities: unfinished,
            open_slots: snapshot.slot_count(),
            ..Default::default()
        };
        if let Err(e) = self.store.save(KEY_SNAPSHOT, snapshot.as_ref()) {
            warn!(error = %e, "failed to persist snapshot");
            report.persist_failures += 1;
        }

        let (events, conditions, baselines) = {
            let _state = self.store.exclusive().await;

            let mut conditions: Vec<AlertCondition> = self.store.load_or_default(KEY_ALARMS);
            report.expired_alerts = expire_conditions(&mut conditions, today);
            if report.expired_alerts > 0 {
                if let Err(e) = self.store.save(KEY_ALARMS, &conditions) {
                    warn!(error = %e, "failed to persist expired alerts");
                    report.persist_failures += 1;
                }
            }

            let mut baselines: Baselines = self.store.load_or_default(KEY_BASELINES);
            let subscribers = baselines.len();
            report.pruned_baseline_keys = prune_baselines(&mut baselines, &conditions, today);
            if report.pruned_baseline_keys > 0 || baselines.len() != subscribers {
                if let Err(e) = self.store.save(KEY_BASELINES, &baselines) {
                    warn!(error = %e, "failed to persist pruned baselines");
                    report.persist_failures += 1;
                }
            }

            let mut seen: SeenSet = self.store.load_or_default(KEY_SEEN);
            report.pruned_keys = prune_seen(&mut seen, today);

            let events = detect_new(&snapshot, &mut seen);
            if let Err(e) = self.store.save(KEY_SEEN, &seen) {
                error!(error = %e, "failed to persist seen-set; slots may be re-detected");
                report.persist_failures += 1;
            }
            (events, conditions, baselines)
        };
        report.new_slots = events.len();

        let sent = dispatch(&events, &conditions, &baselines, self.notifier.as_ref(), today).await;
        report.notified_subscribers = sent.notified;
        report.notify_failures = sent.failures;

        self.store.record_run(report.new_slots, None);
        info!(
            "=== Done: {} facilities ({} unfinished) | {} open slots | {} new | {} notified ===",
            report.facilities,
            report.unfinished_facilities,
            report.open_slots,
            report.new_slots,
            report.notified_subscribers
        );
        Ok(RefreshOutcome::Completed(report))
    }

    // ── Query ─────────────────────────────────────────────────────────────────

    /// Cached snapshot, else the persisted one. Never crawls.
    pub async fn known_snapshot(&self) -> Option<Arc<Snapshot>> {
        if let Some(s) = self.cache.get().await {
            return Some(s);
        }
        match self.store.try_load::<Snapshot>(KEY_SNAPSHOT) {
            Ok(Some(s)) => {
                let s = Arc::new(s);
                self.cache.replace(Arc::clone(&s)).await;
                Some(s)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "persisted snapshot unreadable");
                None
            }
        }
    }

    /// Last known-good snapshot; crawls once only when none exists anywhere.
    pub async fn current_snapshot(&self) -> Result<Arc<Snapshot>, CrawlError> {
        if let Some(s) = self.known_snapshot().await {
            return Ok(s);
        }

        info!("no snapshot yet, crawling on demand");
        if let RefreshOutcome::Skipped = self.refresh().await? {
            // wait for the in-flight refresh to finish
            drop(self.run_guard.lock().await);
        }
        self.cache.get().await.ok_or(CrawlError::NoSnapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SlotKey;
    use crate::notify::recording::RecordingNotifier;
    use crate::scraper::fake::{FakeSource, listing_html};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn scraper_config() -> ScraperConfig {
        ScraperConfig {
            category_keyword: "Tennis".into(),
            ..Default::default()
        }
    }

    fn pogok_source() -> FakeSource {
        FakeSource::default()
            .with_page(
                1,
                listing_html(
                    &[("10343", "Pogok Tennis Court"), ("20001", "Suji Tennis Court"), ("30001", "Football Pitch")],
                    None,
                ),
            )
            .with_slots("10343", "20251222", &["18:00~20:00"])
    }

    fn pipeline(
        source: FakeSource,
        store: StateStore,
        notifier: Arc<RecordingNotifier>,
    ) -> Pipeline<FakeSource> {
        Pipeline::new(
            Arc::new(source),
            store,
            notifier,
            &scraper_config(),
            PipelineConfig::default(),
        )
    }

    fn alert(subscriber: &str, group: &str, date: &str) -> AlertCondition {
        AlertCondition {
            subscriber_id: subscriber.into(),
            court_group: group.into(),
            date: date.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn crawl_keeps_facilities_without_openings() {
        let p = pipeline(pogok_source(), StateStore::in_memory(), Arc::default());

        let snap = p.run_crawl(ymd(2025, 12, 20)).await.unwrap();

        assert_eq!(snap.facilities.len(), 2);
        assert!(snap.facilities.contains_key("20001"));
        assert!(!snap.availability.contains_key("20001"));
        assert_eq!(snap.availability["10343"]["20251222"][0].time_label, "18:00~20:00");
    }

    #[tokio::test]
    async fn new_slot_reaches_matching_subscriber_once() {
        let store = StateStore::in_memory();
        store.save(KEY_ALARMS, &vec![alert("U1", "Pogok", "20251222")]).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let p = pipeline(pogok_source(), store.clone(), Arc::clone(&notifier));

        let outcome = p.refresh_on(ymd(2025, 12, 20)).await.unwrap();

        let RefreshOutcome::Completed(report) = outcome else {
            panic!("refresh skipped");
        };
        assert_eq!(report.new_slots, 1);
        assert_eq!(report.notified_subscribers, 1);

        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "U1");
        assert!(calls[0].2.contains("Pogok Tennis Court"));
        assert!(calls[0].2.contains("18:00~20:00"));

        let seen: SeenSet = store.load_or_default(KEY_SEEN);
        assert!(seen.contains(&SlotKey {
            facility_id: "10343".into(),
            date: "20251222".into(),
            time_label: "18:00~20:00".into(),
        }));

        // unchanged site: nothing new, nobody notified again
        let again = p.refresh_on(ymd(2025, 12, 20)).await.unwrap();
        assert!(matches!(again, RefreshOutcome::Completed(RefreshReport { new_slots: 0, .. })));
        assert_eq!(notifier.calls().len(), 1);
    }

    #[tokio::test]
    async fn baseline_from_registration_suppresses_preexisting_slot() {
        let store = StateStore::in_memory();
        let p = pipeline(pogok_source(), store.clone(), Arc::default());
        let snap = p.run_crawl(ymd(2025, 12, 20)).await.unwrap();

        let registry = crate::alerts::AlertRegistry::new(store.clone());
        registry
            .register("U1", "Pogok", "20251222", ymd(2025, 12, 20), Some(&snap))
            .await
            .unwrap();
        registry
            .register("U2", "Pogok", "20251222", ymd(2025, 12, 20), None)
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let p = pipeline(pogok_source(), store, Arc::clone(&notifier));
        p.refresh_on(ymd(2025, 12, 20)).await.unwrap();

        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "U2");
    }

    #[tokio::test]
    async fn failed_crawl_keeps_last_good_snapshot() {
        let store = StateStore::in_memory();
        let good = pipeline(pogok_source(), store.clone(), Arc::default());
        good.refresh_on(ymd(2025, 12, 20)).await.unwrap();

        let broken = pipeline(
            FakeSource { failing_pages: vec![1], ..Default::default() },
            store,
            Arc::default(),
        );
        let err = broken.refresh_on(ymd(2025, 12, 20)).await.unwrap_err();
        assert!(matches!(err, CrawlError::DirectoryUnavailable(_)));

        // falls back to the persisted snapshot without crawling
        let snap = broken.current_snapshot().await.unwrap();
        assert_eq!(snap.facilities.len(), 2);
    }

    #[tokio::test]
    async fn current_snapshot_crawls_only_on_miss() {
        let source = Arc::new(pogok_source());
        let p = Pipeline::new(
            Arc::clone(&source),
            StateStore::in_memory(),
            Arc::new(RecordingNotifier::default()),
            &scraper_config(),
            PipelineConfig::default(),
        );

        p.current_snapshot().await.unwrap();
        p.current_snapshot().await.unwrap();

        // one listing page + the empty terminator, from a single crawl
        assert_eq!(source.listing_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_budget_keeps_facilities_that_finished() {
        let source = FakeSource {
            stalled: vec!["20001".into()],
            ..pogok_source()
        };
        let p = Pipeline::new(
            Arc::new(source),
            StateStore::in_memory(),
            Arc::new(RecordingNotifier::default()),
            &scraper_config(),
            PipelineConfig {
                run_budget_secs: 5,
                ..Default::default()
            },
        );

        let RefreshOutcome::Completed(report) = p.refresh_on(ymd(2025, 12, 20)).await.unwrap() else {
            panic!("refresh skipped");
        };

        assert_eq!(report.facilities, 2);
        assert_eq!(report.unfinished_facilities, 1);
        assert_eq!(report.new_slots, 1);
        let cached = p.known_snapshot().await.unwrap();
        assert_eq!(cached.availability["10343"]["20251222"][0].time_label, "18:00~20:00");
        assert!(!cached.availability.contains_key("20001"));
    }

    #[tokio::test]
    async fn refresh_prunes_stale_baselines() {
        let store = StateStore::in_memory();
        let p = pipeline(pogok_source(), store.clone(), Arc::default());
        let snap = p.run_crawl(ymd(2025, 12, 20)).await.unwrap();
        crate::alerts::AlertRegistry::new(store.clone())
            .register("U1", "Pogok", "20251222", ymd(2025, 12, 20), Some(&snap))
            .await
            .unwrap();

        let RefreshOutcome::Completed(report) = p.refresh_on(ymd(2026, 3, 1)).await.unwrap() else {
            panic!("refresh skipped");
        };

        assert_eq!(report.expired_alerts, 1);
        assert_eq!(report.pruned_baseline_keys, 1);
        let alarms: Vec<AlertCondition> = store.load_or_default(KEY_ALARMS);
        let baselines: Baselines = store.load_or_default(KEY_BASELINES);
        assert!(alarms.is_empty());
        assert!(baselines.is_empty());
    }

    #[tokio::test]
    async fn refresh_held_by_another_process_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let other = StateStore::in_memory().with_lock_dir(dir.path());
        let _held = other.try_lock_run();

        let source = Arc::new(pogok_source());
        let p = Pipeline::new(
            Arc::clone(&source),
            StateStore::in_memory().with_lock_dir(dir.path()),
            Arc::new(RecordingNotifier::default()),
            &scraper_config(),
            PipelineConfig::default(),
        );

        assert_eq!(p.refresh_on(ymd(2025, 12, 20)).await.unwrap(), RefreshOutcome::Skipped);
        assert_eq!(source.listing_fetches(), 0);
    }

    #[tokio::test]
    async fn overlapping_refresh_is_skipped() {
        let p = pipeline(pogok_source(), StateStore::in_memory(), Arc::default());
        let _held = p.run_guard.lock().await;

        let outcome = p.refresh_on(ymd(2025, 12, 20)).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Skipped);
    }

    #[tokio::test]
    async fn expired_alerts_are_dropped_each_cycle() {
        let store = StateStore::in_memory();
        store
            .save(
                KEY_ALARMS,
                &vec![alert("U1", "Pogok", "20251219"), alert("U1", "Pogok", "20251222")],
            )
            .unwrap();
        let p = pipeline(pogok_source(), store.clone(), Arc::default());

        let RefreshOutcome::Completed(report) = p.refresh_on(ymd(2025, 12, 20)).await.unwrap() else {
            panic!("refresh skipped");
        };

        assert_eq!(report.expired_alerts, 1);
        let left: Vec<AlertCondition> = store.load_or_default(KEY_ALARMS);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].date, "20251222");
    }
}

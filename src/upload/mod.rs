mod remote;

pub use remote::{
    AssetStore, AssetUpload, CloudinaryStore, HttpProbe, ProbeError, RemoteAsset, SourceProbe,
    UploadError,
};

use crate::{
    catalog::{CatalogRecord, CatalogStore, normalize_sku},
    config::{env_list, env_u64, env_usize},
};
use serde::Serialize;
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub max_images_per_sku: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub folder: String,
    /// Normalized keys of SKUs never uploaded.
    pub ignored_skus: HashSet<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_images_per_sku: 4,
            concurrency: 5,
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            folder: "products".to_string(),
            ignored_skus: HashSet::new(),
        }
    }
}

impl UploadSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_images_per_sku: env_usize("MAX_IMAGES_PER_SKU", defaults.max_images_per_sku, 1),
            concurrency: env_usize("UPLOAD_CONCURRENCY", defaults.concurrency, 1),
            max_attempts: env_usize("UPLOAD_MAX_ATTEMPTS", defaults.max_attempts as usize, 1)
                as u32,
            retry_delay: Duration::from_millis(env_u64("UPLOAD_RETRY_DELAY_MS", 1000)),
            folder: std::env::var("UPLOAD_FOLDER")
                .ok()
                .map(|value| value.trim().trim_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.folder),
            ignored_skus: env_list("SKUS_TO_IGNORE")
                .iter()
                .map(|sku| normalize_sku(sku))
                .collect(),
        }
    }

    fn backoff(&self, attempt: u32, rate_limited: bool) -> Duration {
        let delay = self.retry_delay * attempt;
        if rate_limited { delay * 2 } else { delay }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadJob {
    pub sku: String,
    /// 1-based position in the SKU's image list; part of the remote id.
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Success { public_id: String, secure_url: String },
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub job: UploadJob,
    pub outcome: UploadOutcome,
    pub attempts: u32,
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, UploadOutcome::Success { .. })
    }

    fn failure(job: UploadJob, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            job,
            outcome: UploadOutcome::Failure {
                reason: reason.into(),
            },
            attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub jobs: Vec<UploadJob>,
    /// Images cut by the per-SKU cap.
    pub truncated: usize,
    /// SKUs skipped through the ignore list.
    pub ignored: usize,
}

/// Caps every record at `max_images_per_sku` and emits one job per kept
/// image, indexed from 1 in list order.
pub fn plan_jobs<'a, I>(
    records: I,
    max_images_per_sku: usize,
    ignored: &HashSet<String>,
) -> UploadPlan
where
    I: IntoIterator<Item = &'a CatalogRecord>,
{
    let mut plan = UploadPlan::default();
    for record in records {
        if ignored.contains(&record.key()) {
            plan.ignored += 1;
            continue;
        }
        plan.truncated += record.images.len().saturating_sub(max_images_per_sku);
        plan.jobs.extend(
            record
                .images
                .iter()
                .take(max_images_per_sku)
                .enumerate()
                .map(|(idx, url)| UploadJob {
                    sku: record.sku.clone(),
                    index: idx + 1,
                    url: url.clone(),
                }),
        );
    }
    plan
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub results: Vec<UploadResult>,
    pub truncated: usize,
    pub ignored: usize,
}

impl UploadReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|result| result.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

/// `products/<slug>` folder segment for a SKU.
pub fn sku_slug(sku: &str) -> String {
    sku.trim().replace('_', "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Pending,
    Checking,
    Uploading,
    RetryWait,
    Done,
}

struct JobTracker<'a> {
    job: &'a UploadJob,
    phase: JobPhase,
}

impl<'a> JobTracker<'a> {
    fn new(job: &'a UploadJob) -> Self {
        Self {
            job,
            phase: JobPhase::Pending,
        }
    }

    fn enter(&mut self, next: JobPhase, attempt: u32) {
        trace!(
            target = "catalog.upload",
            sku = %self.job.sku,
            index = self.job.index,
            attempt,
            from = ?self.phase,
            to = ?next,
            "upload job transition"
        );
        self.phase = next;
    }
}

/// Pushes capped catalogs to the asset store over a fixed pool of workers.
#[derive(Clone)]
pub struct UploadEngine {
    store: Arc<dyn AssetStore>,
    probe: Arc<dyn SourceProbe>,
    settings: Arc<UploadSettings>,
}

impl UploadEngine {
    pub fn new(
        store: Arc<dyn AssetStore>,
        probe: Arc<dyn SourceProbe>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            store,
            probe,
            settings: Arc::new(settings),
        }
    }

    /// Cloudinary store plus HEAD probe, when credentials are configured.
    pub fn from_env() -> Option<Self> {
        let store = CloudinaryStore::from_env()?;
        Some(Self::new(
            Arc::new(store),
            Arc::new(HttpProbe::default()),
            UploadSettings::from_env(),
        ))
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn plan<'a, I>(&self, records: I) -> UploadPlan
    where
        I: IntoIterator<Item = &'a CatalogRecord>,
    {
        plan_jobs(
            records,
            self.settings.max_images_per_sku,
            &self.settings.ignored_skus,
        )
    }

    pub async fn upload_catalog(&self, store: &CatalogStore) -> UploadReport {
        self.upload_records(store.records(), None).await
    }

    pub async fn upload_records<'a, I>(
        &self,
        records: I,
        cancel: Option<&CancellationToken>,
    ) -> UploadReport
    where
        I: IntoIterator<Item = &'a CatalogRecord>,
    {
        let plan = self.plan(records);
        if plan.truncated > 0 || plan.ignored > 0 {
            info!(
                target = "catalog.upload",
                truncated = plan.truncated,
                ignored = plan.ignored,
                cap = self.settings.max_images_per_sku,
                "upload plan trimmed"
            );
        }
        let results = self.run(plan.jobs, cancel).await;
        UploadReport {
            results,
            truncated: plan.truncated,
            ignored: plan.ignored,
        }
    }

    /// Runs every job and returns exactly one result per job, in job order.
    /// Jobs still queued when `cancel` fires are reported as failures without
    /// being attempted.
    pub async fn run(
        &self,
        jobs: Vec<UploadJob>,
        cancel: Option<&CancellationToken>,
    ) -> Vec<UploadResult> {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }
        let queue = Arc::new(Mutex::new(
            jobs.iter().cloned().enumerate().collect::<VecDeque<_>>(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, UploadResult)>();
        let cancel = cancel.cloned().unwrap_or_default();

        let workers: Vec<_> = (0..self.settings.concurrency.max(1))
            .map(|worker| {
                let engine = self.clone();
                let queue = queue.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { engine.worker(worker, queue, tx, cancel).await })
            })
            .collect();
        drop(tx);

        let mut slots: Vec<Option<UploadResult>> = vec![None; total];
        while let Some((seq, result)) = rx.recv().await {
            if let Some(slot) = slots.get_mut(seq) {
                *slot = Some(result);
            }
        }
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(target = "catalog.upload", error = %err, "upload worker aborted");
            }
        }

        let results: Vec<UploadResult> = slots
            .into_iter()
            .zip(jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| UploadResult::failure(job, "worker aborted", 0))
            })
            .collect();
        crate::metrics::upload_outcomes(
            results.iter().filter(|result| result.is_success()).count(),
            results.iter().filter(|result| !result.is_success()).count(),
        );
        results
    }

    async fn worker(
        &self,
        worker: usize,
        queue: Arc<Mutex<VecDeque<(usize, UploadJob)>>>,
        tx: mpsc::UnboundedSender<(usize, UploadResult)>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = queue.lock().await.pop_front();
            let Some((seq, job)) = next else {
                break;
            };
            let result = if cancel.is_cancelled() {
                UploadResult::failure(job, "cancelled before dispatch", 0)
            } else {
                self.process(job).await
            };
            if tx.send((seq, result)).is_err() {
                break;
            }
        }
        trace!(target = "catalog.upload", worker, "upload worker drained");
    }

    async fn process(&self, job: UploadJob) -> UploadResult {
        let request = AssetUpload {
            source_url: job.url.clone(),
            folder: format!("{}/{}", self.settings.folder, sku_slug(&job.sku)),
            public_id: job.index.to_string(),
            tags: vec![format!("sku:{}", job.sku)],
        };
        let mut tracker = JobTracker::new(&job);
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            tracker.enter(JobPhase::Checking, attempt);
            let (error, rate_limited) = match self.probe.check(&job.url).await {
                Err(err) if err.is_permanent() => {
                    tracker.enter(JobPhase::Done, attempt);
                    return UploadResult::failure(job.clone(), err.to_string(), attempt);
                }
                Err(err) => (err.to_string(), false),
                Ok(()) => {
                    tracker.enter(JobPhase::Uploading, attempt);
                    match self.store.upload(&request).await {
                        Ok(asset) => {
                            tracker.enter(JobPhase::Done, attempt);
                            return UploadResult {
                                job: job.clone(),
                                outcome: UploadOutcome::Success {
                                    public_id: asset.public_id,
                                    secure_url: asset.secure_url,
                                },
                                attempts: attempt,
                            };
                        }
                        Err(err) if !err.is_retryable() => {
                            tracker.enter(JobPhase::Done, attempt);
                            return UploadResult::failure(job.clone(), err.to_string(), attempt);
                        }
                        Err(err) => (err.to_string(), err.is_rate_limit()),
                    }
                }
            };
            if attempt >= self.settings.max_attempts {
                break error;
            }
            let delay = self.settings.backoff(attempt, rate_limited);
            warn!(
                target = "catalog.upload",
                sku = %job.sku,
                index = job.index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "upload attempt failed; retrying"
            );
            tracker.enter(JobPhase::RetryWait, attempt);
            sleep(delay).await;
        };
        tracker.enter(JobPhase::Done, attempt);
        UploadResult::failure(job.clone(), last_error, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Default)]
    struct ScriptedProbe {
        missing: HashSet<String>,
    }

    #[async_trait]
    impl SourceProbe for ScriptedProbe {
        async fn check(&self, url: &str) -> Result<(), ProbeError> {
            if self.missing.contains(url) {
                Err(ProbeError::ClientError(404))
            } else {
                Ok(())
            }
        }
    }

    /// Fails URLs listed in `failures` with the given error every time and
    /// tracks peak concurrency.
    #[derive(Default)]
    struct ScriptedStore {
        failures: HashMap<String, UploadError>,
        calls: std::sync::Mutex<HashMap<String, usize>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedStore {
        fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl AssetStore for ScriptedStore {
        async fn upload(&self, request: &AssetUpload) -> Result<RemoteAsset, UploadError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(request.source_url.clone())
                .or_default() += 1;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if let Some(err) = self.failures.get(&request.source_url) {
                return Err(err.clone());
            }
            Ok(RemoteAsset {
                public_id: format!("{}/{}", request.folder, request.public_id),
                secure_url: format!("https://res.example/{}", request.public_id),
            })
        }
    }

    /// Answers the first `fail_first` checks with `error`, then succeeds.
    struct FlakySource {
        fail_first: usize,
        error: ProbeError,
        checks: AtomicUsize,
    }

    impl FlakySource {
        fn new(fail_first: usize, error: ProbeError) -> Self {
            Self {
                fail_first,
                error,
                checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceProbe for FlakySource {
        async fn check(&self, _url: &str) -> Result<(), ProbeError> {
            if self.checks.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    /// Throttles the first upload, accepts the rest.
    #[derive(Default)]
    struct ThrottledOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AssetStore for ThrottledOnce {
        async fn upload(&self, request: &AssetUpload) -> Result<RemoteAsset, UploadError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(UploadError::RateLimited("slow down".into()));
            }
            Ok(RemoteAsset {
                public_id: format!("{}/{}", request.folder, request.public_id),
                secure_url: request.source_url.clone(),
            })
        }
    }

    fn fast_settings(concurrency: usize) -> UploadSettings {
        UploadSettings {
            concurrency,
            retry_delay: Duration::from_millis(1),
            ..UploadSettings::default()
        }
    }

    fn jobs(count: usize) -> Vec<UploadJob> {
        (1..=count)
            .map(|index| UploadJob {
                sku: format!("SKU_{index}"),
                index: 1,
                url: format!("https://src.example/{index}.jpg"),
            })
            .collect()
    }

    #[test]
    fn plan_caps_images_and_indexes_from_one() {
        let record = CatalogRecord::new("A-1").with_images((1..=7).map(|i| format!("u{i}")));
        let plan = plan_jobs([&record], 4, &HashSet::new());
        assert_eq!(plan.jobs.len(), 4);
        assert_eq!(plan.truncated, 3);
        let indexes: Vec<usize> = plan.jobs.iter().map(|job| job.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        let urls: Vec<&str> = plan.jobs.iter().map(|job| job.url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u2", "u3", "u4"]);
    }

    #[test]
    fn plan_skips_ignored_skus() {
        let records = [
            CatalogRecord::new("keep").with_images(["a"]),
            CatalogRecord::new("skip_me").with_images(["b", "c"]),
        ];
        let ignored = HashSet::from([normalize_sku("SKIP-ME")]);
        let plan = plan_jobs(&records, 4, &ignored);
        assert_eq!(plan.ignored, 1);
        assert_eq!(plan.jobs.len(), 1);
    }

    #[test]
    fn slug_and_backoff() {
        assert_eq!(sku_slug(" ABC_12_x "), "ABC-12-x");
        let settings = UploadSettings::default();
        assert_eq!(settings.backoff(2, false), Duration::from_millis(2000));
        assert_eq!(settings.backoff(2, true), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn exhausted_job_still_yields_a_result() {
        let failing = "https://src.example/5.jpg".to_string();
        let store = Arc::new(ScriptedStore {
            failures: HashMap::from([(
                failing.clone(),
                UploadError::Server {
                    status: 503,
                    message: "busy".into(),
                },
            )]),
            ..ScriptedStore::default()
        });
        let engine = UploadEngine::new(
            store.clone(),
            Arc::new(ScriptedProbe::default()),
            fast_settings(3),
        );
        let results = engine.run(jobs(10), None).await;
        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 9);
        let failed = &results[4];
        assert_eq!(failed.job.url, failing);
        assert_eq!(failed.attempts, 3);
        assert!(matches!(failed.outcome, UploadOutcome::Failure { .. }));
        assert_eq!(store.calls_for(&failing), 3);
    }

    #[tokio::test]
    async fn missing_source_fails_without_retry() {
        let gone = "https://src.example/2.jpg".to_string();
        let store = Arc::new(ScriptedStore::default());
        let probe = ScriptedProbe {
            missing: HashSet::from([gone.clone()]),
        };
        let engine = UploadEngine::new(store.clone(), Arc::new(probe), fast_settings(2));
        let results = engine.run(jobs(3), None).await;
        assert_eq!(results[1].attempts, 1);
        assert_eq!(
            results[1].outcome,
            UploadOutcome::Failure {
                reason: "source returned HTTP 404".into()
            }
        );
        assert_eq!(store.calls_for(&gone), 0);
    }

    #[tokio::test]
    async fn transient_source_error_and_rate_limit_are_retried() {
        let store = Arc::new(ThrottledOnce::default());
        let source = Arc::new(FlakySource::new(1, ProbeError::ServerError(503)));
        let engine = UploadEngine::new(store.clone(), source.clone(), fast_settings(1));
        let results = engine.run(jobs(1), None).await;
        assert_eq!(results[0].attempts, 3);
        assert!(results[0].is_success());
        assert_eq!(source.checks.load(Ordering::SeqCst), 3);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_source_fails_after_every_attempt() {
        let store = Arc::new(ScriptedStore::default());
        let source = Arc::new(FlakySource::new(
            usize::MAX,
            ProbeError::Network("connection reset".into()),
        ));
        let engine = UploadEngine::new(store.clone(), source.clone(), fast_settings(1));
        let results = engine.run(jobs(1), None).await;
        assert_eq!(results[0].attempts, 3);
        assert_eq!(
            results[0].outcome,
            UploadOutcome::Failure {
                reason: "source unreachable: connection reset".into()
            }
        );
        assert_eq!(source.checks.load(Ordering::SeqCst), 3);
        assert_eq!(store.calls_for("https://src.example/1.jpg"), 0);
    }

    #[tokio::test]
    async fn rejected_upload_is_not_retried() {
        let bad = "https://src.example/1.jpg".to_string();
        let store = Arc::new(ScriptedStore {
            failures: HashMap::from([(bad.clone(), UploadError::Rejected("bad file".into()))]),
            ..ScriptedStore::default()
        });
        let engine = UploadEngine::new(
            store.clone(),
            Arc::new(ScriptedProbe::default()),
            fast_settings(1),
        );
        let results = engine.run(jobs(1), None).await;
        assert_eq!(results[0].attempts, 1);
        assert_eq!(store.calls_for(&bad), 1);
    }

    #[tokio::test]
    async fn pool_never_exceeds_concurrency() {
        let store = Arc::new(ScriptedStore::default());
        let engine = UploadEngine::new(
            store.clone(),
            Arc::new(ScriptedProbe::default()),
            fast_settings(3),
        );
        let results = engine.run(jobs(20), None).await;
        assert_eq!(results.len(), 20);
        assert!(store.peak.load(Ordering::SeqCst) <= 3);
        for (idx, result) in results.iter().enumerate() {
            assert_eq!(result.job.url, format!("https://src.example/{}.jpg", idx + 1));
        }
    }

    #[tokio::test]
    async fn cancelled_batch_reports_every_job() {
        let store = Arc::new(ScriptedStore::default());
        let engine = UploadEngine::new(
            store.clone(),
            Arc::new(ScriptedProbe::default()),
            fast_settings(2),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = engine.run(jobs(4), Some(&cancel)).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|result| result.attempts == 0));
        assert_eq!(store.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_catalog_uses_slugged_folder_and_position() {
        let store = Arc::new(ScriptedStore::default());
        let engine = UploadEngine::new(
            store,
            Arc::new(ScriptedProbe::default()),
            fast_settings(2),
        );
        let catalog = CatalogStore::from_records(vec![
            CatalogRecord::new("AB_12")
                .with_images(["https://src.example/a.jpg", "https://src.example/b.jpg"]),
        ]);
        let report = engine.upload_catalog(&catalog).await;
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        assert_eq!(
            report.results[1].outcome,
            UploadOutcome::Success {
                public_id: "products/AB-12/2".into(),
                secure_url: "https://res.example/2".into(),
            }
        );
    }
}

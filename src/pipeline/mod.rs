mod collector;
mod snapshot;
mod stages;
mod state;

pub use collector::{CollectorExit, CollectorRunner, StageFailure, SubprocessCollector};
#[cfg(test)]
pub use snapshot::MemorySnapshotStore;
pub use snapshot::{SnapshotError, SnapshotStore, snapshot_store_for};
pub use state::{
    EventBus, PipelineEvent, PipelineState, PipelineStatus, StatusUpdate, Subscription,
};

use crate::{
    catalog::{CatalogFile, CatalogRecord, CatalogStore, normalize_sku},
    config::{env_u64, env_usize},
    curation::{CurationOutcome, Selection, curate},
    merge::MergeEngine,
    upload::UploadEngine,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stages::Flow;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const CANCELLED_LOG: &str = "Task cancelled by user.";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    /// Per-SKU lines in the results summary before it is elided.
    pub summary_limit: usize,
    /// Upper bound on one snapshot save; a slower save is abandoned.
    pub snapshot_timeout: Duration,
}

impl PipelineSettings {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            summary_limit: 20,
            snapshot_timeout: Duration::from_millis(500),
        }
    }

    pub fn from_env(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            summary_limit: env_usize("SUMMARY_LIMIT", 20, 1),
            snapshot_timeout: Duration::from_millis(env_u64("SNAPSHOT_TIMEOUT_MS", 500).max(1)),
            ..Self::new(work_dir)
        }
    }

    pub fn files_dir(&self) -> PathBuf {
        self.work_dir.join("files")
    }

    pub fn skus_path(&self) -> PathBuf {
        self.files_dir().join("skus.txt")
    }

    pub fn tsv_path(&self) -> PathBuf {
        self.files_dir().join("product_images.txt")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.files_dir().join("sources")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.files_dir().join("images.json")
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunOptions {
    /// Push the run's SKUs to the asset store after merging.
    #[serde(default)]
    pub upload: bool,
    /// Hold the upload until selections arrive through the curation gate.
    #[serde(default)]
    pub require_review: bool,
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Conflict,
    NotFound,
    Internal,
}

impl PipelineError {
    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Conflict)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Polling view of the runner; everything but the results map.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub run_id: Option<Uuid>,
    pub status: PipelineStatus,
    pub running: bool,
    pub progress: usize,
    pub total: usize,
    pub cancelled: bool,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub awaiting_curation: bool,
    pub results_count: usize,
    pub observers: usize,
    pub logs: Vec<String>,
}

struct Shared {
    state: PipelineState,
    bus: EventBus,
    cancel: CancellationToken,
    curation: Option<oneshot::Sender<HashMap<String, Selection>>>,
}

struct Inner {
    settings: PipelineSettings,
    catalog: CatalogFile,
    merge: MergeEngine,
    collector: Arc<dyn CollectorRunner>,
    uploader: Option<UploadEngine>,
    snapshots: Arc<dyn SnapshotStore>,
    /// Serializes every read-modify-write of the catalog file.
    catalog_writer: Mutex<()>,
    shared: Mutex<Shared>,
}

/// Owns the single active run and the observer feed.
///
/// Every mutation of [`PipelineState`] is snapshotted and broadcast while the
/// state lock is held, so observers see mutations in call order.
#[derive(Clone)]
pub struct PipelineRunner {
    inner: Arc<Inner>,
}

impl PipelineRunner {
    pub fn new(
        settings: PipelineSettings,
        merge: MergeEngine,
        collector: Arc<dyn CollectorRunner>,
        uploader: Option<UploadEngine>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let catalog = CatalogFile::new(settings.catalog_path());
        Self {
            inner: Arc::new(Inner {
                settings,
                catalog,
                merge,
                collector,
                uploader,
                snapshots,
                catalog_writer: Mutex::new(()),
                shared: Mutex::new(Shared {
                    state: PipelineState::default(),
                    bus: EventBus::default(),
                    cancel: CancellationToken::new(),
                    curation: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn catalog(&self) -> &CatalogFile {
        &self.inner.catalog
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.inner.merge
    }

    pub fn uploader(&self) -> Option<&UploadEngine> {
        self.inner.uploader.as_ref()
    }

    fn collector(&self) -> Arc<dyn CollectorRunner> {
        self.inner.collector.clone()
    }

    /// Starts a run for `raw_skus` and returns its id without waiting for it.
    pub async fn start(
        &self,
        raw_skus: &[String],
        options: RunOptions,
    ) -> Result<Uuid, PipelineError> {
        let skus = clean_skus(raw_skus);
        if skus.is_empty() {
            return Err(PipelineError::invalid_input(
                "start",
                "Please provide at least one SKU.",
            ));
        }
        if options.upload && self.inner.uploader.is_none() {
            return Err(PipelineError::invalid_input(
                "start",
                "uploads requested but no asset store is configured",
            ));
        }

        let mut shared = self.inner.shared.lock().await;
        if shared.state.status.is_active() {
            return Err(PipelineError::conflict(
                "start",
                "Pipeline is already running.",
            ));
        }
        let skus_path = self.inner.settings.skus_path();
        stages::prepare(&skus_path, &skus)
            .await
            .map_err(|err| PipelineError::internal("prepare", err.to_string()))?;

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        shared.bus.clear_history();
        shared.cancel = cancel.clone();
        shared.curation = None;
        shared.state = PipelineState {
            run_id: Some(run_id),
            status: PipelineStatus::Running,
            total: skus.len(),
            started_at: Some(Utc::now()),
            ..PipelineState::default()
        };
        let line = format!("Saved {} SKU(s) to {}", skus.len(), skus_path.display());
        shared.state.logs.push(line.clone());
        self.save_snapshot(&shared.state).await;
        let status = status_event(&shared.state);
        shared.bus.publish(PipelineEvent::Log(line));
        shared.bus.publish(status);
        info!(
            target = "catalog.pipeline",
            run_id = %run_id,
            skus = skus.len(),
            upload = options.upload,
            require_review = options.require_review,
            "pipeline run started"
        );

        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute(run_id, skus, options, cancel).await;
        });
        Ok(run_id)
    }

    async fn execute(
        self,
        run_id: Uuid,
        skus: Vec<String>,
        options: RunOptions,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let outcome = stages::run_stages(&self, &skus, options, &cancel).await;
        match outcome {
            Ok(Flow::Continue(())) => {
                self.append_log("Pipeline finished.").await;
                self.set_status(PipelineStatus::Finished).await;
            }
            Ok(Flow::Cancelled) => self.finish_cancelled().await,
            Err(_) if cancel.is_cancelled() => self.finish_cancelled().await,
            Err(failure) => {
                warn!(
                    target = "catalog.pipeline",
                    run_id = %run_id,
                    error = %failure,
                    "pipeline run failed"
                );
                self.fail(failure.to_string()).await;
            }
        }
        crate::metrics::stage_elapsed("pipeline", started.elapsed().as_millis());
        info!(
            target = "catalog.pipeline",
            run_id = %run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline run ended"
        );
    }

    async fn finish_cancelled(&self) {
        self.append_log(CANCELLED_LOG).await;
        self.set_status(PipelineStatus::Cancelled).await;
    }

    /// Requests cancellation of the active run.
    pub async fn cancel(&self) -> Result<(), PipelineError> {
        let mut shared = self.inner.shared.lock().await;
        if !shared.state.status.is_active() {
            return Err(PipelineError::conflict(
                "cancel",
                "No pipeline run is in progress.",
            ));
        }
        if shared.cancel.is_cancelled() {
            return Ok(());
        }
        shared.cancel.cancel();
        shared.state.cancelled = true;
        let line = "Cancellation requested.".to_string();
        shared.state.logs.push(line.clone());
        self.save_snapshot(&shared.state).await;
        shared.bus.publish(PipelineEvent::Log(line));
        info!(target = "catalog.pipeline", "pipeline cancellation requested");
        Ok(())
    }

    pub async fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        self.apply(|state| {
            state.logs.push(line.clone());
            vec![PipelineEvent::Log(line)]
        })
        .await;
    }

    /// Progress never moves backwards; a smaller value is ignored.
    pub async fn set_progress(&self, progress: usize) {
        self.apply(|state| {
            if progress <= state.progress {
                return Vec::new();
            }
            state.progress = progress;
            vec![status_event(state)]
        })
        .await;
    }

    pub async fn set_status(&self, status: PipelineStatus) {
        self.apply(|state| {
            state.status = status;
            if status == PipelineStatus::Cancelled {
                state.cancelled = true;
            }
            if status.is_terminal() {
                state.finished_at = Some(Utc::now());
            }
            vec![status_event(state)]
        })
        .await;
    }

    pub async fn publish_results(&self, records: Vec<CatalogRecord>) {
        self.apply(|state| {
            state.results = records
                .iter()
                .map(|record| (record.sku.clone(), record.images.clone()))
                .collect();
            vec![PipelineEvent::Results(records)]
        })
        .await;
    }

    async fn fail(&self, message: String) {
        self.apply(|state| {
            let line = format!("Pipeline failed: {message}");
            state.logs.push(line.clone());
            state.last_error = Some(message);
            state.status = PipelineStatus::Error;
            state.finished_at = Some(Utc::now());
            vec![PipelineEvent::Log(line), status_event(state)]
        })
        .await;
    }

    async fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut PipelineState) -> Vec<PipelineEvent>,
    {
        let mut shared = self.inner.shared.lock().await;
        let events = mutate(&mut shared.state);
        if events.is_empty() {
            return;
        }
        self.save_snapshot(&shared.state).await;
        for event in events {
            shared.bus.publish(event);
        }
    }

    async fn save_snapshot(&self, state: &PipelineState) {
        let limit = self.inner.settings.snapshot_timeout;
        let saved = tokio::time::timeout(limit, self.inner.snapshots.save(state))
            .await
            .unwrap_or(Err(SnapshotError::TimedOut(limit)));
        if let Err(err) = saved {
            warn!(target = "catalog.pipeline", error = %err, "pipeline snapshot not saved");
        }
    }

    async fn lock_catalog(&self) -> MutexGuard<'_, ()> {
        self.inner.catalog_writer.lock().await
    }

    /// Applies operator selections to the stored catalog outside a run.
    /// `resolve` sees the catalog as it is read under the writer lock.
    pub async fn curate_catalog<F>(
        &self,
        resolve: F,
    ) -> Result<(CurationOutcome, usize), PipelineError>
    where
        F: FnOnce(&CatalogStore) -> HashMap<String, Selection> + Send + 'static,
    {
        let _writer = self.lock_catalog().await;
        if self.inner.shared.lock().await.state.status.is_active() {
            return Err(PipelineError::conflict(
                "curation",
                "The catalog is being written by a pipeline run.",
            ));
        }
        let catalog = self.inner.catalog.clone();
        tokio::task::spawn_blocking(move || {
            let selections = resolve(&catalog.read()?);
            curate(&catalog, &selections).map(|outcome| (outcome, selections.len()))
        })
        .await
        .map_err(|err| PipelineError::internal("curation", err.to_string()))?
        .map_err(|err| PipelineError::internal("curation", err.to_string()))
    }

    pub async fn subscribe(&self) -> Subscription {
        self.inner.shared.lock().await.bus.subscribe()
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.inner.shared.lock().await.bus.unsubscribe(id);
    }

    pub async fn status(&self) -> StatusSnapshot {
        let shared = self.inner.shared.lock().await;
        let state = &shared.state;
        StatusSnapshot {
            run_id: state.run_id,
            status: state.status,
            running: state.status.is_active(),
            progress: state.progress,
            total: state.total,
            cancelled: state.cancelled,
            last_error: state.last_error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            awaiting_curation: shared.curation.is_some(),
            results_count: state.results.len(),
            observers: shared.bus.subscriber_count(),
            logs: state.logs.clone(),
        }
    }

    pub async fn results(&self) -> IndexMap<String, Vec<String>> {
        self.inner.shared.lock().await.state.results.clone()
    }

    /// Releases a run waiting in the curation stage.
    pub async fn submit_curation(
        &self,
        selections: HashMap<String, Selection>,
    ) -> Result<(), PipelineError> {
        let sender = self.inner.shared.lock().await.curation.take();
        let Some(sender) = sender else {
            return Err(PipelineError::conflict(
                "curation",
                "No pipeline run is awaiting curation.",
            ));
        };
        sender
            .send(selections)
            .map_err(|_| PipelineError::conflict("curation", "The awaiting run has ended."))
    }

    async fn open_curation_gate(&self, sender: oneshot::Sender<HashMap<String, Selection>>) {
        self.inner.shared.lock().await.curation = Some(sender);
    }

    async fn close_curation_gate(&self) {
        self.inner.shared.lock().await.curation = None;
    }

    /// Loads the last snapshot. A run that was still active when the process
    /// stopped is recorded as an error.
    pub async fn restore(&self) -> Result<Option<PipelineStatus>, SnapshotError> {
        let Some(mut state) = self.inner.snapshots.load().await? else {
            return Ok(None);
        };
        let mut shared = self.inner.shared.lock().await;
        if shared.state.status.is_active() {
            return Ok(Some(shared.state.status));
        }
        if state.status.is_active() {
            warn!(
                target = "catalog.pipeline",
                run_id = ?state.run_id,
                "previous pipeline run was interrupted"
            );
            state
                .logs
                .push("Pipeline interrupted before completion.".to_string());
            state.status = PipelineStatus::Error;
            state.last_error = Some("interrupted".to_string());
            state.finished_at = Some(Utc::now());
            self.save_snapshot(&state).await;
        }
        shared.bus.clear_history();
        for line in &state.logs {
            shared.bus.publish(PipelineEvent::Log(line.clone()));
        }
        if !state.results.is_empty() {
            let records = state
                .results
                .iter()
                .map(|(sku, images)| {
                    CatalogRecord::new(sku.clone()).with_images(images.iter().cloned())
                })
                .collect();
            shared.bus.publish(PipelineEvent::Results(records));
        }
        shared.bus.publish(status_event(&state));
        let status = state.status;
        shared.state = state;
        Ok(Some(status))
    }
}

fn status_event(state: &PipelineState) -> PipelineEvent {
    PipelineEvent::Status(StatusUpdate {
        status: state.status,
        progress: state.progress,
        total: state.total,
    })
}

/// Splits on commas and newlines, trims, and drops blanks and repeats of an
/// already seen SKU.
pub fn clean_skus(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .flat_map(|chunk| chunk.split([',', '\n', '\r']))
        .map(str::trim)
        .filter(|sku| !sku.is_empty())
        .filter(|sku| {
            let key = normalize_sku(sku);
            !key.is_empty() && seen.insert(key)
        })
        .map(String::from)
        .collect()
}

use crate::{
    catalog::{CatalogFile, CatalogRecord},
    curation::review_entries,
    models::ApiError,
    upload::{UploadEngine, UploadResult},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Upload batches run one after another outside the pipeline.
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

struct Job {
    id: Uuid,
    skus: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        succeeded: usize,
        failed: usize,
        truncated: usize,
        ignored: usize,
        results: Vec<UploadResult>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl UploadQueue {
    pub fn spawn(
        engine: UploadEngine,
        catalog: CatalogFile,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                statuses_bg.lock().await.insert(job.id, JobState::Running);
                let state = run_batch(&engine, &catalog, job.skus).await;
                if let JobState::Failed { error } = &state {
                    warn!(
                        target = "catalog.upload",
                        job_id = %job.id,
                        error = %error,
                        "upload batch failed"
                    );
                }
                statuses_bg.lock().await.insert(job.id, state);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, skus: Option<Vec<String>>) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        self.statuses.lock().await.insert(id, JobState::Queued);
        if self.tx.send(Job { id, skus }).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("upload worker not available".into()),
            });
        }
        info!(target = "catalog.upload", job_id = %id, "upload batch queued");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

async fn run_batch(
    engine: &UploadEngine,
    catalog: &CatalogFile,
    skus: Option<Vec<String>>,
) -> JobState {
    let file = catalog.clone();
    let store = match tokio::task::spawn_blocking(move || file.read()).await {
        Ok(Ok(store)) => store,
        Ok(Err(err)) => {
            return JobState::Failed {
                error: err.to_string(),
            };
        }
        Err(err) => {
            return JobState::Failed {
                error: err.to_string(),
            };
        }
    };
    let report = match skus {
        Some(skus) => {
            let records: Vec<CatalogRecord> = review_entries(&store, &skus);
            engine.upload_records(&records, None).await
        }
        None => engine.upload_catalog(&store).await,
    };
    JobState::Completed {
        succeeded: report.succeeded(),
        failed: report.failed(),
        truncated: report.truncated,
        ignored: report.ignored,
        results: report.results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::CatalogStore,
        upload::{
            AssetStore, AssetUpload, ProbeError, RemoteAsset, SourceProbe, UploadError,
            UploadSettings,
        },
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct OkProbe;

    #[async_trait]
    impl SourceProbe for OkProbe {
        async fn check(&self, _url: &str) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    struct EchoStore;

    #[async_trait]
    impl AssetStore for EchoStore {
        async fn upload(&self, request: &AssetUpload) -> Result<RemoteAsset, UploadError> {
            Ok(RemoteAsset {
                public_id: request.public_id.clone(),
                secure_url: request.source_url.clone(),
            })
        }
    }

    async fn wait_done(queue: &UploadQueue, id: Uuid) -> JobState {
        for _ in 0..200 {
            if let Some(info) = queue.get(id).await
                && matches!(info.state, JobState::Completed { .. } | JobState::Failed { .. })
            {
                return info.state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("upload batch never finished");
    }

    fn engine() -> UploadEngine {
        UploadEngine::new(
            Arc::new(EchoStore),
            Arc::new(OkProbe),
            UploadSettings {
                retry_delay: Duration::from_millis(1),
                ..UploadSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn batch_uploads_requested_skus() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogFile::new(dir.path().join("images.json"));
        catalog
            .persist(&CatalogStore::from_records([
                CatalogRecord::new("A-1").with_images(["https://x/a1.jpg", "https://x/a2.jpg"]),
                CatalogRecord::new("B-2").with_images(["https://x/b1.jpg"]),
            ]))
            .unwrap();
        let (queue, _worker) = UploadQueue::spawn(engine(), catalog, 4);

        let id = queue.enqueue(Some(vec!["a_1".into()])).await.unwrap();
        match wait_done(&queue, id).await {
            JobState::Completed {
                succeeded, failed, results, ..
            } => {
                assert_eq!((succeeded, failed), (2, 0));
                assert!(results.iter().all(|result| result.job.sku == "A-1"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(queue.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_catalog_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images.json");
        std::fs::write(&path, "{not json").unwrap();
        let (queue, _worker) = UploadQueue::spawn(engine(), CatalogFile::new(path), 4);
        let id = queue.enqueue(None).await.unwrap();
        assert!(matches!(wait_done(&queue, id).await, JobState::Failed { .. }));
    }
}

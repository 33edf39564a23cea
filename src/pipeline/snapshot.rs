use super::state::PipelineState;
use async_trait::async_trait;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

const REDIS_KEY: &str = "catalog:pipeline:state";
const REDIS_TIMEOUT: Duration = Duration::from_secs(1);
const REDIS_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("snapshot redis failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("snapshot save exceeded {0:?}")]
    TimedOut(Duration),
    #[error("snapshot store unavailable; retrying later")]
    Unavailable,
}

/// Durable copy of the latest [`PipelineState`].
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, state: &PipelineState) -> Result<(), SnapshotError>;
    async fn load(&self) -> Result<Option<PipelineState>, SnapshotError>;
}

/// JSON file replaced through a temporary sibling.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "pipeline_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, state: &PipelineState) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_vec_pretty(state)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        tokio::fs::write(&staging, encoded).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<PipelineState>, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// One shared multiplexed connection. After a failed or slow command the
/// store reports [`SnapshotError::Unavailable`] until `retry_after` passes.
pub struct RedisSnapshotStore {
    client: redis::Client,
    key: String,
    retry_after: Duration,
    link: Mutex<RedisLink>,
}

#[derive(Default)]
struct RedisLink {
    conn: Option<MultiplexedConnection>,
    down_until: Option<Instant>,
}

impl RedisSnapshotStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            key: REDIS_KEY.to_string(),
            retry_after: REDIS_RETRY_AFTER,
            link: Mutex::new(RedisLink::default()),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, SnapshotError> {
        let mut link = self.link.lock().await;
        if let Some(conn) = &link.conn {
            return Ok(conn.clone());
        }
        if link.down_until.is_some_and(|until| Instant::now() < until) {
            return Err(SnapshotError::Unavailable);
        }
        let opened = tokio::time::timeout(
            REDIS_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await;
        match opened {
            Ok(Ok(conn)) => {
                link.down_until = None;
                link.conn = Some(conn.clone());
                Ok(conn)
            }
            Ok(Err(err)) => {
                link.down_until = Some(Instant::now() + self.retry_after);
                Err(err.into())
            }
            Err(_) => {
                link.down_until = Some(Instant::now() + self.retry_after);
                Err(SnapshotError::TimedOut(REDIS_TIMEOUT))
            }
        }
    }

    async fn command<T, Fut>(&self, fut: Fut) -> Result<T, SnapshotError>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let err = match tokio::time::timeout(REDIS_TIMEOUT, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => SnapshotError::Redis(err),
            Err(_) => SnapshotError::TimedOut(REDIS_TIMEOUT),
        };
        let mut link = self.link.lock().await;
        link.conn = None;
        link.down_until = Some(Instant::now() + self.retry_after);
        warn!(target = "catalog.pipeline", error = %err, "redis snapshot link reset");
        Err(err)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save(&self, state: &PipelineState) -> Result<(), SnapshotError> {
        let json = serde_json::to_string(state)?;
        let mut conn = self.connection().await?;
        self.command(async { conn.set(&self.key, json).await }).await
    }

    async fn load(&self) -> Result<Option<PipelineState>, SnapshotError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self
            .command(async { conn.get(&self.key).await })
            .await?;
        raw.map(|value| serde_json::from_str(&value).map_err(SnapshotError::from))
            .transpose()
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemorySnapshotStore {
    latest: Mutex<Option<PipelineState>>,
    saves: Mutex<usize>,
}

#[cfg(test)]
impl MemorySnapshotStore {
    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[cfg(test)]
#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, state: &PipelineState) -> Result<(), SnapshotError> {
        *self.latest.lock().await = Some(state.clone());
        *self.saves.lock().await += 1;
        Ok(())
    }

    async fn load(&self) -> Result<Option<PipelineState>, SnapshotError> {
        Ok(self.latest.lock().await.clone())
    }
}

/// Redis when `redis_url` opens, otherwise a file under `work_dir`.
pub fn snapshot_store_for(redis_url: Option<&str>, work_dir: &Path) -> Arc<dyn SnapshotStore> {
    if let Some(url) = redis_url
        && let Ok(client) = redis::Client::open(url)
    {
        info!(target = "catalog.pipeline", "pipeline snapshots stored in redis");
        return Arc::new(RedisSnapshotStore::new(client));
    }
    let path = work_dir.join("files").join("pipeline_state.json");
    info!(
        target = "catalog.pipeline",
        path = %path.display(),
        "pipeline snapshots stored on disk"
    );
    Arc::new(FileSnapshotStore::new(path))
}

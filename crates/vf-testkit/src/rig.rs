//! The scenario rig: one struct wiring DB + Redis queue + in-memory bus +
//! fake transcoder into a runnable slice of the platform.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

use vf_bus::MemoryEventBus;
use vf_config::AppConfig;
use vf_db::{NewAsset, NewUser};
use vf_queue::{JobQueue, QueueConfig};
use vf_schemas::{AssetKind, OperationStatus, UserTier};
use vf_worker::handler::WorkerHandler;

use crate::transcoder::{FakeTranscoder, TranscoderBehavior};

pub struct TestRig {
    pub pool: PgPool,
    pub queue: JobQueue,
    pub bus: Arc<MemoryEventBus>,
    pub cfg: Arc<AppConfig>,
    pub storage: TempDir,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    _transcoder: FakeTranscoder,
}

impl TestRig {
    /// Build a rig. Requires `VF_DATABASE_URL` and `VF_REDIS_URL`; queue
    /// keys are namespaced per rig, retries are fast (100 ms backoff) so
    /// scenarios finish in seconds.
    pub async fn new(behavior: TranscoderBehavior) -> Result<Self> {
        let pool = vf_db::testkit_db_pool().await?;

        let storage = tempfile::tempdir().context("rig storage dir")?;
        let transcoder = FakeTranscoder::new(behavior)?;

        let redis_url =
            std::env::var("VF_REDIS_URL").context("rig requires VF_REDIS_URL")?;

        let cfg = Arc::new(AppConfig {
            database_url: std::env::var(vf_db::ENV_DB_URL).unwrap_or_default(),
            db_pool_size: 5,
            redis_url: redis_url.clone(),
            amqp_url: "amqp://unused-in-tests".to_string(),
            storage_root: storage.path().to_string_lossy().into_owned(),
            queue_concurrency: 2,
            job_attempts: 3,
            job_timeout: Duration::from_secs(5),
            image_job_timeout: Duration::from_secs(5),
            dispatch_interval: Duration::from_millis(50),
            dispatch_batch: 10,
            dispatch_lease_secs: 60,
            dispatch_max_attempts: 5,
            janitor_interval: Duration::from_secs(1800),
            reservation_ttl: Duration::from_secs(1800),
            max_upload_mb_free: 50,
            max_upload_mb_pro: 500,
            transcoder_bin: transcoder.bin_path(),
            cost_map: Default::default(),
            daemon_addr: None,
        });

        let queue = JobQueue::connect(
            &redis_url,
            QueueConfig {
                prefix: format!("vfq-rig-{}", Uuid::new_v4().simple()),
                attempts: cfg.job_attempts,
                lease: Duration::from_secs(5),
                backoff_base: Duration::from_millis(100),
                max_stalls: 2,
                completed_retention: 100,
                failed_retention: 200,
            },
        )
        .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            pool,
            queue,
            bus: Arc::new(MemoryEventBus::new()),
            cfg,
            storage,
            shutdown_tx,
            shutdown_rx,
            _transcoder: transcoder,
        })
    }

    /// Seed a user and a video asset with a real (non-empty) source file.
    pub async fn seed_user_with_video(&self, credits: i64) -> Result<(Uuid, Uuid)> {
        let user_id = Uuid::new_v4();
        vf_db::insert_user(
            &self.pool,
            &NewUser {
                user_id,
                email: format!("{user_id}@rig.test"),
                tier: UserTier::Free,
                initial_credits: credits,
            },
        )
        .await?;

        let asset_id = Uuid::new_v4();
        vf_db::insert_video(
            &self.pool,
            &NewAsset {
                asset_id,
                user_id,
                name: "clip.mp4".into(),
                format: "mp4".into(),
                width: Some(1920),
                height: Some(1080),
                size_bytes: 16,
                metadata: json!({}),
            },
        )
        .await?;

        let dir = self.storage.path().join(asset_id.to_string());
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("original.mp4"), b"fake mp4 payload")?;

        Ok((user_id, asset_id))
    }

    /// Start worker processing loops for all job types (rig concurrency).
    pub fn start_workers(&self) {
        let handler: Arc<dyn vf_queue::JobHandler> = Arc::new(WorkerHandler::new(
            self.pool.clone(),
            Arc::clone(&self.cfg),
        ));
        for op_type in vf_schemas::OperationType::ALL {
            tokio::spawn(vf_queue::process(
                self.queue.clone(),
                op_type,
                self.cfg.queue_concurrency,
                Arc::clone(&handler),
                self.shutdown_rx.clone(),
            ));
        }
    }

    /// Stop the worker loops.
    pub fn stop_workers(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Poll until the operation reaches `status` (or time out).
    pub async fn wait_for_status(
        &self,
        kind: AssetKind,
        operation_id: Uuid,
        status: OperationStatus,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let op = vf_db::fetch_operation(&self.pool, kind, operation_id).await?;
            if op.map(|o| o.status) == Some(status) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("operation {operation_id} did not reach {status:?} in time");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Drain the outbox into the in-memory bus until nothing is claimable.
    pub async fn drain_outbox(&self) -> Result<()> {
        for _ in 0..100 {
            let report = vf_runtime::dispatch_once(
                &self.pool,
                self.bus.as_ref(),
                &self.cfg,
                "rig-dispatcher",
            )
            .await?;
            if report.claimed == 0 {
                return Ok(());
            }
        }
        anyhow::bail!("outbox refused to drain");
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

//! The queue handler: operation gating, pre/post-flight, transcoder run,
//! finalization.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use vf_config::AppConfig;
use vf_jobs::{finalize_failure, finalize_success};
use vf_queue::{HandlerError, JobContext, JobHandler, QueuedJob};
use vf_schemas::{OperationParameters, OperationStatus};

use crate::transcoder::{build_args, run_transcoder, TranscodeError};

/// Progress throttle: forward when the percentage moved ≥5 points or 2 s
/// passed since the last emit.
pub(crate) struct ProgressThrottle {
    last_pct: Option<u8>,
    last_emit: Instant,
}

impl ProgressThrottle {
    pub(crate) fn new() -> Self {
        Self {
            last_pct: None,
            last_emit: Instant::now(),
        }
    }

    pub(crate) fn should_emit(&mut self, pct: u8) -> bool {
        let moved = match self.last_pct {
            None => true,
            Some(prev) => pct >= prev.saturating_add(5),
        };
        let due = self.last_emit.elapsed().as_secs() >= 2;
        if moved || due {
            self.last_pct = Some(pct);
            self.last_emit = Instant::now();
            return true;
        }
        false
    }
}

pub struct WorkerHandler {
    pool: PgPool,
    cfg: Arc<AppConfig>,
}

impl WorkerHandler {
    pub fn new(pool: PgPool, cfg: Arc<AppConfig>) -> Self {
        Self { pool, cfg }
    }

    async fn run_inner(&self, job: &QueuedJob, ctx: &JobContext) -> Result<String, HandlerError> {
        let payload = &job.envelope.payload;
        let kind = payload.asset_kind;
        let operation_id = payload.operation_id;

        // 1. Gate on the operation row; a missing or terminal operation
        //    means some other path already settled this job.
        let op = vf_db::fetch_operation(&self.pool, kind, operation_id)
            .await
            .map_err(|e| HandlerError::Retryable(format!("operation load failed: {e}")))?;
        let Some(op) = op else {
            warn!(operation_id = %operation_id, "job for missing operation; completing as no-op");
            return Ok(String::new());
        };
        match op.status {
            OperationStatus::Completed => {
                return Ok(op.result_path.unwrap_or_default());
            }
            OperationStatus::Failed => {
                return Ok(String::new());
            }
            // A redelivered job (lease expiry, restart recovery) finds the
            // row already processing; resume rather than bail.
            OperationStatus::Processing => {}
            OperationStatus::Pending => {
                vf_db::update_status(
                    &self.pool,
                    kind,
                    operation_id,
                    OperationStatus::Processing,
                    None,
                    None,
                )
                .await
                .map_err(|e| HandlerError::Retryable(format!("status update failed: {e}")))?;
            }
        }

        // 2. Pre-flight: source must exist and be non-empty.
        let source = PathBuf::from(&payload.source_path);
        check_nonempty(&source)
            .map_err(|e| HandlerError::Terminal(format!("pre-flight failed: {e}")))?;

        // 3. Run the transcoder with throttled progress forwarding.
        let output = output_path(&source, &payload.parameters);
        let args = build_args(
            &payload.source_path,
            &output.to_string_lossy(),
            &payload.parameters,
        );
        let timeout = self.cfg.timeout_for(payload.op_type);

        let (progress_tx, mut progress_rx) = mpsc::channel::<u8>(32);
        let forwarder = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut throttle = ProgressThrottle::new();
                while let Some(pct) = progress_rx.recv().await {
                    if throttle.should_emit(pct) {
                        ctx.progress(pct).await;
                    }
                }
            })
        };

        let run = run_transcoder(&self.cfg.transcoder_bin, &args, timeout, progress_tx).await;
        let _ = forwarder.await;

        if let Err(e) = run {
            return Err(if e.is_terminal() {
                HandlerError::Terminal(e.to_string())
            } else {
                HandlerError::Retryable(e.to_string())
            });
        }

        // 4. Post-flight: output must exist and be non-empty.
        check_nonempty(&output)
            .map_err(|e| HandlerError::Terminal(format!("post-flight failed: {e}")))?;

        // 5. Finalize: completed + capture + job.completed, one tx.
        let result_path = output.to_string_lossy().into_owned();
        finalize_success(
            &self.pool,
            kind,
            operation_id,
            &result_path,
            job.envelope.trace.correlation_id,
        )
        .await
        .map_err(|e| HandlerError::Retryable(format!("finalize failed: {e}")))?;

        info!(operation_id = %operation_id, result_path, "job finished");
        Ok(result_path)
    }
}

#[async_trait::async_trait]
impl JobHandler for WorkerHandler {
    async fn run(&self, job: &QueuedJob, ctx: &JobContext) -> Result<String, HandlerError> {
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            operation_id = %job.envelope.payload.operation_id,
            op_type = job.envelope.payload.op_type.as_str(),
            correlation_id = %job.envelope.trace.correlation_id,
        );
        self.run_inner(job, ctx).instrument(span).await
    }

    async fn on_terminal(&self, job: &QueuedJob, error: &str) {
        let payload = &job.envelope.payload;
        if let Err(e) = finalize_failure(
            &self.pool,
            payload.asset_kind,
            payload.operation_id,
            error,
            job.envelope.trace.correlation_id,
        )
        .await
        {
            // The janitor settles whatever this leaves behind.
            warn!(
                operation_id = %payload.operation_id,
                error = %e,
                "terminal finalization failed; janitor will reconcile"
            );
        }
    }
}

fn check_nonempty(path: &Path) -> Result<(), String> {
    match std::fs::metadata(path) {
        Ok(m) if m.len() > 0 => Ok(()),
        Ok(_) => Err(format!("{} is empty", path.display())),
        Err(e) => Err(format!("{}: {e}", path.display())),
    }
}

/// Derived output lands next to the source:
/// `<asset dir>/<derived-name>.<ext>`.
fn output_path(source: &Path, params: &OperationParameters) -> PathBuf {
    let source_format = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let dir = source.parent().unwrap_or_else(|| Path::new("."));
    dir.join(params.derived_name(source_format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_requires_five_points_or_two_seconds() {
        let mut t = ProgressThrottle::new();
        assert!(t.should_emit(0), "first sample always emits");
        assert!(!t.should_emit(2), "2 points is below the step");
        assert!(!t.should_emit(4));
        assert!(t.should_emit(5), "5 points past the last emit");
        assert!(!t.should_emit(7));
        assert!(t.should_emit(12));
    }

    #[test]
    fn output_path_uses_source_dir_and_derived_name() {
        let out = output_path(
            Path::new("/store/abc/original.mp4"),
            &OperationParameters::Resize {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!(out, Path::new("/store/abc/resized_1280x720.mp4"));

        let out = output_path(
            Path::new("/store/abc/original.mp4"),
            &OperationParameters::Convert {
                format: "webm".into(),
            },
        );
        assert_eq!(out, Path::new("/store/abc/converted.webm"));
    }

    #[test]
    fn preflight_rejects_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.mp4");
        assert!(check_nonempty(&missing).is_err());

        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        assert!(check_nonempty(&empty).is_err());

        let ok = dir.path().join("ok.mp4");
        std::fs::write(&ok, b"data").unwrap();
        assert!(check_nonempty(&ok).is_ok());
    }
}

//! External transcoder supervision.
//!
//! The transcoder is an opaque subprocess with a simple CLI contract:
//!
//! ```text
//! <bin> --input <src> --output <dst> --op <type> [--width N] [--height N]
//!       [--x N] [--y N] [--format F]
//! ```
//!
//! It reports progress as `progress=<pct>` lines on stderr; everything
//! else on stderr is captured (bounded tail) for diagnostics. The wall
//! clock is enforced here: on timeout the process is force-killed and the
//! error is terminal.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use vf_schemas::OperationParameters;

/// Lines of stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 40;

// ---------------------------------------------------------------------------
// TranscodeError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TranscodeError {
    /// Could not start the subprocess (missing binary, perms).
    Spawn(std::io::Error),
    /// Process exited non-zero.
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },
    /// Wall clock exceeded; the process was force-killed.
    Timeout { after: Duration },
    /// Supervision I/O failed mid-run.
    Io(std::io::Error),
}

impl TranscodeError {
    /// Timeouts are terminal (the retry would time out again); everything
    /// else is worth a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TranscodeError::Timeout { .. })
    }
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeError::Spawn(e) => write!(f, "transcoder spawn failed: {e}"),
            TranscodeError::NonZeroExit { code, stderr_tail } => write!(
                f,
                "transcoder exited with {}: {}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                stderr_tail.lines().last().unwrap_or("<no stderr>")
            ),
            TranscodeError::Timeout { after } => {
                write!(f, "transcoder timed out after {}s", after.as_secs())
            }
            TranscodeError::Io(e) => write!(f, "transcoder supervision io error: {e}"),
        }
    }
}

impl std::error::Error for TranscodeError {}

// ---------------------------------------------------------------------------
// Argument building
// ---------------------------------------------------------------------------

/// CLI arguments for one operation.
pub fn build_args(source: &str, output: &str, params: &OperationParameters) -> Vec<String> {
    let mut args = vec![
        "--input".to_string(),
        source.to_string(),
        "--output".to_string(),
        output.to_string(),
        "--op".to_string(),
        params.op_type().as_str().to_string(),
    ];

    match params {
        OperationParameters::Resize { width, height }
        | OperationParameters::ResizeImage { width, height } => {
            args.extend([
                "--width".into(),
                width.to_string(),
                "--height".into(),
                height.to_string(),
            ]);
        }
        OperationParameters::Crop {
            x,
            y,
            width,
            height,
        } => {
            args.extend([
                "--x".into(),
                x.to_string(),
                "--y".into(),
                y.to_string(),
                "--width".into(),
                width.to_string(),
                "--height".into(),
                height.to_string(),
            ]);
        }
        OperationParameters::Convert { format }
        | OperationParameters::ConvertImage { format } => {
            args.extend(["--format".into(), format.clone()]);
        }
    }

    args
}

/// Parse a `progress=<pct>` token out of a stderr line.
pub fn parse_progress(line: &str) -> Option<u8> {
    line.split_whitespace()
        .find_map(|tok| tok.strip_prefix("progress="))
        .and_then(|raw| raw.parse::<u16>().ok())
        .map(|pct| pct.min(100) as u8)
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TranscodeOutcome {
    pub stderr_tail: String,
}

/// Run the transcoder to completion under a wall-clock limit.
///
/// Progress percentages stream out on `progress_tx` as they are parsed;
/// the receiver side throttles. `kill_on_drop` covers supervisor panics;
/// the timeout path kills explicitly and reaps.
pub async fn run_transcoder(
    bin: &str,
    args: &[String],
    wall_clock: Duration,
    progress_tx: mpsc::Sender<u8>,
) -> Result<TranscodeOutcome, TranscodeError> {
    debug!(bin, ?args, "spawning transcoder");

    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TranscodeError::Spawn)?;

    let stderr = child.stderr.take().expect("stderr piped above");
    let reader = tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(pct) = parse_progress(&line) {
                // Receiver gone just means nobody watches progress.
                let _ = progress_tx.send(pct).await;
                continue;
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    });

    let status = match tokio::time::timeout(wall_clock, child.wait()).await {
        Err(_elapsed) => {
            let _ = child.start_kill();
            let _ = child.wait().await; // reap
            reader.abort();
            return Err(TranscodeError::Timeout { after: wall_clock });
        }
        Ok(Err(e)) => {
            reader.abort();
            return Err(TranscodeError::Io(e));
        }
        Ok(Ok(status)) => status,
    };

    let stderr_tail = reader.await.unwrap_or_default();

    if status.success() {
        Ok(TranscodeOutcome { stderr_tail })
    } else {
        Err(TranscodeError::NonZeroExit {
            code: status.code(),
            stderr_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse() {
        assert_eq!(parse_progress("progress=42"), Some(42));
        assert_eq!(parse_progress("frame=10 progress=7 speed=2x"), Some(7));
        assert_eq!(parse_progress("progress=250"), Some(100), "clamped");
        assert_eq!(parse_progress("progress=abc"), None);
        assert_eq!(parse_progress("no markers here"), None);
    }

    #[test]
    fn args_cover_each_operation_shape() {
        let args = build_args(
            "/in.mp4",
            "/out.mp4",
            &OperationParameters::Resize {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!(
            args,
            vec![
                "--input", "/in.mp4", "--output", "/out.mp4", "--op", "resize", "--width",
                "1280", "--height", "720"
            ]
        );

        let args = build_args(
            "/in.mp4",
            "/out.webm",
            &OperationParameters::Convert {
                format: "webm".into(),
            },
        );
        assert!(args.windows(2).any(|w| w == ["--format", "webm"]));

        let args = build_args(
            "/in.mp4",
            "/out.mp4",
            &OperationParameters::Crop {
                x: 10,
                y: 20,
                width: 300,
                height: 200,
            },
        );
        assert!(args.windows(2).any(|w| w == ["--x", "10"]));
        assert!(args.windows(2).any(|w| w == ["--y", "20"]));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let (tx, _rx) = mpsc::channel(8);
        let err = run_transcoder(
            "sleep",
            &["5".to_string()],
            Duration::from_millis(200),
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout { .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let (tx, _rx) = mpsc::channel(8);
        // `sh -c` stands in for a crashing transcoder.
        let err = run_transcoder(
            "sh",
            &[
                "-c".to_string(),
                "echo boom >&2; exit 3".to_string(),
            ],
            Duration::from_secs(5),
            tx,
        )
        .await
        .unwrap_err();
        match err {
            TranscodeError::NonZeroExit { code, stderr_tail } => {
                assert_eq!(code, Some(3));
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("expected NonZeroExit, got {other}"),
        }
    }

    #[tokio::test]
    async fn progress_streams_to_the_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let outcome = run_transcoder(
            "sh",
            &[
                "-c".to_string(),
                "echo progress=10 >&2; echo progress=60 >&2; echo done >&2".to_string(),
            ],
            Duration::from_secs(5),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await, Some(10));
        assert_eq!(rx.recv().await, Some(60));
        assert!(outcome.stderr_tail.contains("done"));
    }
}

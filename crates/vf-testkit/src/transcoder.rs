//! Deterministic fake transcoder.
//!
//! A small shell script honoring the worker's CLI contract
//! (`--input/--output/--op/...`, `progress=<pct>` on stderr). Behavior is
//! fixed at build time so a scenario knows exactly what the subprocess
//! will do.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderBehavior {
    /// Emit progress, copy input to output, exit 0.
    Succeed,
    /// Emit a diagnostic line and exit 1 without producing output.
    Crash,
    /// Produce an empty output file and exit 0 (post-flight trap).
    EmptyOutput,
    /// Sleep far beyond any test timeout (wall-clock trap).
    Hang,
}

pub struct FakeTranscoder {
    dir: TempDir,
    path: PathBuf,
}

impl FakeTranscoder {
    pub fn new(behavior: TranscoderBehavior) -> Result<Self> {
        let dir = tempfile::tempdir().context("fake transcoder tempdir")?;
        let path = dir.path().join("fake-transcoder.sh");

        let body = match behavior {
            TranscoderBehavior::Succeed => {
                r#"#!/bin/sh
in=""; out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --input) in="$2"; shift 2;;
    --output) out="$2"; shift 2;;
    *) shift;;
  esac
done
echo "progress=10" >&2
echo "progress=55" >&2
cp "$in" "$out" || exit 4
echo "progress=100" >&2
exit 0
"#
            }
            TranscoderBehavior::Crash => {
                r#"#!/bin/sh
echo "codec initialization failed" >&2
exit 1
"#
            }
            TranscoderBehavior::EmptyOutput => {
                r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2;;
    *) shift;;
  esac
done
: > "$out"
exit 0
"#
            }
            TranscoderBehavior::Hang => {
                r#"#!/bin/sh
sleep 3600
"#
            }
        };

        let mut f = std::fs::File::create(&path).context("write fake transcoder")?;
        f.write_all(body.as_bytes())?;
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .context("chmod fake transcoder")?;

        Ok(Self { dir, path })
    }

    /// Absolute path to hand to `VF_TRANSCODER_BIN` / `AppConfig`.
    pub fn bin_path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Keep the tempdir alive for the rig's lifetime.
    pub fn hold(&self) -> &TempDir {
        &self.dir
    }
}

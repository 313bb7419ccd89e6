//! vf-testkit
//!
//! In-process composition harness for end-to-end scenarios: real Postgres
//! and Redis (from `VF_DATABASE_URL` / `VF_REDIS_URL`), an in-memory bus
//! instead of AMQP, and a deterministic fake transcoder subprocess.

pub mod rig;
pub mod transcoder;

pub use rig::TestRig;
pub use transcoder::{FakeTranscoder, TranscoderBehavior};

//! vf-jobs
//!
//! The job lifecycle glue: submission (operation + reservation + outbox in
//! one transaction, then best-effort enqueue), the finalizer (status +
//! ledger settlement + outbox in one transaction), the reservation
//! janitor, and restart recovery.

pub mod finalize;
pub mod janitor;
pub mod recovery;
pub mod submit;

pub use finalize::{finalize_failure, finalize_success};
pub use janitor::{run_janitor_pass, JanitorReport};
pub use recovery::{recover_unqueued, RecoveryReport};
pub use submit::{submit, SubmitError, Submission, SubmissionOutcome};

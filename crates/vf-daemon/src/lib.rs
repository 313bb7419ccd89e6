//! vf-daemon library target.
//!
//! Exposes the router, state and fan-out tasks for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod fanout;
pub mod routes;
pub mod state;

pub use fanout::{spawn_bus_fanout, spawn_queue_fanout};
pub use routes::build_router;
pub use state::{AppState, SubscriptionRegistry};

//! Push operations, one module per task kind.
//!
//! Every push operation validates its arguments synchronously: on invalid
//! input it returns a [`PushError`](crate::error::PushError) and no task is
//! created, no callback ever fires. On success it builds the kind-specific
//! handler, attaches the caller's callback and payload, and enqueues the
//! task.

pub mod autoconfig;
pub mod dbscan;
pub mod decompress;
pub mod discovery;
pub mod http;
pub mod image;
pub mod screenshot;

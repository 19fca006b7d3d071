//! kiln-state — embedded audit record store for Kiln.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for audit records written by the local audit backend.
//!
//! Records are JSON-serialized into redb's `&[u8]` value column under a
//! key of `{unix_nanos:020}:{seq:010}`, so lexicographic order is
//! chronological and reverse scans return the newest records first.
//!
//! The `AuditStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::AuditStore;

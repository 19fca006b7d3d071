//! kiln-audit — best-effort audit recording for Kiln.
//!
//! The pipeline records business events (failed verdicts, provisioning
//! errors, promotion failures) through an [`Auditor`]. An auditor is either
//! disabled, in which case every call is a no-op, or wraps one
//! [`AuditSink`] backend. Sink failures are logged and swallowed; they
//! never reach the caller.
//!
//! # Backends
//!
//! ```text
//! Auditor
//!   ├── Disabled                 (no-op)
//!   └── Arc<dyn AuditSink>
//!       ├── ElasticsearchSink    (HTTP document indexing, bounded connect retry)
//!       ├── StoreSink            (local redb store via kiln-state)
//!       └── MemorySink           (in-process, for tests)
//! ```

pub mod auditor;
pub mod elasticsearch;
pub mod error;
pub mod memory;
pub mod store;

pub use auditor::{AuditReadiness, AuditSink, Auditor};
pub use elasticsearch::{ElasticsearchConfig, ElasticsearchSink};
pub use error::AuditError;
pub use memory::MemorySink;
pub use store::StoreSink;

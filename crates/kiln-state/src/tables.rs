//! redb table definitions for the Kiln audit store.

use redb::TableDefinition;

/// Audit records keyed by `{unix_nanos:020}:{seq:010}`.
pub const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

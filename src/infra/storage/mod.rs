// Store implementations: SQLite for deployments, DashMap for tests and
// ephemeral runs. All of them implement the ports defined in core.

pub mod in_memory;
pub mod sqlite_compliance_store;
pub mod sqlite_connection_store;
pub mod sqlite_generation_audit;
pub mod sqlite_pool;

pub use in_memory::{InMemoryComplianceStore, InMemoryConnectionStore, InMemoryGenerationAudit};
pub use sqlite_compliance_store::SqliteComplianceStore;
pub use sqlite_connection_store::SqliteConnectionStore;
pub use sqlite_generation_audit::SqliteGenerationAudit;
pub use sqlite_pool::open_pool;

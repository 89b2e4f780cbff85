// The core module contains all business logic.
// Each feature gets its own submodule; none of them know about HTTP or SQL.

#[path = "storage/mod.rs"]
pub mod storage;

#[path = "connections/mod.rs"]
pub mod connections;

#[path = "documents/mod.rs"]
pub mod documents;

#[path = "compliance/mod.rs"]
pub mod compliance;

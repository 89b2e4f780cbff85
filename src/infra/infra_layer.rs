// The infra module contains implementations of core traits.
// Stores and provider adapters each get their own submodule.

#[path = "storage/mod.rs"]
pub mod storage;

#[path = "providers/mod.rs"]
pub mod providers;

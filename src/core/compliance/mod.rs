pub mod compliance_models;
pub mod compliance_service;

pub use compliance_models::{AuditEntry, ComplianceRecord, ComplianceRules};
pub use compliance_service::{ComplianceStore, ComplianceTracker, MAX_RENEWAL_DAYS};

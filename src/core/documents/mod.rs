// Operations that work on documents in the user's own storage: search and
// template-driven generation.

pub mod generation_service;
pub mod search_service;
pub mod template_merge;

pub use generation_service::{
    DocumentTemplate, GenerationAuditEntry, GenerationAuditLog, GenerationDestination,
    GenerationPipeline,
};
pub use search_service::DocumentSearchGateway;
pub use template_merge::TemplateFormat;

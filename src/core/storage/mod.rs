// Shared storage vocabulary: models, errors, classification, the provider port
// and the chunked uploader. Every other core feature builds on this module.

pub mod classification;
pub mod provider;
pub mod storage_error;
pub mod storage_models;
pub mod upload;

#[cfg(test)]
pub mod test_support;

pub use classification::{classify_hints, compliance_status, ComplianceThresholds, ProviderFile};
pub use provider::{ProviderAdapter, ProviderRegistry, SearchOptions, TokenGrant, UploadTarget};
pub use storage_error::GatewayError;
pub use storage_models::{
    ComplianceStatus, ConnectionPermissions, DocType, Domain, KnowledgeDocumentMeta, OAuthTokens,
    Provider, StorageConnection, StoragePointer,
};
pub use upload::{ChunkedUploader, RetryPolicy, UploadSettings};

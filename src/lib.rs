pub mod batch;
pub mod cdn;
pub mod config;
pub mod http;
pub mod metrics;
pub mod models;
pub mod provenance;
pub mod shopify;
pub mod staged_upload;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use batch::{BatchCoordinator, BatchError};
pub use cdn::{CdnResolver, ResolutionError, ResolvedUrl, UrlSource};
pub use config::{ConfigError, UploaderConfig};
pub use models::{
    BatchResult, FailureKind, FailureReason, FileId, FileRecord, FileStatus, Provenance,
    ProvenanceRecord, ProvenanceState, SourceLocation, UploadRequest,
};
pub use provenance::{MetadataError, ProvenanceTracker};
pub use shopify::ShopifyClient;
pub use staged_upload::{StagedState, StagedUploadError, StagedUploadOrchestrator};
pub use transport::{Delivery, RateLimitPredicate, TransportError, TransportGovernor};

//! Stage, transfer, finalize.
//!
//! A [`StagedTarget`] lives for exactly one pass through [`StagedUploadOrchestrator::upload`]:
//! it is requested fresh, used for one transfer and consumed by finalize. A
//! stale or refused target sends the flow back to `Requested`; it is never
//! retried in place.

use crate::models::{FailureKind, FileRecord, MediaKind, StagedTarget};
use crate::shopify::{FileCreateInput, RequestError, ShopifyClient, StagedPayload};
use crate::transport::TransportError;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const TARGET: &str = "hermes.staged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedState {
    Requested,
    Transferred,
    Finalized,
    Failed,
}

#[derive(Debug, Error)]
pub enum StagedUploadError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("staged target request failed: {0}")]
    Request(#[source] RequestError),
    #[error("transfer to staged target failed: {0}")]
    Transfer(#[source] TransportError),
    #[error("staged target expired before transfer completed ({restarts} restart(s))")]
    Expired { restarts: u32 },
    #[error("finalize failed: {0}")]
    Finalize(#[source] RequestError),
}

impl StagedUploadError {
    /// The step that was in flight when the flow moved to `Failed`.
    pub fn failed_in(&self) -> StagedState {
        match self {
            StagedUploadError::EmptyPayload | StagedUploadError::Request(_) => StagedState::Requested,
            StagedUploadError::Transfer(_) | StagedUploadError::Expired { .. } => {
                StagedState::Transferred
            }
            StagedUploadError::Finalize(_) => StagedState::Finalized,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self.failed_in() {
            StagedState::Requested => "staged_request",
            StagedState::Transferred => "staged_transfer",
            StagedState::Finalized | StagedState::Failed => "staged_finalize",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StagedUploadError::EmptyPayload => FailureKind::Validation,
            StagedUploadError::Request(err) | StagedUploadError::Finalize(err) => err.kind(),
            StagedUploadError::Transfer(TransportError::Rejected { .. })
            | StagedUploadError::Expired { .. } => FailureKind::ProtocolExpiry,
            StagedUploadError::Transfer(_) => FailureKind::TransientTransport,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        match self {
            StagedUploadError::Request(err) | StagedUploadError::Finalize(err) => err.is_unreachable(),
            StagedUploadError::Transfer(err) => err.is_unreachable(),
            _ => false,
        }
    }
}

/// Why a target was abandoned.
enum Stale {
    Expired,
    Refused(TransportError),
}

#[derive(Clone)]
pub struct StagedUploadOrchestrator {
    client: ShopifyClient,
    ttl: Duration,
    max_restarts: u32,
}

impl StagedUploadOrchestrator {
    pub fn new(client: ShopifyClient, ttl: Duration, max_restarts: u32) -> Self {
        Self {
            client,
            ttl,
            max_restarts,
        }
    }

    pub async fn upload(
        &self,
        payload: &StagedPayload,
        alt: Option<String>,
    ) -> Result<FileRecord, StagedUploadError> {
        if payload.is_empty() {
            return Err(StagedUploadError::EmptyPayload);
        }
        let started = Instant::now();
        let mut restarts = 0;
        loop {
            let target = self
                .client
                .request_staged_target(payload, self.ttl)
                .await
                .map_err(StagedUploadError::Request)?;
            debug!(target: TARGET, filename = %payload.filename, state = ?StagedState::Requested, "staged_state");

            let stale = match self.transfer(&target, payload).await? {
                None => {
                    debug!(target: TARGET, filename = %payload.filename, state = ?StagedState::Transferred, "staged_state");
                    let record = self.finalize(target, payload, alt).await?;
                    crate::metrics::stage_elapsed("staged_upload", started.elapsed().as_millis());
                    info!(
                        target: TARGET,
                        filename = %payload.filename,
                        file_id = %record.id,
                        restarts,
                        "staged_upload_finalized"
                    );
                    return Ok(record);
                }
                Some(stale) => stale,
            };

            if restarts >= self.max_restarts {
                warn!(target: TARGET, filename = %payload.filename, restarts, state = ?StagedState::Failed, "staged_restart_budget_exhausted");
                return Err(match stale {
                    Stale::Expired => StagedUploadError::Expired { restarts },
                    Stale::Refused(err) => StagedUploadError::Transfer(err),
                });
            }
            restarts += 1;
            warn!(target: TARGET, filename = %payload.filename, restarts, "staged_restart_from_requested");
        }
    }

    /// `Some(Stale)` means the target can no longer be used and the flow
    /// restarts; any other transfer failure ends the upload.
    async fn transfer(
        &self,
        target: &StagedTarget,
        payload: &StagedPayload,
    ) -> Result<Option<Stale>, StagedUploadError> {
        if target.is_expired() {
            warn!(target: TARGET, expires_at = %target.expires_at, "staged_target_expired");
            return Ok(Some(Stale::Expired));
        }
        match self.client.transfer_to_target(target, payload).await {
            Ok(()) if target.is_expired() => {
                warn!(target: TARGET, expires_at = %target.expires_at, "staged_target_expired_during_transfer");
                Ok(Some(Stale::Expired))
            }
            Ok(()) => Ok(None),
            Err(
                err @ (TransportError::Timeout(_)
                | TransportError::Rejected { .. }
                | TransportError::Server { .. }),
            ) => {
                warn!(target: TARGET, error = %err, "staged_transfer_abandoned");
                Ok(Some(Stale::Refused(err)))
            }
            Err(err) => Err(StagedUploadError::Transfer(err)),
        }
    }

    async fn finalize(
        &self,
        target: StagedTarget,
        payload: &StagedPayload,
        alt: Option<String>,
    ) -> Result<FileRecord, StagedUploadError> {
        let mut input = FileCreateInput::new(
            target.resource_url,
            MediaKind::from_content_type(&payload.content_type),
        )
        .with_alt(alt);
        input.filename = Some(payload.filename.clone());
        self.client
            .create_file(&input)
            .await
            .map_err(StagedUploadError::Finalize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        MockCatalog, client_for, file_node, graphql_ok, staged_target_response,
    };
    use bytes::Bytes;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn payload() -> StagedPayload {
        StagedPayload {
            filename: "front.png".into(),
            content_type: "image/png".into(),
            data: Bytes::from_static(b"\x89PNG-bytes"),
        }
    }

    async fn mount_stage(catalog: &MockCatalog, times: u64) {
        Mock::given(method("POST"))
            .and(body_string_contains("HermesStagedUploadsCreate"))
            .respond_with(graphql_ok(staged_target_response(&catalog.server.uri())))
            .expect(times)
            .mount(&catalog.server)
            .await;
    }

    async fn mount_finalize(catalog: &MockCatalog, times: u64) {
        Mock::given(method("POST"))
            .and(body_string_contains("HermesFileCreate"))
            .and(body_string_contains("tmp/front.png"))
            .respond_with(graphql_ok(json!({
                "fileCreate": {
                    "files": [file_node("gid://shopify/MediaImage/55", Some("Front"), "UPLOADED")],
                    "userErrors": []
                }
            })))
            .expect(times)
            .mount(&catalog.server)
            .await;
    }

    #[tokio::test]
    async fn full_flow_finalizes_with_resource_url() {
        let catalog = MockCatalog::start().await;
        mount_stage(&catalog, 1).await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&catalog.server)
            .await;
        mount_finalize(&catalog, 1).await;

        let orchestrator =
            StagedUploadOrchestrator::new(catalog.client(), Duration::from_secs(300), 1);
        let record = orchestrator
            .upload(&payload(), Some("Front".into()))
            .await
            .expect("finalized");
        assert_eq!(record.id.as_str(), "gid://shopify/MediaImage/55");
        assert_eq!(record.descriptive_text.as_deref(), Some("Front"));
    }

    #[tokio::test]
    async fn expired_target_never_finalizes() {
        let catalog = MockCatalog::start().await;
        mount_stage(&catalog, 2).await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&catalog.server)
            .await;
        mount_finalize(&catalog, 0).await;

        let orchestrator = StagedUploadOrchestrator::new(catalog.client(), Duration::ZERO, 1);
        let err = orchestrator
            .upload(&payload(), None)
            .await
            .expect_err("expired");
        assert!(matches!(err, StagedUploadError::Expired { restarts: 1 }));
        assert_eq!(err.kind(), FailureKind::ProtocolExpiry);
        assert_eq!(err.failed_in(), StagedState::Transferred);
    }

    #[tokio::test]
    async fn refused_transfer_restarts_with_fresh_target() {
        let catalog = MockCatalog::start().await;
        mount_stage(&catalog, 2).await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Policy expired"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&catalog.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&catalog.server)
            .await;
        mount_finalize(&catalog, 1).await;

        let orchestrator =
            StagedUploadOrchestrator::new(catalog.client(), Duration::from_secs(300), 1);
        let record = orchestrator
            .upload(&payload(), Some("Front".into()))
            .await
            .expect("second target works");
        assert_eq!(record.id.as_str(), "gid://shopify/MediaImage/55");
    }

    #[tokio::test]
    async fn stage_rejection_is_terminal() {
        let catalog = MockCatalog::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("HermesStagedUploadsCreate"))
            .respond_with(graphql_ok(json!({
                "stagedUploadsCreate": {
                    "stagedTargets": null,
                    "userErrors": [{ "field": ["input"], "message": "Quota exceeded" }]
                }
            })))
            .expect(1)
            .mount(&catalog.server)
            .await;

        let orchestrator =
            StagedUploadOrchestrator::new(catalog.client(), Duration::from_secs(300), 3);
        let err = orchestrator
            .upload(&payload(), None)
            .await
            .expect_err("quota");
        assert_eq!(err.kind(), FailureKind::DomainUser);
        assert_eq!(err.failed_in(), StagedState::Requested);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_locally() {
        let catalog = MockCatalog::start().await;
        let orchestrator =
            StagedUploadOrchestrator::new(catalog.client(), Duration::from_secs(300), 1);
        let empty = StagedPayload {
            data: Bytes::new(),
            ..payload()
        };
        let err = orchestrator.upload(&empty, None).await.expect_err("empty");
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[tokio::test]
    async fn timed_out_transfer_is_sent_once_per_target() {
        let catalog = MockCatalog::start().await;
        let mut config = catalog.config();
        config.transport.call_timeout_secs = 1;
        mount_stage(&catalog, 2).await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(3)))
            .expect(2)
            .mount(&catalog.server)
            .await;
        mount_finalize(&catalog, 0).await;

        let orchestrator =
            StagedUploadOrchestrator::new(client_for(&config), Duration::from_secs(300), 1);
        let err = orchestrator
            .upload(&payload(), None)
            .await
            .expect_err("every transfer times out");
        assert!(matches!(
            err,
            StagedUploadError::Transfer(TransportError::Timeout(limit)) if limit == Duration::from_secs(1)
        ));
        assert_eq!(err.kind(), FailureKind::TransientTransport);
        assert_eq!(catalog.requests_containing("HermesStagedUploadsCreate").await, 2);
    }

    #[tokio::test]
    async fn server_error_on_transfer_restarts_instead_of_resending() {
        let catalog = MockCatalog::start().await;
        mount_stage(&catalog, 2).await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&catalog.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&catalog.server)
            .await;
        mount_finalize(&catalog, 1).await;

        let orchestrator =
            StagedUploadOrchestrator::new(catalog.client(), Duration::from_secs(300), 1);
        orchestrator
            .upload(&payload(), Some("Front".into()))
            .await
            .expect("fresh target accepts the bytes");
    }
}

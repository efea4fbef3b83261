use crate::config::ResolverConfig;
use crate::models::{FailureKind, FileRecord};
use crate::shopify::{RequestError, ShopifyClient};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const TARGET: &str = "hermes.cdn";
const ID_PLACEHOLDER: &str = "{id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlSource {
    /// Direct URL on the record the caller already had.
    Record,
    /// Direct URL after re-querying the file.
    Requeried,
    OriginalSource,
    Preview,
    Generic,
    /// `src` of an image attached through the REST surface.
    ProductImage,
    /// Built from the file id; nothing vouches for it.
    Constructed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    pub source: UrlSource,
    /// A reachability probe succeeded for this URL.
    pub verified: bool,
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no reachable url among {} candidate(s)", tried.len())]
    Ambiguous { tried: Vec<String> },
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ResolutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResolutionError::Ambiguous { .. } => FailureKind::ResolutionAmbiguity,
            ResolutionError::Request(err) => err.kind(),
        }
    }
}

#[derive(Clone)]
pub struct CdnResolver {
    client: ShopifyClient,
    config: ResolverConfig,
}

/// Candidates already probed, so each URL is checked at most once per resolve.
#[derive(Default)]
struct Attempts {
    tried: Vec<String>,
}

impl CdnResolver {
    pub fn new(client: ShopifyClient, config: ResolverConfig) -> Self {
        Self { client, config }
    }

    /// Finds a working public URL for `record`.
    ///
    /// Order: the record's direct URL when it is ready, the same after one
    /// re-query, the alternate URL fields, then the constructed pattern. A
    /// candidate that fails its probe is skipped.
    pub async fn resolve(&self, record: &FileRecord) -> Result<ResolvedUrl, ResolutionError> {
        self.resolve_inner(record, None).await
    }

    /// Like [`resolve`](Self::resolve), but attaches the file to `product_id`
    /// through REST before falling back to a constructed URL.
    pub async fn resolve_for_product(
        &self,
        record: &FileRecord,
        product_id: &str,
    ) -> Result<ResolvedUrl, ResolutionError> {
        self.resolve_inner(record, Some(product_id)).await
    }

    async fn resolve_inner(
        &self,
        record: &FileRecord,
        product_id: Option<&str>,
    ) -> Result<ResolvedUrl, ResolutionError> {
        let mut attempts = Attempts::default();

        if record.is_ready()
            && let Some(found) = self
                .try_candidate(&mut attempts, direct_url(record), UrlSource::Record)
                .await
        {
            return Ok(found);
        }

        let mut current = record.clone();
        sleep(Duration::from_millis(self.config.requery_delay_ms)).await;
        match self.client.query_file(&record.id).await {
            Ok(observed) => current.refresh(observed),
            Err(err @ RequestError::NotFound(_)) => return Err(err.into()),
            Err(err) => warn!(target: TARGET, file_id = %record.id, error = %err, "cdn_requery_failed"),
        }
        if current.is_ready()
            && let Some(found) = self
                .try_candidate(&mut attempts, direct_url(&current), UrlSource::Requeried)
                .await
        {
            return Ok(found);
        }

        let alternates = [
            (current.urls.original.clone(), UrlSource::OriginalSource),
            (current.urls.generic.clone(), UrlSource::Generic),
            (current.urls.image.clone(), UrlSource::Requeried),
            (current.urls.preview.clone(), UrlSource::Preview),
        ];
        for (url, source) in alternates {
            if let Some(found) = self.try_candidate(&mut attempts, url, source).await {
                return Ok(found);
            }
        }

        if let Some(product_id) = product_id
            && let Some(src) = current.urls.original.clone().or_else(|| attempts.tried.first().cloned())
        {
            match self
                .client
                .attach_product_image(product_id, &src, current.descriptive_text.as_deref())
                .await
            {
                Ok(image) => {
                    if let Some(found) = self
                        .try_candidate(&mut attempts, Some(image.src), UrlSource::ProductImage)
                        .await
                    {
                        return Ok(found);
                    }
                }
                Err(err) => {
                    warn!(target: TARGET, product_id, error = %err, "cdn_product_image_failed");
                }
            }
        }

        if let Some(url) = self.constructed(&current) {
            info!(target: TARGET, file_id = %record.id, %url, "cdn_constructed_unverified");
            return Ok(ResolvedUrl {
                url,
                source: UrlSource::Constructed,
                verified: false,
            });
        }

        warn!(
            target: TARGET,
            file_id = %record.id,
            tried = attempts.tried.len(),
            "cdn_resolution_ambiguous"
        );
        Err(ResolutionError::Ambiguous {
            tried: attempts.tried,
        })
    }

    async fn try_candidate(
        &self,
        attempts: &mut Attempts,
        url: Option<String>,
        source: UrlSource,
    ) -> Option<ResolvedUrl> {
        let url = url.filter(|url| !url.trim().is_empty())?;
        if attempts.tried.contains(&url) {
            return None;
        }
        attempts.tried.push(url.clone());

        if !self.config.probe {
            return Some(ResolvedUrl {
                url,
                source,
                verified: false,
            });
        }
        if self.probe(&url).await {
            debug!(target: TARGET, %url, ?source, "cdn_candidate_accepted");
            Some(ResolvedUrl {
                url,
                source,
                verified: true,
            })
        } else {
            debug!(target: TARGET, %url, ?source, "cdn_candidate_unreachable");
            None
        }
    }

    /// HEAD first; some CDNs refuse it, so fall back to GET.
    async fn probe(&self, url: &str) -> bool {
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let http = self.client.http();
        let status = match http.head(url).timeout(timeout).send().await {
            Ok(response) => response.status(),
            Err(err) => {
                debug!(target: TARGET, %url, error = %err, "cdn_probe_error");
                return false;
            }
        };
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            return match http.get(url).timeout(timeout).send().await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            };
        }
        status.is_success()
    }

    fn constructed(&self, record: &FileRecord) -> Option<String> {
        let template = self.config.url_template.as_deref()?;
        let id = record.id.numeric_tail()?;
        template
            .contains(ID_PLACEHOLDER)
            .then(|| template.replace(ID_PLACEHOLDER, id))
    }
}

fn direct_url(record: &FileRecord) -> Option<String> {
    record
        .urls
        .image
        .clone()
        .or_else(|| record.urls.generic.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileId, FileStatus, MediaUrls};
    use crate::test_support::{MockCatalog, graphql_ok};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn record(status: FileStatus, urls: MediaUrls) -> FileRecord {
        FileRecord {
            id: FileId::new("gid://shopify/MediaImage/4242"),
            status,
            descriptive_text: Some("Front".into()),
            created_at: None,
            dimensions: None,
            urls,
            errors: Vec::new(),
        }
    }

    fn resolver(catalog: &MockCatalog) -> CdnResolver {
        CdnResolver::new(catalog.client(), catalog.config().resolver)
    }

    async fn serve(catalog: &MockCatalog, asset: &str, status: u16) {
        Mock::given(path(asset.to_string()))
            .respond_with(ResponseTemplate::new(status))
            .mount(&catalog.server)
            .await;
    }

    async fn requery_returns(catalog: &MockCatalog, node: serde_json::Value) {
        Mock::given(method("POST"))
            .and(body_string_contains("HermesFileNode"))
            .respond_with(graphql_ok(json!({ "node": node })))
            .mount(&catalog.server)
            .await;
    }

    #[tokio::test]
    async fn ready_record_url_wins_without_requery() {
        let catalog = MockCatalog::start().await;
        serve(&catalog, "/cdn/front.jpg", 200).await;
        Mock::given(method("POST"))
            .and(body_string_contains("HermesFileNode"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&catalog.server)
            .await;

        let url = format!("{}/cdn/front.jpg", catalog.server.uri());
        let record = record(
            FileStatus::Ready,
            MediaUrls {
                image: Some(url.clone()),
                ..MediaUrls::default()
            },
        );
        let resolved = resolver(&catalog).resolve(&record).await.expect("resolved");
        assert_eq!(resolved.url, url);
        assert_eq!(resolved.source, UrlSource::Record);
        assert!(resolved.verified);
    }

    #[tokio::test]
    async fn unreachable_candidate_is_skipped_for_alternate() {
        let catalog = MockCatalog::start().await;
        let uri = catalog.server.uri();
        serve(&catalog, "/cdn/missing.jpg", 404).await;
        serve(&catalog, "/cdn/original.jpg", 200).await;
        requery_returns(
            &catalog,
            json!({
                "id": "gid://shopify/MediaImage/4242",
                "fileStatus": "READY",
                "image": { "url": format!("{uri}/cdn/missing.jpg"), "width": 10, "height": 10 },
                "originalSource": { "url": format!("{uri}/cdn/original.jpg") }
            }),
        )
        .await;

        let resolved = resolver(&catalog)
            .resolve(&record(FileStatus::Uploaded, MediaUrls::default()))
            .await
            .expect("resolved");
        assert_eq!(resolved.url, format!("{uri}/cdn/original.jpg"));
        assert_eq!(resolved.source, UrlSource::OriginalSource);
        assert!(resolved.verified);
    }

    #[tokio::test]
    async fn constructed_url_is_flagged_unverified() {
        let catalog = MockCatalog::start().await;
        requery_returns(
            &catalog,
            json!({ "id": "gid://shopify/MediaImage/4242", "fileStatus": "PROCESSING" }),
        )
        .await;
        let mut config = catalog.config().resolver;
        config.url_template = Some("https://cdn.example.com/files/{id}.jpg".into());

        let resolved = CdnResolver::new(catalog.client(), config)
            .resolve(&record(FileStatus::Uploaded, MediaUrls::default()))
            .await
            .expect("constructed");
        assert_eq!(resolved.url, "https://cdn.example.com/files/4242.jpg");
        assert_eq!(resolved.source, UrlSource::Constructed);
        assert!(!resolved.verified);
    }

    #[tokio::test]
    async fn nothing_reachable_is_ambiguous() {
        let catalog = MockCatalog::start().await;
        let uri = catalog.server.uri();
        serve(&catalog, "/cdn/gone.jpg", 404).await;
        requery_returns(
            &catalog,
            json!({
                "id": "gid://shopify/MediaImage/4242",
                "fileStatus": "READY",
                "image": { "url": format!("{uri}/cdn/gone.jpg") }
            }),
        )
        .await;

        let err = resolver(&catalog)
            .resolve(&record(FileStatus::Uploaded, MediaUrls::default()))
            .await
            .expect_err("ambiguous");
        assert_eq!(err.kind(), FailureKind::ResolutionAmbiguity);
        let ResolutionError::Ambiguous { tried } = err else {
            panic!("expected ambiguity");
        };
        assert_eq!(tried, vec![format!("{uri}/cdn/gone.jpg")]);
    }

    #[tokio::test]
    async fn product_image_is_tried_before_constructed() {
        let catalog = MockCatalog::start().await;
        let uri = catalog.server.uri();
        serve(&catalog, "/cdn/pending.jpg", 404).await;
        serve(&catalog, "/cdn/product.jpg", 200).await;
        requery_returns(
            &catalog,
            json!({
                "id": "gid://shopify/MediaImage/4242",
                "fileStatus": "PROCESSING",
                "originalSource": { "url": format!("{uri}/cdn/pending.jpg") }
            }),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-10/products/77/images.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "image": { "id": 1, "src": format!("{uri}/cdn/product.jpg") }
            })))
            .expect(1)
            .mount(&catalog.server)
            .await;
        let mut config = catalog.config().resolver;
        config.url_template = Some("https://cdn.example.com/files/{id}.jpg".into());

        let resolved = CdnResolver::new(catalog.client(), config)
            .resolve_for_product(&record(FileStatus::Uploaded, MediaUrls::default()), "77")
            .await
            .expect("resolved");
        assert_eq!(resolved.source, UrlSource::ProductImage);
        assert!(resolved.verified);
    }

    #[tokio::test]
    async fn missing_file_surfaces_request_error() {
        let catalog = MockCatalog::start().await;
        requery_returns(&catalog, serde_json::Value::Null).await;
        let err = resolver(&catalog)
            .resolve(&record(FileStatus::Uploaded, MediaUrls::default()))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), FailureKind::DomainUser);
    }
}

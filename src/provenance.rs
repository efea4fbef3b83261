use crate::models::{FailureKind, FileId, ProvenanceRecord};
use crate::shopify::{RequestError, ShopifyClient};
use thiserror::Error;
use tracing::{debug, warn};

const TARGET: &str = "hermes.provenance";
/// metafieldsSet accepts at most this many inputs per call.
const MAX_RECORDS_PER_CALL: usize = 25;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid provenance record `{key}`: {reason}")]
    Invalid { key: String, reason: &'static str },
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("provenance `{key}` read back as {found:?}, expected `{expected}`")]
    Mismatch {
        key: String,
        expected: String,
        found: Option<String>,
    },
}

impl MetadataError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MetadataError::Invalid { .. } => FailureKind::Validation,
            MetadataError::Request(err) => err.kind(),
            MetadataError::Mismatch { .. } => FailureKind::MetadataAttachment,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, MetadataError::Request(err) if err.is_unreachable())
    }
}

/// Structured provenance stored beside a file. Descriptive text is never
/// consulted: a record is found only through its (namespace, key) slot.
#[derive(Clone)]
pub struct ProvenanceTracker {
    client: ShopifyClient,
    namespace: String,
}

impl ProvenanceTracker {
    pub fn new(client: ShopifyClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Writes `records` onto `file`. Records sharing a (namespace, key) slot
    /// collapse to the last one, and the remote overwrites existing slots.
    pub async fn attach(
        &self,
        file: &FileId,
        records: &[ProvenanceRecord],
    ) -> Result<Vec<ProvenanceRecord>, MetadataError> {
        let records = collapse_slots(records);
        for record in &records {
            validate(record)?;
        }
        for chunk in records.chunks(MAX_RECORDS_PER_CALL) {
            self.client.set_metafields(file, chunk).await?;
        }
        debug!(target: TARGET, file_id = %file, count = records.len(), "provenance_attached");
        Ok(records)
    }

    pub async fn read(&self, file: &FileId) -> Result<Vec<ProvenanceRecord>, MetadataError> {
        Ok(self.client.file_metafields(file, &self.namespace).await?)
    }

    /// Reads `file` back and checks every expected slot holds the expected value.
    pub async fn verify(
        &self,
        file: &FileId,
        expected: &[ProvenanceRecord],
    ) -> Result<(), MetadataError> {
        let current = self.read(file).await?;
        for wanted in collapse_slots(expected) {
            let found = current.iter().find(|record| record.same_slot(&wanted));
            if found.map(|record| record.value.as_str()) != Some(wanted.value.as_str()) {
                warn!(target: TARGET, file_id = %file, key = %wanted.key, "provenance_mismatch");
                return Err(MetadataError::Mismatch {
                    key: wanted.key,
                    expected: wanted.value,
                    found: found.map(|record| record.value.clone()),
                });
            }
        }
        Ok(())
    }

    /// Files whose current `key` equals `value`.
    ///
    /// The remote search index can trail writes, so each hit is read back and
    /// kept only if the slot still holds `value`.
    pub async fn find_by_provenance(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<FileId>, MetadataError> {
        let candidates = self
            .client
            .search_files_by_metafield(&self.namespace, key, value)
            .await?;
        let mut matches: Vec<FileId> = Vec::new();
        for id in candidates {
            if matches.contains(&id) {
                continue;
            }
            let current = match self.client.file_metafields(&id, &self.namespace).await {
                Ok(records) => records,
                Err(RequestError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let holds = current.iter().any(|record| {
                record.namespace == self.namespace && record.key == key && record.value == value
            });
            if holds {
                matches.push(id);
            } else {
                debug!(target: TARGET, file_id = %id, key, "provenance_stale_search_hit");
            }
        }
        Ok(matches)
    }
}

fn collapse_slots(records: &[ProvenanceRecord]) -> Vec<ProvenanceRecord> {
    let mut slots: Vec<ProvenanceRecord> = Vec::with_capacity(records.len());
    for record in records {
        match slots.iter_mut().find(|slot| slot.same_slot(record)) {
            Some(slot) => *slot = record.clone(),
            None => slots.push(record.clone()),
        }
    }
    slots
}

fn validate(record: &ProvenanceRecord) -> Result<(), MetadataError> {
    let invalid = |reason| {
        Err(MetadataError::Invalid {
            key: record.key.clone(),
            reason,
        })
    };
    if !(3..=255).contains(&record.namespace.len()) {
        return invalid("namespace must be 3 to 255 characters");
    }
    if !(2..=64).contains(&record.key.len()) {
        return invalid("key must be 2 to 64 characters");
    }
    if !record
        .key
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return invalid("key may only contain letters, digits, `_` and `-`");
    }
    if record.value.trim().is_empty() {
        return invalid("value must not be blank");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KEY_EXTERNAL_CODE, KEY_PRODUCT_ID};
    use crate::test_support::{MetafieldStore, MockCatalog, graphql_ok};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::Mock;

    fn tracker(catalog: &MockCatalog) -> ProvenanceTracker {
        ProvenanceTracker::new(catalog.client(), "hermes")
    }

    fn upc(value: &str) -> ProvenanceRecord {
        ProvenanceRecord::text("hermes", KEY_EXTERNAL_CODE, value)
    }

    #[tokio::test]
    async fn reattaching_a_key_overwrites_instead_of_duplicating() {
        let catalog = MockCatalog::start().await;
        MetafieldStore::default().mount(&catalog.server).await;
        let tracker = tracker(&catalog);
        let file = FileId::new("gid://shopify/MediaImage/1");

        let written = tracker
            .attach(&file, &[upc("111"), upc("222")])
            .await
            .expect("attach");
        assert_eq!(written, vec![upc("222")]);

        tracker.attach(&file, &[upc("333")]).await.expect("attach");
        let current = tracker.read(&file).await.expect("read");
        assert_eq!(current, vec![upc("333")]);
    }

    #[tokio::test]
    async fn search_drops_files_whose_value_moved_on() {
        let catalog = MockCatalog::start().await;
        MetafieldStore::default().mount(&catalog.server).await;
        let tracker = tracker(&catalog);
        let first = FileId::new("gid://shopify/MediaImage/1");
        let second = FileId::new("gid://shopify/MediaImage/2");

        tracker.attach(&first, &[upc("A")]).await.expect("attach");
        tracker.attach(&second, &[upc("A")]).await.expect("attach");
        tracker.attach(&first, &[upc("B")]).await.expect("attach");

        assert_eq!(
            tracker.find_by_provenance(KEY_EXTERNAL_CODE, "A").await.expect("find"),
            vec![second.clone()]
        );
        assert_eq!(
            tracker.find_by_provenance(KEY_EXTERNAL_CODE, "B").await.expect("find"),
            vec![first]
        );
    }

    #[tokio::test]
    async fn invalid_key_is_rejected_before_any_call() {
        let catalog = MockCatalog::start().await;
        Mock::given(method("POST"))
            .respond_with(graphql_ok(json!({})))
            .expect(0)
            .mount(&catalog.server)
            .await;
        let err = tracker(&catalog)
            .attach(
                &FileId::new("gid://shopify/MediaImage/1"),
                &[ProvenanceRecord::text("hermes", "product id", "42")],
            )
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[tokio::test]
    async fn verify_reports_read_back_mismatch() {
        let catalog = MockCatalog::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("HermesFileMetafields"))
            .respond_with(graphql_ok(json!({
                "node": { "metafields": { "nodes": [
                    { "namespace": "hermes", "key": "product_id", "value": "41", "type": "single_line_text_field" }
                ]}}
            })))
            .mount(&catalog.server)
            .await;

        let err = tracker(&catalog)
            .verify(
                &FileId::new("gid://shopify/MediaImage/1"),
                &[ProvenanceRecord::text("hermes", KEY_PRODUCT_ID, "42")],
            )
            .await
            .expect_err("mismatch");
        assert_eq!(err.kind(), FailureKind::MetadataAttachment);
        assert!(matches!(
            err,
            MetadataError::Mismatch { found: Some(ref value), .. } if value == "41"
        ));
    }

    #[tokio::test]
    async fn rejected_write_surfaces_user_errors() {
        let catalog = MockCatalog::start().await;
        MetafieldStore::rejecting_writes().mount(&catalog.server).await;
        let err = tracker(&catalog)
            .attach(&FileId::new("gid://shopify/MediaImage/1"), &[upc("1")])
            .await
            .expect_err("rejected");
        assert!(matches!(err, MetadataError::Request(RequestError::UserErrors(_))));
    }
}

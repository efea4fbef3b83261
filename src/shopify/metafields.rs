use super::graphql::{RequestError, ShopifyClient, UserError};
use crate::models::{FileId, ProvenanceRecord};
use crate::transport::Delivery;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

const METAFIELDS_SET: &str = r#"
mutation HermesMetafieldsSet($metafields: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $metafields) {
    metafields { namespace key value type }
    userErrors { field message code }
  }
}
"#;

const FILE_METAFIELDS: &str = r#"
query HermesFileMetafields($id: ID!, $namespace: String) {
  node(id: $id) {
    ... on HasMetafields {
      metafields(first: 50, namespace: $namespace) {
        nodes { namespace key value type }
      }
    }
  }
}
"#;

const FILES_BY_METAFIELD: &str = r#"
query HermesFilesByMetafield($query: String!, $after: String) {
  files(first: 50, after: $after, query: $query) {
    nodes { id }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

const MAX_SEARCH_PAGES: usize = 20;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetInput<'a> {
    owner_id: &'a str,
    namespace: &'a str,
    key: &'a str,
    value: &'a str,
    #[serde(rename = "type")]
    value_type: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetData {
    metafields_set: Option<MetafieldsSetPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetPayload {
    #[serde(default)]
    metafields: Option<Vec<ProvenanceRecord>>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
struct FileMetafieldsData {
    node: Option<MetafieldOwner>,
}

#[derive(Deserialize)]
struct MetafieldOwner {
    #[serde(default)]
    metafields: Option<Connection<ProvenanceRecord>>,
}

#[derive(Deserialize)]
struct FilesData {
    files: Connection<IdNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
    #[serde(default)]
    page_info: Option<PageInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
struct IdNode {
    id: String,
}

impl ShopifyClient {
    /// Upserts each record on `owner`; the remote keys them by (namespace, key).
    pub async fn set_metafields(
        &self,
        owner: &FileId,
        records: &[ProvenanceRecord],
    ) -> Result<Vec<ProvenanceRecord>, RequestError> {
        let inputs: Vec<MetafieldsSetInput<'_>> = records
            .iter()
            .map(|record| MetafieldsSetInput {
                owner_id: owner.as_str(),
                namespace: &record.namespace,
                key: &record.key,
                value: &record.value,
                value_type: &record.value_type,
            })
            .collect();
        let data: MetafieldsSetData = self
            .graphql(
                "metafields_set",
                Delivery::Retryable,
                METAFIELDS_SET,
                json!({ "metafields": inputs }),
            )
            .await?;
        let payload = data
            .metafields_set
            .ok_or_else(|| RequestError::Decode("metafieldsSet payload missing".into()))?;
        if !payload.user_errors.is_empty() {
            return Err(RequestError::UserErrors(payload.user_errors));
        }
        Ok(payload.metafields.unwrap_or_default())
    }

    pub async fn file_metafields(
        &self,
        owner: &FileId,
        namespace: &str,
    ) -> Result<Vec<ProvenanceRecord>, RequestError> {
        let data: FileMetafieldsData = self
            .graphql(
                "file_metafields",
                Delivery::Retryable,
                FILE_METAFIELDS,
                json!({ "id": owner.as_str(), "namespace": namespace }),
            )
            .await?;
        let owner_node = data
            .node
            .ok_or_else(|| RequestError::NotFound(owner.to_string()))?;
        Ok(owner_node
            .metafields
            .map(|connection| connection.nodes)
            .unwrap_or_default())
    }

    /// Raw index lookup; results may lag recent writes.
    pub async fn search_files_by_metafield(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<FileId>, RequestError> {
        let query = metafield_search_query(namespace, key, value);
        let mut ids = Vec::new();
        let mut after: Option<String> = None;
        for page in 1..=MAX_SEARCH_PAGES {
            let data: FilesData = self
                .graphql(
                    "files_by_metafield",
                    Delivery::Retryable,
                    FILES_BY_METAFIELD,
                    json!({ "query": query, "after": after }),
                )
                .await?;
            ids.extend(data.files.nodes.into_iter().map(|node| FileId::new(node.id)));
            let Some(PageInfo {
                has_next_page: true,
                end_cursor: Some(cursor),
            }) = data.files.page_info
            else {
                return Ok(ids);
            };
            if page == MAX_SEARCH_PAGES {
                warn!(
                    target: "hermes.shopify",
                    namespace,
                    key,
                    hits = ids.len(),
                    pages = page,
                    "metafield_search_truncated"
                );
                break;
            }
            after = Some(cursor);
        }
        Ok(ids)
    }
}

pub(crate) fn metafield_search_query(namespace: &str, key: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("metafields.{namespace}.{key}:\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCatalog, graphql_ok};
    use wiremock::Mock;
    use wiremock::matchers::{body_string_contains, method};

    #[test]
    fn search_query_quotes_value() {
        assert_eq!(
            metafield_search_query("hermes", "upc", "0123 \"A\""),
            r#"metafields.hermes.upc:"0123 \"A\"""#
        );
    }

    #[tokio::test]
    async fn search_stops_at_the_page_cap() {
        let catalog = MockCatalog::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("HermesFilesByMetafield"))
            .respond_with(graphql_ok(json!({
                "files": {
                    "nodes": [{ "id": "gid://shopify/MediaImage/7" }],
                    "pageInfo": { "hasNextPage": true, "endCursor": "next" }
                }
            })))
            .expect(MAX_SEARCH_PAGES as u64)
            .mount(&catalog.server)
            .await;

        let ids = catalog
            .client()
            .search_files_by_metafield("hermes", "upc", "A")
            .await
            .expect("search");
        assert_eq!(ids.len(), MAX_SEARCH_PAGES);
    }
}

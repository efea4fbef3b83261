use super::graphql::{RequestError, ShopifyClient, UserError};
use crate::models::{MediaKind, StagedTarget};
use crate::transport::{self, Delivery, TransportError};
use bytes::Bytes;
use chrono::Utc;
use reqwest::{
    Body,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const STAGED_UPLOADS_CREATE: &str = r#"
mutation HermesStagedUploadsCreate($input: [StagedUploadInput!]!) {
  stagedUploadsCreate(input: $input) {
    stagedTargets {
      url
      resourceUrl
      parameters { name value }
    }
    userErrors { field message }
  }
}
"#;

/// The object field the signer expects after its own parameters.
const FILE_FIELD: &str = "file";

#[derive(Debug, Clone)]
pub struct StagedPayload {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

impl StagedPayload {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StagedUploadInput<'a> {
    filename: &'a str,
    mime_type: &'a str,
    http_method: &'static str,
    resource: &'static str,
    file_size: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedUploadsData {
    staged_uploads_create: Option<StagedUploadsPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedUploadsPayload {
    #[serde(default)]
    staged_targets: Option<Vec<StagedTargetNode>>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedTargetNode {
    url: Option<String>,
    resource_url: Option<String>,
    #[serde(default)]
    parameters: Vec<StagedParameter>,
}

#[derive(Deserialize)]
struct StagedParameter {
    name: String,
    value: String,
}

fn staged_resource(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "IMAGE",
        MediaKind::Video => "VIDEO",
        MediaKind::File => "FILE",
    }
}

impl ShopifyClient {
    /// Asks the signer for a fresh upload slot valid for `ttl`.
    pub async fn request_staged_target(
        &self,
        payload: &StagedPayload,
        ttl: Duration,
    ) -> Result<StagedTarget, RequestError> {
        let input = StagedUploadInput {
            filename: &payload.filename,
            mime_type: &payload.content_type,
            http_method: "POST",
            resource: staged_resource(MediaKind::from_content_type(&payload.content_type)),
            file_size: payload.len().to_string(),
        };
        let data: StagedUploadsData = self
            .graphql(
                "staged_uploads_create",
                Delivery::Retryable,
                STAGED_UPLOADS_CREATE,
                json!({ "input": [input] }),
            )
            .await?;
        let payload = data
            .staged_uploads_create
            .ok_or_else(|| RequestError::Decode("stagedUploadsCreate payload missing".into()))?;
        if !payload.user_errors.is_empty() {
            return Err(RequestError::UserErrors(payload.user_errors));
        }
        let node = payload
            .staged_targets
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| RequestError::Decode("no staged target returned".into()))?;
        let (Some(target_url), Some(resource_url)) = (node.url, node.resource_url) else {
            return Err(RequestError::Decode("staged target without url".into()));
        };
        let lifetime = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(StagedTarget {
            target_url,
            resource_url,
            parameters: node
                .parameters
                .into_iter()
                .map(|param| (param.name, param.value))
                .collect(),
            expires_at: Utc::now() + lifetime,
        })
    }

    /// Posts the bytes to the signed target. Parameters go first, in the
    /// signer's order and unmodified, then the payload as the final field.
    ///
    /// Timeouts and server errors are never replayed against the same target.
    pub async fn transfer_to_target(
        &self,
        target: &StagedTarget,
        payload: &StagedPayload,
    ) -> Result<(), TransportError> {
        debug!(
            target: "hermes.shopify",
            fields = target.parameters.len(),
            bytes = payload.len(),
            "staged_transfer_started"
        );
        self.governor()
            .execute("staged_transfer", Delivery::AtMostOnce, || {
                let request = self
                    .http()
                    .post(&target.target_url)
                    .multipart(signed_form(target, payload));
                transport::send(request)
            })
            .await?;
        Ok(())
    }
}

pub(crate) fn signed_form(target: &StagedTarget, payload: &StagedPayload) -> Form {
    let form = target
        .parameters
        .iter()
        .fold(Form::new(), |form, (name, value)| {
            form.text(name.clone(), value.clone())
        });
    form.part(FILE_FIELD, file_part(payload))
}

fn file_part(payload: &StagedPayload) -> Part {
    let build = || {
        Part::stream_with_length(Body::from(payload.data.clone()), payload.len() as u64)
            .file_name(payload.filename.clone())
    };
    build()
        .mime_str(&payload.content_type)
        .unwrap_or_else(|_| build())
}

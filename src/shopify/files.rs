use super::graphql::{RequestError, ShopifyClient, UserError};
use crate::models::{FileId, FileRecord, FileStatus, MediaDimensions, MediaKind, MediaUrls};
use crate::transport::Delivery;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Code attached to inputs the remote silently dropped.
pub const NOT_RETURNED: &str = "NOT_RETURNED";

pub(crate) const FILE_FIELDS: &str = r#"
fragment HermesFileFields on File {
  id
  fileStatus
  alt
  createdAt
  fileErrors { code message details }
  preview { image { url } }
  ... on MediaImage {
    image { url width height }
    originalSource { url }
  }
  ... on GenericFile {
    url
  }
}
"#;

const FILE_CREATE: &str = r#"
mutation HermesFileCreate($files: [FileCreateInput!]!) {
  fileCreate(files: $files) {
    files { ...HermesFileFields }
    userErrors { field message code }
  }
}
"#;

const FILE_NODE: &str = r#"
query HermesFileNode($id: ID!) {
  node(id: $id) { ...HermesFileFields }
}
"#;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCreateInput {
    pub original_source: String,
    pub content_type: MediaKind,
    pub alt: Option<String>,
    pub filename: Option<String>,
}

impl FileCreateInput {
    pub fn new(original_source: impl Into<String>, content_type: MediaKind) -> Self {
        Self {
            original_source: original_source.into(),
            content_type,
            alt: None,
            filename: None,
        }
    }

    pub fn with_alt(mut self, alt: Option<String>) -> Self {
        self.alt = alt.filter(|text| !text.trim().is_empty());
        self
    }
}

pub type CreateSlot = Result<FileRecord, Vec<UserError>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileNode {
    id: String,
    #[serde(default)]
    file_status: Option<String>,
    #[serde(default)]
    alt: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    file_errors: Option<Vec<FileErrorNode>>,
    #[serde(default)]
    preview: Option<PreviewNode>,
    #[serde(default)]
    image: Option<ImageNode>,
    #[serde(default)]
    original_source: Option<UrlNode>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileErrorNode {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewNode {
    #[serde(default)]
    image: Option<UrlNode>,
}

#[derive(Debug, Deserialize)]
struct ImageNode {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UrlNode {
    #[serde(default)]
    url: Option<String>,
}

impl FileNode {
    pub(crate) fn into_record(self) -> FileRecord {
        let status = self
            .file_status
            .as_deref()
            .and_then(FileStatus::from_raw)
            .unwrap_or(FileStatus::Uploaded);
        let dimensions = self.image.as_ref().and_then(|image| {
            Some(MediaDimensions {
                width: image.width?,
                height: image.height?,
            })
        });
        let errors = self
            .file_errors
            .unwrap_or_default()
            .into_iter()
            .map(|error| {
                [error.code, error.message, error.details]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(": ")
            })
            .filter(|text| !text.is_empty())
            .collect();
        FileRecord {
            id: FileId::new(self.id),
            status,
            descriptive_text: self.alt.filter(|alt| !alt.is_empty()),
            created_at: self.created_at,
            dimensions,
            urls: MediaUrls {
                image: self.image.and_then(|image| image.url),
                original: self.original_source.and_then(|source| source.url),
                preview: self
                    .preview
                    .and_then(|preview| preview.image)
                    .and_then(|image| image.url),
                generic: self.url,
            },
            errors,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCreateData {
    file_create: Option<FileCreatePayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileCreatePayload {
    #[serde(default)]
    files: Option<Vec<FileNode>>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
struct FileNodeData {
    node: Option<FileNode>,
}

impl ShopifyClient {
    pub async fn create_file(&self, input: &FileCreateInput) -> Result<FileRecord, RequestError> {
        let mut slots = self.create_files_batch(std::slice::from_ref(input)).await?;
        match slots.pop() {
            Some(Ok(record)) => Ok(record),
            Some(Err(errors)) => Err(RequestError::UserErrors(errors)),
            None => Err(RequestError::Decode("fileCreate returned no slot".into())),
        }
    }

    /// One `fileCreate` call for all inputs. The returned slots line up with
    /// `inputs` by position; per-item user errors never fail the whole call.
    pub async fn create_files_batch(
        &self,
        inputs: &[FileCreateInput],
    ) -> Result<Vec<CreateSlot>, RequestError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let mut slots = self.file_create_call(inputs).await?;

        // A rejected sibling can make the remote drop valid inputs; give those one more pass.
        let has_real_errors = slots
            .iter()
            .any(|slot| matches!(slot, Err(errors) if !only_not_returned(errors)));
        let dropped: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Err(errors) if only_not_returned(errors)))
            .map(|(idx, _)| idx)
            .collect();
        if has_real_errors && !dropped.is_empty() {
            debug!(
                target: "hermes.shopify",
                dropped = dropped.len(),
                "file_create_resubmitting_dropped_inputs"
            );
            let retry_inputs: Vec<FileCreateInput> =
                dropped.iter().map(|idx| inputs[*idx].clone()).collect();
            let retried = self.file_create_call(&retry_inputs).await?;
            for (idx, slot) in dropped.into_iter().zip(retried) {
                slots[idx] = slot;
            }
        }
        Ok(slots)
    }

    async fn file_create_call(
        &self,
        inputs: &[FileCreateInput],
    ) -> Result<Vec<CreateSlot>, RequestError> {
        let query = format!("{FILE_CREATE}{FILE_FIELDS}");
        let data: FileCreateData = self
            .graphql(
                "file_create",
                Delivery::AtMostOnce,
                &query,
                json!({ "files": inputs }),
            )
            .await?;
        let payload = data
            .file_create
            .ok_or_else(|| RequestError::Decode("fileCreate payload missing".into()))?;
        let records = payload
            .files
            .unwrap_or_default()
            .into_iter()
            .map(FileNode::into_record)
            .collect();
        if !payload.user_errors.is_empty() {
            warn!(
                target: "hermes.shopify",
                count = payload.user_errors.len(),
                "file_create_user_errors"
            );
        }
        Ok(correlate(inputs, records, payload.user_errors))
    }

    pub async fn query_file(&self, id: &FileId) -> Result<FileRecord, RequestError> {
        let query = format!("{FILE_NODE}{FILE_FIELDS}");
        let data: FileNodeData = self
            .graphql(
                "file_node",
                Delivery::Retryable,
                &query,
                json!({ "id": id.as_str() }),
            )
            .await?;
        data.node
            .map(FileNode::into_record)
            .ok_or_else(|| RequestError::NotFound(id.to_string()))
    }
}

fn only_not_returned(errors: &[UserError]) -> bool {
    errors
        .iter()
        .all(|error| error.code.as_deref() == Some(NOT_RETURNED))
}

/// Pairs created files with their inputs.
///
/// Errors are placed by the index in their field path. Files are matched by
/// alt text when that text is unique among the open inputs, then by position.
/// Any input left without a file gets a `NOT_RETURNED` error so every input
/// ends with exactly one outcome.
pub fn correlate(
    inputs: &[FileCreateInput],
    files: Vec<FileRecord>,
    errors: Vec<UserError>,
) -> Vec<CreateSlot> {
    let mut slot_errors: Vec<Vec<UserError>> = vec![Vec::new(); inputs.len()];
    let mut unplaced = Vec::new();
    for error in errors {
        match error.input_index() {
            Some(idx) if idx < inputs.len() => slot_errors[idx].push(error),
            _ => unplaced.push(error),
        }
    }

    let mut slots: Vec<Option<CreateSlot>> = slot_errors
        .into_iter()
        .map(|errors| (!errors.is_empty()).then_some(Err(errors)))
        .collect();

    let mut alt_counts: HashMap<&str, usize> = HashMap::new();
    for (idx, input) in inputs.iter().enumerate() {
        if slots[idx].is_none()
            && let Some(alt) = input.alt.as_deref()
        {
            *alt_counts.entry(alt).or_default() += 1;
        }
    }

    let mut leftovers = Vec::new();
    for file in files {
        let by_alt = file.descriptive_text.as_deref().and_then(|alt| {
            if alt_counts.get(alt) != Some(&1) {
                return None;
            }
            inputs
                .iter()
                .enumerate()
                .position(|(idx, input)| slots[idx].is_none() && input.alt.as_deref() == Some(alt))
        });
        match by_alt {
            Some(idx) => slots[idx] = Some(Ok(file)),
            None => leftovers.push(file),
        }
    }

    let mut leftovers = leftovers.into_iter();
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        if let Some(file) = leftovers.next() {
            *slot = Some(Ok(file));
        }
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                if unplaced.is_empty() {
                    Err(vec![UserError {
                        field: None,
                        message: "no file returned for this input".into(),
                        code: Some(NOT_RETURNED.into()),
                    }])
                } else {
                    Err(unplaced.clone())
                }
            })
        })
        .collect()
}

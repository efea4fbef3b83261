use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::{base64::Base64, serde_as};
use std::{fmt, path::PathBuf};
use uuid::Uuid;

pub const TEXT_FIELD_TYPE: &str = "single_line_text_field";

pub const KEY_PRODUCT_ID: &str = "product_id";
pub const KEY_EXTERNAL_CODE: &str = "upc";
pub const KEY_BATCH_ID: &str = "batch_id";
pub const KEY_UPLOAD_KEY: &str = "upload_key";

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceLocation {
    Url(String),
    /// Identified by the path alone: rewriting the file in place keeps its
    /// `upload_key`, so `skip_existing` reuses the earlier upload. Submit the
    /// bytes instead when contents must take part in the key.
    Path(PathBuf),
    Bytes {
        filename: String,
        #[serde_as(as = "Base64")]
        data: Bytes,
    },
}

impl SourceLocation {
    fn identity(&self) -> Vec<u8> {
        match self {
            SourceLocation::Url(url) => [b"url:".as_slice(), url.trim().as_bytes()].concat(),
            SourceLocation::Path(path) => {
                [b"path:".as_slice(), path.to_string_lossy().as_bytes()].concat()
            }
            SourceLocation::Bytes { filename, data } => {
                [b"bytes:".as_slice(), filename.as_bytes(), b":", data.as_ref()].concat()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let lowered = content_type.trim().to_ascii_lowercase();
        if lowered.starts_with("image/") {
            Self::Image
        } else if lowered.starts_with("video/") {
            Self::Video
        } else {
            Self::File
        }
    }
}

/// External identifiers tracked next to a file, never inside its alt text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Provenance {
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default, alias = "upc")]
    pub external_code: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl Provenance {
    pub fn records(&self, namespace: &str) -> Vec<ProvenanceRecord> {
        [
            (KEY_PRODUCT_ID, &self.product_id),
            (KEY_EXTERNAL_CODE, &self.external_code),
            (KEY_BATCH_ID, &self.batch_id),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| ProvenanceRecord::text(namespace, key, value))
        })
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRequest {
    pub source: SourceLocation,
    pub content_type: String,
    #[serde(default, alias = "alt")]
    pub descriptive_text: Option<String>,
    #[serde(default)]
    pub provenance: Provenance,
}

impl UploadRequest {
    pub fn from_url(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            source: SourceLocation::Url(url.into()),
            content_type: content_type.into(),
            descriptive_text: None,
            provenance: Provenance::default(),
        }
    }

    pub fn from_bytes(
        filename: impl Into<String>,
        data: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            source: SourceLocation::Bytes {
                filename: filename.into(),
                data: data.into(),
            },
            content_type: content_type.into(),
            descriptive_text: None,
            provenance: Provenance::default(),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>, content_type: impl Into<String>) -> Self {
        Self {
            source: SourceLocation::Path(path.into()),
            content_type: content_type.into(),
            descriptive_text: None,
            provenance: Provenance::default(),
        }
    }

    pub fn with_descriptive_text(mut self, text: impl Into<String>) -> Self {
        self.descriptive_text = Some(text.into());
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_content_type(&self.content_type)
    }

    /// Stable across runs: identical requests always map to the same key.
    pub fn upload_key(&self) -> Uuid {
        let mut name = self.source.identity();
        for part in [
            Some(self.content_type.as_str()),
            self.descriptive_text.as_deref(),
            self.provenance.product_id.as_deref(),
            self.provenance.external_code.as_deref(),
            self.provenance.batch_id.as_deref(),
        ] {
            name.push(0x1f);
            name.extend_from_slice(part.unwrap_or_default().as_bytes());
        }
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &name)
    }

    pub fn provenance_records(&self, namespace: &str) -> Vec<ProvenanceRecord> {
        let mut records = self.provenance.records(namespace);
        records.push(ProvenanceRecord::text(
            namespace,
            KEY_UPLOAD_KEY,
            self.upload_key().to_string(),
        ));
        records
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `gid://shopify/MediaImage/123` -> `123`.
    pub fn numeric_tail(&self) -> Option<&str> {
        self.0
            .rsplit('/')
            .next()
            .filter(|tail| !tail.is_empty() && tail.chars().all(|ch| ch.is_ascii_digit()))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Uploaded,
    Processing,
    Ready,
    Failed,
}

impl FileStatus {
    pub fn from_raw(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "UPLOADED" => Some(Self::Uploaded),
            "PROCESSING" => Some(Self::Processing),
            "READY" => Some(Self::Ready),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Uploaded => 0,
            Self::Processing => 1,
            Self::Ready => 2,
            Self::Failed => 3,
        }
    }

    /// Merges a freshly observed status; never moves backwards and never leaves `Failed`.
    pub fn advance(self, observed: FileStatus) -> FileStatus {
        match (self, observed) {
            (Self::Failed, _) | (_, Self::Failed) => Self::Failed,
            _ if observed.rank() > self.rank() => observed,
            _ => self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDimensions {
    pub width: u32,
    pub height: u32,
}

/// The URL aliases the catalog exposes; they are not always populated together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUrls {
    pub image: Option<String>,
    pub original: Option<String>,
    pub preview: Option<String>,
    pub generic: Option<String>,
}

impl MediaUrls {
    fn merge(&mut self, newer: MediaUrls) {
        self.image = newer.image.or(self.image.take());
        self.original = newer.original.or(self.original.take());
        self.preview = newer.preview.or(self.preview.take());
        self.generic = newer.generic.or(self.generic.take());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub status: FileStatus,
    pub descriptive_text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub dimensions: Option<MediaDimensions>,
    pub urls: MediaUrls,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl FileRecord {
    pub fn is_ready(&self) -> bool {
        self.status == FileStatus::Ready
    }

    /// Folds a re-queried snapshot of the same file into this one.
    pub fn refresh(&mut self, observed: FileRecord) {
        if observed.id != self.id {
            return;
        }
        self.status = self.status.advance(observed.status);
        if observed.descriptive_text.is_some() {
            self.descriptive_text = observed.descriptive_text;
        }
        self.created_at = self.created_at.or(observed.created_at);
        if observed.dimensions.is_some() {
            self.dimensions = observed.dimensions;
        }
        self.urls.merge(observed.urls);
        if !observed.errors.is_empty() {
            self.errors = observed.errors;
        }
    }
}

/// A signed, single-use upload slot. Deliberately not `Clone`: finalize consumes it.
#[derive(Debug)]
pub struct StagedTarget {
    pub target_url: String,
    pub resource_url: String,
    /// Signer-dictated order; submitted exactly as received.
    pub parameters: Vec<(String, String)>,
    pub expires_at: DateTime<Utc>,
}

impl StagedTarget {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub namespace: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: String,
}

impl ProvenanceRecord {
    pub fn text(namespace: &str, key: &str, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: value.into(),
            value_type: TEXT_FIELD_TYPE.to_string(),
        }
    }

    pub fn same_slot(&self, other: &ProvenanceRecord) -> bool {
        self.namespace == other.namespace && self.key == other.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientTransport,
    Validation,
    DomainUser,
    ProtocolExpiry,
    ResolutionAmbiguity,
    MetadataAttachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub stage: &'static str,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at `{}`: {}", self.kind, self.stage, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvenanceState {
    Verified,
    /// Written but not read back (verification disabled).
    Attached,
    Unverifiable(FailureReason),
}

#[derive(Debug, Clone)]
pub struct UploadSuccess {
    pub index: usize,
    pub request: UploadRequest,
    pub file: FileRecord,
    pub provenance: ProvenanceState,
    /// An earlier run already created this file; nothing new was finalized.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub index: usize,
    pub request: UploadRequest,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub submitted: usize,
    pub succeeded: Vec<UploadSuccess>,
    pub failed: Vec<UploadFailure>,
}

impl BatchResult {
    pub fn new(submitted: usize) -> Self {
        Self {
            submitted,
            succeeded: Vec::with_capacity(submitted),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded.len() + self.failed.len() == self.submitted
    }

    pub fn unverifiable(&self) -> impl Iterator<Item = &UploadSuccess> {
        self.succeeded
            .iter()
            .filter(|item| matches!(item.provenance, ProvenanceState::Unverifiable(_)))
    }

    pub(crate) fn sort(&mut self) {
        self.succeeded.sort_by_key(|item| item.index);
        self.failed.sort_by_key(|item| item.index);
    }

    pub fn summary(&self) -> Value {
        json!({
            "submitted": self.submitted,
            "succeeded": self.succeeded.iter().map(|item| json!({
                "index": item.index,
                "file_id": item.file.id,
                "status": item.file.status,
                "reused": item.reused,
                "provenance": match &item.provenance {
                    ProvenanceState::Verified => json!("verified"),
                    ProvenanceState::Attached => json!("attached"),
                    ProvenanceState::Unverifiable(reason) => json!({ "unverifiable": reason }),
                },
            })).collect::<Vec<_>>(),
            "failed": self.failed.iter().map(|item| json!({
                "index": item.index,
                "reason": item.reason,
            })).collect::<Vec<_>>(),
        })
    }
}

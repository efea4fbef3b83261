//! Batch submission.
//!
//! [`BatchCoordinator::submit`] walks the requests chunk by chunk. Inside a
//! chunk, URL sources share one `fileCreate` call while byte and path sources
//! run the staged flow concurrently. Every request ends as exactly one entry
//! in [`BatchResult::succeeded`] or [`BatchResult::failed`].

use crate::config::{BatchConfig, UploaderConfig};
use crate::models::{
    BatchResult, FailureKind, FailureReason, FileRecord, KEY_UPLOAD_KEY, ProvenanceState,
    SourceLocation, UploadFailure, UploadRequest, UploadSuccess,
};
use crate::provenance::ProvenanceTracker;
use crate::shopify::{FileCreateInput, ShopifyClient, StagedPayload, UserError};
use crate::staged_upload::StagedUploadOrchestrator;
use futures::future::join_all;
use std::collections::{HashMap, hash_map::Entry};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TARGET: &str = "hermes.batch";

#[derive(Debug, Error)]
pub enum BatchError {
    /// The catalog refused connections for several chunks in a row. `partial`
    /// holds every request: processed ones with their outcome, the rest as
    /// `not_attempted` failures.
    #[error("catalog unreachable for {chunks} consecutive chunk(s)")]
    Unreachable { chunks: u32, partial: BatchResult },
}

impl BatchError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::TransientTransport
    }

    pub fn partial(&self) -> &BatchResult {
        match self {
            BatchError::Unreachable { partial, .. } => partial,
        }
    }
}

type Item = (usize, UploadRequest);

enum Outcome {
    Success(UploadSuccess),
    Failure { failure: UploadFailure, unreachable: bool },
}

impl Outcome {
    fn failed(
        index: usize,
        request: UploadRequest,
        reason: FailureReason,
        unreachable: bool,
    ) -> Self {
        Outcome::Failure {
            failure: UploadFailure {
                index,
                request,
                reason,
            },
            unreachable,
        }
    }
}

/// A file that exists remotely and still needs its provenance settled.
struct Created {
    index: usize,
    request: UploadRequest,
    file: FileRecord,
    reused: bool,
}

/// A later request with the same `upload_key` as the one at `first`.
struct Duplicate {
    index: usize,
    request: UploadRequest,
    first: usize,
}

/// Result of the resubmission lookup for one item.
enum Lookup {
    Fresh(Item),
    Existing(Created),
    Failed(Outcome),
}

pub struct BatchCoordinator {
    client: ShopifyClient,
    staged: StagedUploadOrchestrator,
    tracker: ProvenanceTracker,
    config: BatchConfig,
}

impl BatchCoordinator {
    pub fn new(client: ShopifyClient, config: &UploaderConfig) -> Self {
        let staged = StagedUploadOrchestrator::new(
            client.clone(),
            Duration::from_secs(config.batch.staged_target_ttl_secs),
            config.batch.max_staged_restarts,
        );
        let tracker = ProvenanceTracker::new(client.clone(), config.provenance_namespace.clone());
        Self {
            client,
            staged,
            tracker,
            config: config.batch.clone(),
        }
    }

    pub async fn submit(&self, requests: Vec<UploadRequest>) -> Result<BatchResult, BatchError> {
        let started = Instant::now();
        let mut result = BatchResult::new(requests.len());
        let chunk_size = self.config.chunk_size.max(1);
        let (leaders, duplicates) = self.split_duplicates(requests);
        let mut pending = leaders.into_iter().peekable();
        let mut chunk_no = 0usize;
        let mut unreachable_streak = 0u32;

        info!(target: TARGET, submitted = result.submitted, chunk_size, "batch_started");

        while pending.peek().is_some() {
            if chunk_no > 0 && self.config.inter_chunk_delay_ms > 0 {
                sleep(Duration::from_millis(self.config.inter_chunk_delay_ms)).await;
            }
            let chunk: Vec<Item> = pending.by_ref().take(chunk_size).collect();
            let outcomes = self.run_chunk(chunk).await;

            let unreachable = !outcomes.is_empty()
                && outcomes
                    .iter()
                    .all(|outcome| matches!(outcome, Outcome::Failure { unreachable: true, .. }));
            unreachable_streak = if unreachable { unreachable_streak + 1 } else { 0 };

            for outcome in outcomes {
                match outcome {
                    Outcome::Success(success) => result.succeeded.push(success),
                    Outcome::Failure { failure, .. } => result.failed.push(failure),
                }
            }
            debug!(
                target: TARGET,
                chunk = chunk_no,
                succeeded = result.succeeded.len(),
                failed = result.failed.len(),
                "batch_chunk_done"
            );
            chunk_no += 1;

            let limit = self.config.abort_after_unreachable_chunks;
            if limit > 0 && unreachable_streak >= limit {
                for (index, request) in pending.by_ref() {
                    result.failed.push(UploadFailure {
                        index,
                        request,
                        reason: FailureReason::new(
                            FailureKind::TransientTransport,
                            "not_attempted",
                            "batch aborted: catalog unreachable",
                        ),
                    });
                }
                fold_duplicates(&mut result, duplicates);
                result.sort();
                warn!(
                    target: TARGET,
                    chunks = unreachable_streak,
                    failed = result.failed.len(),
                    "batch_aborted_unreachable"
                );
                return Err(BatchError::Unreachable {
                    chunks: unreachable_streak,
                    partial: result,
                });
            }
        }

        fold_duplicates(&mut result, duplicates);
        result.sort();
        crate::metrics::stage_elapsed("batch_submit", started.elapsed().as_millis());
        info!(
            target: TARGET,
            submitted = result.submitted,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            unverifiable = result.unverifiable().count(),
            "batch_finished"
        );
        Ok(result)
    }

    /// With `skip_existing`, only the first request per `upload_key` is sent;
    /// later copies take its outcome once the batch is done.
    fn split_duplicates(&self, requests: Vec<UploadRequest>) -> (Vec<Item>, Vec<Duplicate>) {
        let mut leaders = Vec::with_capacity(requests.len());
        let mut duplicates = Vec::new();
        let mut first_by_key: HashMap<Uuid, usize> = HashMap::new();
        for (index, request) in requests.into_iter().enumerate() {
            if !self.config.skip_existing {
                leaders.push((index, request));
                continue;
            }
            match first_by_key.entry(request.upload_key()) {
                Entry::Occupied(first) => duplicates.push(Duplicate {
                    index,
                    request,
                    first: *first.get(),
                }),
                Entry::Vacant(slot) => {
                    slot.insert(index);
                    leaders.push((index, request));
                }
            }
        }
        if !duplicates.is_empty() {
            debug!(target: TARGET, duplicates = duplicates.len(), "batch_duplicates_folded");
        }
        (leaders, duplicates)
    }

    async fn run_chunk(&self, chunk: Vec<Item>) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(chunk.len());
        let mut created = Vec::new();
        let mut fresh = Vec::new();

        let lookups = join_all(chunk.into_iter().map(|item| self.lookup_existing(item))).await;
        for lookup in lookups {
            match lookup {
                Lookup::Fresh(item) => fresh.push(item),
                Lookup::Existing(existing) => created.push(existing),
                Lookup::Failed(outcome) => outcomes.push(outcome),
            }
        }

        let mut remote = Vec::new();
        let mut local = Vec::new();
        for (index, request) in fresh {
            match &request.source {
                SourceLocation::Url(url) => {
                    let input = FileCreateInput::new(url.trim(), request.media_kind())
                        .with_alt(request.descriptive_text.clone());
                    remote.push(((index, request), input));
                }
                _ => local.push((index, request)),
            }
        }
        let (direct, staged) = tokio::join!(self.create_direct(remote), self.create_staged(local));
        for step in direct.into_iter().chain(staged) {
            match step {
                Ok(file) => created.push(file),
                Err(outcome) => outcomes.push(outcome),
            }
        }

        let settled = join_all(created.into_iter().map(|file| self.settle(file))).await;
        outcomes.extend(settled);
        outcomes
    }

    /// With `skip_existing`, a request whose `upload_key` is already recorded
    /// reuses that file instead of creating another.
    async fn lookup_existing(&self, (index, request): Item) -> Lookup {
        if !self.config.skip_existing {
            return Lookup::Fresh((index, request));
        }
        let key = request.upload_key().to_string();
        let found = match self.tracker.find_by_provenance(KEY_UPLOAD_KEY, &key).await {
            Ok(found) => found,
            Err(err) => {
                let reason = FailureReason::new(err.kind(), "dedupe_lookup", err.to_string());
                return Lookup::Failed(Outcome::failed(index, request, reason, err.is_unreachable()));
            }
        };
        let Some(id) = found.into_iter().next() else {
            return Lookup::Fresh((index, request));
        };
        match self.client.query_file(&id).await {
            Ok(file) => {
                info!(target: TARGET, index, file_id = %file.id, "batch_item_reused");
                Lookup::Existing(Created {
                    index,
                    request,
                    file,
                    reused: true,
                })
            }
            Err(err) => {
                let reason = FailureReason::new(err.kind(), "dedupe_lookup", err.to_string());
                Lookup::Failed(Outcome::failed(index, request, reason, err.is_unreachable()))
            }
        }
    }

    async fn create_direct(
        &self,
        entries: Vec<(Item, FileCreateInput)>,
    ) -> Vec<Result<Created, Outcome>> {
        if entries.is_empty() {
            return Vec::new();
        }
        let (items, inputs): (Vec<Item>, Vec<FileCreateInput>) = entries.into_iter().unzip();

        match self.client.create_files_batch(&inputs).await {
            Ok(slots) => items
                .into_iter()
                .zip(slots)
                .map(|((index, request), slot)| match slot {
                    Ok(file) => Ok(Created {
                        index,
                        request,
                        file,
                        reused: false,
                    }),
                    Err(errors) => {
                        let reason = FailureReason::new(
                            FailureKind::DomainUser,
                            "file_create",
                            join_errors(&errors),
                        );
                        Err(Outcome::failed(index, request, reason, false))
                    }
                })
                .collect(),
            Err(err) => {
                warn!(target: TARGET, count = items.len(), error = %err, "batch_file_create_failed");
                let unreachable = err.is_unreachable();
                items
                    .into_iter()
                    .map(|(index, request)| {
                        let reason = FailureReason::new(err.kind(), "file_create", err.to_string());
                        Err(Outcome::failed(index, request, reason, unreachable))
                    })
                    .collect()
            }
        }
    }

    async fn create_staged(&self, items: Vec<Item>) -> Vec<Result<Created, Outcome>> {
        join_all(items.into_iter().map(|(index, request)| async move {
            let payload = match load_payload(&request).await {
                Ok(payload) => payload,
                Err(reason) => return Err(Outcome::failed(index, request, reason, false)),
            };
            match self
                .staged
                .upload(&payload, request.descriptive_text.clone())
                .await
            {
                Ok(file) => Ok(Created {
                    index,
                    request,
                    file,
                    reused: false,
                }),
                Err(err) => {
                    let reason = FailureReason::new(err.kind(), err.stage(), err.to_string());
                    let unreachable = err.is_unreachable();
                    Err(Outcome::failed(index, request, reason, unreachable))
                }
            }
        }))
        .await
    }

    /// Attaches provenance to a created or reused file. Failures here never
    /// undo the upload; they mark it unverifiable.
    async fn settle(&self, created: Created) -> Outcome {
        let Created {
            index,
            request,
            file,
            reused,
        } = created;
        let records = request.provenance_records(self.tracker.namespace());

        let provenance = match self.tracker.attach(&file.id, &records).await {
            Err(err) => unverifiable("provenance_attach", &err),
            Ok(written) if self.config.verify_metadata => {
                match self.tracker.verify(&file.id, &written).await {
                    Ok(()) => ProvenanceState::Verified,
                    Err(err) => unverifiable("provenance_verify", &err),
                }
            }
            Ok(_) => ProvenanceState::Attached,
        };
        if let ProvenanceState::Unverifiable(reason) = &provenance {
            warn!(target: TARGET, index, file_id = %file.id, reason = %reason, "batch_item_unverifiable");
        }

        Outcome::Success(UploadSuccess {
            index,
            request,
            file,
            provenance,
            reused,
        })
    }
}

fn fold_duplicates(result: &mut BatchResult, duplicates: Vec<Duplicate>) {
    for Duplicate {
        index,
        request,
        first,
    } in duplicates
    {
        if let Some(original) = result.succeeded.iter().find(|item| item.index == first) {
            let success = UploadSuccess {
                index,
                request,
                file: original.file.clone(),
                provenance: original.provenance.clone(),
                reused: true,
            };
            result.succeeded.push(success);
            continue;
        }
        let reason = result
            .failed
            .iter()
            .find(|item| item.index == first)
            .map(|item| item.reason.clone())
            .unwrap_or_else(|| {
                FailureReason::new(
                    FailureKind::TransientTransport,
                    "not_attempted",
                    "first occurrence was not processed",
                )
            });
        result.failed.push(UploadFailure {
            index,
            request,
            reason,
        });
    }
}

fn unverifiable(stage: &'static str, err: &crate::provenance::MetadataError) -> ProvenanceState {
    ProvenanceState::Unverifiable(FailureReason::new(
        FailureKind::MetadataAttachment,
        stage,
        err.to_string(),
    ))
}

fn join_errors(errors: &[UserError]) -> String {
    errors
        .iter()
        .map(|error| match &error.code {
            Some(code) => format!("{error} ({code})"),
            None => error.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

async fn load_payload(request: &UploadRequest) -> Result<StagedPayload, FailureReason> {
    let (filename, data) = match &request.source {
        SourceLocation::Bytes { filename, data } => (filename.clone(), data.clone()),
        SourceLocation::Path(path) => {
            let data = tokio::fs::read(path).await.map_err(|err| {
                FailureReason::new(
                    FailureKind::Validation,
                    "read_source",
                    format!("{}: {err}", path.display()),
                )
            })?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload.bin".to_string());
            (filename, data.into())
        }
        SourceLocation::Url(_) => {
            return Err(FailureReason::new(
                FailureKind::Validation,
                "read_source",
                "remote sources are created directly",
            ));
        }
    };
    Ok(StagedPayload {
        filename,
        content_type: request.content_type.clone(),
        data,
    })
}

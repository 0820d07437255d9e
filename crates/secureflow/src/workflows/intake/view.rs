use chrono::{DateTime, Utc};
use serde::Serialize;

use super::catalog::RequirementCatalog;
use super::domain::{
    CrmSyncState, DocumentRecord, DocumentStatus, OwnerId, RequirementId, Submission,
    SubmissionId, SubmissionStage,
};

/// Read model returned to API callers after every operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionView {
    pub submission_id: SubmissionId,
    pub owner_id: OwnerId,
    pub stage: SubmissionStage,
    pub stage_label: &'static str,
    pub crm_sync_state: CrmSyncState,
    pub progress: f64,
    pub can_advance: bool,
    pub documents: Vec<DocumentView>,
    pub signature: SignatureView,
    pub external_id: Option<String>,
    pub last_sync_error: Option<String>,
    pub sync_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentView {
    pub requirement_id: RequirementId,
    pub display_name: String,
    pub required: bool,
    pub status: DocumentStatus,
    pub attempt_count: u32,
    pub attempts_remaining: u32,
    pub confidence: Option<f32>,
    pub issues: Vec<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureView {
    pub signed: bool,
    pub signed_at: Option<DateTime<Utc>>,
}

impl SubmissionView {
    pub fn new(submission: &Submission, catalog: &RequirementCatalog, max_attempts: u32) -> Self {
        let documents = catalog
            .requirements()
            .iter()
            .filter_map(|requirement| {
                submission
                    .document(&requirement.id)
                    .map(|record| DocumentView::new(record, &requirement.display_name, max_attempts))
            })
            .collect();

        Self {
            submission_id: submission.id().clone(),
            owner_id: submission.owner_id().clone(),
            stage: submission.stage(),
            stage_label: submission.stage().label(),
            crm_sync_state: submission.crm_sync_state(),
            progress: submission.progress_fraction(),
            can_advance: submission.can_advance(submission.stage()),
            documents,
            signature: SignatureView {
                signed: submission.signature().signed(),
                signed_at: submission.signature().signed_at(),
            },
            external_id: submission.external_id().map(str::to_string),
            last_sync_error: submission.last_sync_error().map(str::to_string),
            sync_attempts: submission.sync_attempts(),
            created_at: submission.created_at(),
            completed_at: submission.completed_at(),
        }
    }

    pub fn document(&self, requirement_id: &str) -> Option<&DocumentView> {
        self.documents
            .iter()
            .find(|document| document.requirement_id.as_str() == requirement_id)
    }
}

impl DocumentView {
    fn new(record: &DocumentRecord, display_name: &str, max_attempts: u32) -> Self {
        let attempts_remaining = if record.verified() {
            0
        } else {
            max_attempts.saturating_sub(record.attempt_count())
        };
        Self {
            requirement_id: record.requirement_id().clone(),
            display_name: display_name.to_string(),
            required: record.required(),
            status: record.status(),
            attempt_count: record.attempt_count(),
            attempts_remaining,
            confidence: record.last_confidence(),
            issues: record.last_issues().to_vec(),
            file_name: record.file_ref().map(|file| file.file_name.clone()),
        }
    }
}

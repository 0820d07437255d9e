use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::RequirementCatalog;

/// Catalog key naming one kind of document (e.g. `proof-id`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementId(pub String);

impl RequirementId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier wrapper for submissions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub String);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the applicant owning a submission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable catalog entry describing one document the applicant must supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequirement {
    pub id: RequirementId,
    pub display_name: String,
    pub description: String,
    pub required: bool,
}

/// Contact and identity details captured on the applicant's first interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerProfile {
    pub owner_id: OwnerId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl OwnerProfile {
    /// Reminder destination: e-mail first, phone as a fallback.
    pub fn contact(&self) -> Option<&str> {
        let email = self.email.trim();
        if !email.is_empty() {
            return Some(email);
        }
        self.phone
            .as_deref()
            .map(str::trim)
            .filter(|phone| !phone.is_empty())
    }
}

/// Uploaded file as handed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl DocumentUpload {
    pub fn new(file_name: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type,
            bytes,
        }
    }
}

/// Metadata retained for the most recent upload of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_name: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl FileRef {
    pub fn from_upload(upload: &DocumentUpload, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            file_name: upload.file_name.clone(),
            content_type: upload.content_type.clone(),
            size_bytes: upload.bytes.len() as u64,
            uploaded_at,
        }
    }
}

/// Per-requirement verification state. Only the verification tracker mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub(crate) requirement_id: RequirementId,
    pub(crate) required: bool,
    pub(crate) uploaded: bool,
    pub(crate) verified: bool,
    pub(crate) attempt_count: u32,
    pub(crate) last_issues: Vec<String>,
    pub(crate) last_confidence: Option<f32>,
    pub(crate) file_ref: Option<FileRef>,
}

impl DocumentRecord {
    pub fn new(requirement: &DocumentRequirement) -> Self {
        Self {
            requirement_id: requirement.id.clone(),
            required: requirement.required,
            uploaded: false,
            verified: false,
            attempt_count: 0,
            last_issues: Vec::new(),
            last_confidence: None,
            file_ref: None,
        }
    }

    pub fn requirement_id(&self) -> &RequirementId {
        &self.requirement_id
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn uploaded(&self) -> bool {
        self.uploaded
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_issues(&self) -> &[String] {
        &self.last_issues
    }

    pub fn last_confidence(&self) -> Option<f32> {
        self.last_confidence
    }

    pub fn file_ref(&self) -> Option<&FileRef> {
        self.file_ref.as_ref()
    }

    pub fn status(&self) -> DocumentStatus {
        match (self.uploaded, self.verified) {
            (_, true) => DocumentStatus::Verified,
            (true, false) => DocumentStatus::Rejected,
            (false, false) => DocumentStatus::Missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Missing,
    Rejected,
    Verified,
}

/// Electronic signature state; signed exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub(crate) signed: bool,
    pub(crate) signed_at: Option<DateTime<Utc>>,
}

impl SignatureRecord {
    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn signed_at(&self) -> Option<DateTime<Utc>> {
        self.signed_at
    }
}

/// Applicant-visible phase of the workflow. Declaration order is progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStage {
    Collecting,
    Signing,
    Completed,
}

impl SubmissionStage {
    pub const fn label(self) -> &'static str {
        match self {
            SubmissionStage::Collecting => "collecting",
            SubmissionStage::Signing => "signing",
            SubmissionStage::Completed => "completed",
        }
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            SubmissionStage::Collecting => Some(SubmissionStage::Signing),
            SubmissionStage::Signing => Some(SubmissionStage::Completed),
            SubmissionStage::Completed => None,
        }
    }
}

impl fmt::Display for SubmissionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outbound CRM delivery state, tracked independently of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrmSyncState {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl CrmSyncState {
    pub const fn label(self) -> &'static str {
        match self {
            CrmSyncState::Pending => "pending",
            CrmSyncState::Syncing => "syncing",
            CrmSyncState::Synced => "synced",
            CrmSyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for CrmSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Aggregate owning one applicant's documents, signature, and sync status.
///
/// Fields are crate-private: every mutation goes through the state machine,
/// the verification tracker, or the sync coordinator so the stage invariants
/// hold for every persisted version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub(crate) id: SubmissionId,
    pub(crate) owner: OwnerProfile,
    pub(crate) documents: BTreeMap<RequirementId, DocumentRecord>,
    pub(crate) signature: SignatureRecord,
    pub(crate) stage: SubmissionStage,
    pub(crate) crm_sync_state: CrmSyncState,
    pub(crate) external_id: Option<String>,
    pub(crate) last_sync_error: Option<String>,
    pub(crate) sync_attempts: u32,
    pub(crate) sync_started_at: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token bumped by the repository on every write.
    pub(crate) version: u64,
}

impl Submission {
    pub fn new(
        id: SubmissionId,
        owner: OwnerProfile,
        catalog: &RequirementCatalog,
        created_at: DateTime<Utc>,
    ) -> Self {
        let documents = catalog
            .requirements()
            .iter()
            .map(|requirement| (requirement.id.clone(), DocumentRecord::new(requirement)))
            .collect();

        Self {
            id,
            owner,
            documents,
            signature: SignatureRecord::default(),
            stage: SubmissionStage::Collecting,
            crm_sync_state: CrmSyncState::Pending,
            external_id: None,
            last_sync_error: None,
            sync_attempts: 0,
            sync_started_at: None,
            created_at,
            completed_at: None,
            version: 0,
        }
    }

    pub fn id(&self) -> &SubmissionId {
        &self.id
    }

    pub fn owner(&self) -> &OwnerProfile {
        &self.owner
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner.owner_id
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.documents.values()
    }

    pub fn document(&self, requirement_id: &RequirementId) -> Option<&DocumentRecord> {
        self.documents.get(requirement_id)
    }

    pub fn signature(&self) -> &SignatureRecord {
        &self.signature
    }

    pub fn stage(&self) -> SubmissionStage {
        self.stage
    }

    pub fn crm_sync_state(&self) -> CrmSyncState {
        self.crm_sync_state
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn last_sync_error(&self) -> Option<&str> {
        self.last_sync_error.as_deref()
    }

    /// Lifetime number of delivery attempts made for this submission.
    pub fn sync_attempts(&self) -> u32 {
        self.sync_attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Stamp the optimistic-concurrency token; record stores call this on write.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Terminal once completed and delivered.
    pub fn is_terminal(&self) -> bool {
        self.stage == SubmissionStage::Completed && self.crm_sync_state == CrmSyncState::Synced
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use super::catalog::RequirementCatalog;
use super::classifier::{ClassifierError, DocumentClassifier};
use super::domain::{
    DocumentUpload, OwnerId, OwnerProfile, RequirementId, Submission, SubmissionId,
    SubmissionStage,
};
use super::machine::{Transition, TransitionError};
use super::reminders::{Notifier, ReminderKind, ReminderScheduler};
use super::repository::{read_modify_write, RepositoryError, SubmissionRepository};
use super::sync::{CrmDelivery, SyncCoordinator, SyncError, SyncPolicy, SyncResult};
use super::verification::{
    VerificationError, VerificationOutcome, VerificationPolicy, VerificationTracker,
};
use super::view::SubmissionView;
use crate::config::WorkflowConfig;

/// External systems the intake workflow talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn SubmissionRepository>,
    pub classifier: Arc<dyn DocumentClassifier>,
    pub delivery: Arc<dyn CrmDelivery>,
    pub notifier: Arc<dyn Notifier>,
}

/// Response for a document upload: the refreshed submission plus the verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSubmission {
    pub submission: SubmissionView,
    pub verification: VerificationOutcome,
}

/// Result of `complete_submission`. `sync` is set only when this call moved
/// the submission to COMPLETED and started delivery.
#[derive(Debug)]
pub struct Completion {
    pub submission: SubmissionView,
    pub sync: Option<JoinHandle<Result<SyncResult, SyncError>>>,
}

/// Service composing the verification tracker, state machine, sync
/// coordinator, and reminder scheduler behind owner-scoped operations.
pub struct IntakeService {
    repository: Arc<dyn SubmissionRepository>,
    catalog: Arc<RequirementCatalog>,
    tracker: VerificationTracker,
    sync: Arc<SyncCoordinator>,
    reminders: Arc<ReminderScheduler>,
    config: WorkflowConfig,
}

static SUBMISSION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_submission_id() -> SubmissionId {
    let id = SUBMISSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    SubmissionId(format!("sub-{id:06}"))
}

impl IntakeService {
    pub fn new(
        collaborators: Collaborators,
        catalog: RequirementCatalog,
        config: WorkflowConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let tracker = VerificationTracker::new(
            Arc::clone(&collaborators.repository),
            collaborators.classifier,
            Arc::clone(&catalog),
            VerificationPolicy::from(&config),
        );
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&collaborators.repository),
            collaborators.delivery,
            SyncPolicy::from(&config.sync),
        ));
        let reminders = Arc::new(ReminderScheduler::from_config(
            collaborators.notifier,
            &config.reminders,
        ));

        Self {
            repository: collaborators.repository,
            catalog,
            tracker,
            sync,
            reminders,
            config,
        }
    }

    pub fn catalog(&self) -> &RequirementCatalog {
        &self.catalog
    }

    pub fn reminders(&self) -> &ReminderScheduler {
        &self.reminders
    }

    pub fn sync_coordinator(&self) -> &SyncCoordinator {
        &self.sync
    }

    /// Return the owner's submission, creating it on first contact.
    pub fn open_submission(&self, profile: OwnerProfile) -> Result<SubmissionView, WorkflowError> {
        if let Some(existing) = self.repository.fetch_by_owner(&profile.owner_id)? {
            debug!(owner_id = %profile.owner_id, submission_id = %existing.id(), "resuming submission");
            return Ok(self.view(&existing));
        }

        let owner_id = profile.owner_id.clone();
        let submission = Submission::new(next_submission_id(), profile, &self.catalog, Utc::now());
        let stored = match self.repository.insert(submission) {
            Ok(stored) => stored,
            Err(RepositoryError::Conflict) => {
                debug!(%owner_id, "submission opened concurrently, resuming");
                let existing = self.load(&owner_id)?;
                return Ok(self.view(&existing));
            }
            Err(other) => return Err(other.into()),
        };

        info!(owner_id = %stored.owner_id(), submission_id = %stored.id(), "submission opened");
        self.reminders.arm_incomplete_reminder(
            stored.id(),
            stored.owner().contact(),
            self.config.reminders.incomplete_delay,
        );
        Ok(self.view(&stored))
    }

    pub fn get_submission(&self, owner_id: &OwnerId) -> Result<SubmissionView, WorkflowError> {
        let submission = self.load(owner_id)?;
        Ok(self.view(&submission))
    }

    /// Classify an upload and record the verdict against the owner's submission.
    pub async fn submit_document(
        &self,
        owner_id: &OwnerId,
        requirement_id: &RequirementId,
        upload: DocumentUpload,
    ) -> Result<DocumentSubmission, WorkflowError> {
        if self.catalog.get(requirement_id).is_none() {
            return Err(WorkflowError::UnknownRequirement(requirement_id.clone()));
        }
        let submission = self.load(owner_id)?;
        let (stored, verification) = self
            .tracker
            .submit(submission.id(), requirement_id, upload)
            .await?;

        if stored.unverified_required().is_empty() {
            self.reminders.disarm(stored.id(), ReminderKind::Incomplete);
        } else if !verification.verified {
            self.reminders.arm_incomplete_reminder(
                stored.id(),
                stored.owner().contact(),
                self.config.reminders.incomplete_delay,
            );
        }

        Ok(DocumentSubmission {
            submission: self.view(&stored),
            verification,
        })
    }

    /// COLLECTING → SIGNING.
    pub fn proceed_to_signature(&self, owner_id: &OwnerId) -> Result<SubmissionView, WorkflowError> {
        let submission = self.load(owner_id)?;
        let (stored, transition) =
            read_modify_write(self.repository.as_ref(), submission.id(), |submission| {
                Ok::<_, WorkflowError>(submission.advance_to_signing()?)
            })
            .map_err(|err| {
                debug!(%owner_id, error = %err, "signing transition refused");
                err
            })?;

        if transition.changed() {
            info!(%owner_id, submission_id = %stored.id(), "submission ready for signature");
            self.reminders.disarm(stored.id(), ReminderKind::Incomplete);
            if !stored.signature().signed() {
                self.reminders.arm_signature_reminder(
                    stored.id(),
                    stored.owner().contact(),
                    self.config.reminders.signature_delay,
                );
            }
        }
        Ok(self.view(&stored))
    }

    /// Capture the electronic signature. Repeated calls keep the first timestamp.
    pub fn record_signature(&self, owner_id: &OwnerId) -> Result<SubmissionView, WorkflowError> {
        let submission = self.load(owner_id)?;
        let (stored, transition) =
            read_modify_write(self.repository.as_ref(), submission.id(), |submission| {
                Ok::<_, WorkflowError>(submission.record_signature(Utc::now()))
            })?;

        if transition.changed() {
            info!(%owner_id, submission_id = %stored.id(), "signature recorded");
        }
        self.reminders
            .disarm(stored.id(), ReminderKind::MissingSignature);
        Ok(self.view(&stored))
    }

    /// Finish the submission and start delivering it to the CRM in the background.
    pub fn complete_submission(&self, owner_id: &OwnerId) -> Result<Completion, WorkflowError> {
        let submission = self.load(owner_id)?;
        let (stored, transition) =
            read_modify_write(self.repository.as_ref(), submission.id(), |submission| {
                if submission.stage() == SubmissionStage::Collecting {
                    submission.advance_to_signing()?;
                }
                Ok::<_, WorkflowError>(submission.complete(Utc::now())?)
            })
            .map_err(|err| {
                debug!(%owner_id, error = %err, "completion refused");
                err
            })?;

        if !matches!(transition, Transition::Advanced { .. }) {
            return Ok(Completion {
                submission: self.view(&stored),
                sync: None,
            });
        }

        let cancelled = self.reminders.disarm_all(stored.id());
        info!(
            %owner_id,
            submission_id = %stored.id(),
            cancelled_reminders = cancelled,
            "submission completed"
        );

        let handle = self.spawn_sync(stored.id().clone());
        Ok(Completion {
            submission: self.view(&stored),
            sync: Some(handle),
        })
    }

    /// Manually re-run delivery. Draws on the same per-submission delivery
    /// budget as the automatic run started by `complete_submission`.
    pub async fn retry_sync(&self, submission_id: &SubmissionId) -> Result<SubmissionView, WorkflowError> {
        let max_attempts = self.config.sync.max_attempts;
        info!(%submission_id, max_attempts, "manual crm sync retry requested");
        self.sync
            .retry_sync(submission_id, max_attempts)
            .await
            .map_err(|err| WorkflowError::from_sync(err, submission_id))?;

        let stored = self
            .repository
            .fetch(submission_id)?
            .ok_or_else(|| WorkflowError::SubmissionNotFound(submission_id.to_string()))?;
        Ok(self.view(&stored))
    }

    /// Load the current view for a submission id, used to decorate error responses.
    pub fn find_submission(&self, submission_id: &SubmissionId) -> Result<SubmissionView, WorkflowError> {
        let stored = self
            .repository
            .fetch(submission_id)?
            .ok_or_else(|| WorkflowError::SubmissionNotFound(submission_id.to_string()))?;
        Ok(self.view(&stored))
    }

    /// Cancel every pending reminder; called on process teardown.
    pub fn shutdown(&self) {
        self.reminders.shutdown();
    }

    fn spawn_sync(&self, submission_id: SubmissionId) -> JoinHandle<Result<SyncResult, SyncError>> {
        let coordinator = Arc::clone(&self.sync);
        let max_attempts = self.config.sync.max_attempts;
        let span = tracing::info_span!("crm_sync", submission_id = %submission_id);

        tokio::spawn(
            async move { coordinator.retry_sync(&submission_id, max_attempts).await }
                .instrument(span),
        )
    }

    fn load(&self, owner_id: &OwnerId) -> Result<Submission, WorkflowError> {
        self.repository
            .fetch_by_owner(owner_id)?
            .ok_or_else(|| WorkflowError::SubmissionNotFound(owner_id.to_string()))
    }

    fn view(&self, submission: &Submission) -> SubmissionView {
        SubmissionView::new(submission, &self.catalog, self.tracker.policy().max_attempts)
    }
}

/// Error raised by the intake service. Every variant maps to a stable code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("no submission found for '{0}'")]
    SubmissionNotFound(String),
    #[error("unknown document requirement '{0}'")]
    UnknownRequirement(RequirementId),
    #[error("verification attempts exhausted for '{requirement_id}' ({attempts} of {max_attempts})")]
    RetryLimitExceeded {
        requirement_id: RequirementId,
        attempts: u32,
        max_attempts: u32,
        issues: Vec<String>,
    },
    #[error(transparent)]
    ClassifierUnavailable(ClassifierError),
    #[error(transparent)]
    GuardNotSatisfied(#[from] TransitionError),
    #[error("documents can no longer change once the submission is {0}")]
    DocumentsLocked(SubmissionStage),
    #[error("submission must be completed before syncing (currently {0})")]
    NotCompleted(SubmissionStage),
    #[error("crm sync failed: {message}")]
    SyncFailed { retryable: bool, message: String },
    #[error("crm sync retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::SubmissionNotFound(_) => "submission_not_found",
            WorkflowError::UnknownRequirement(_) => "unknown_requirement",
            WorkflowError::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            WorkflowError::ClassifierUnavailable(_) => "classifier_unavailable",
            WorkflowError::GuardNotSatisfied(_) => "guard_not_satisfied",
            WorkflowError::DocumentsLocked(_) => "documents_locked",
            WorkflowError::NotCompleted(_) => "not_completed",
            WorkflowError::SyncFailed { .. } => "sync_failed",
            WorkflowError::RetriesExhausted { .. } => "retries_exhausted",
            WorkflowError::Repository(_) => "repository_error",
        }
    }

    fn from_sync(error: SyncError, submission_id: &SubmissionId) -> Self {
        match error {
            SyncError::Repository(RepositoryError::NotFound) => {
                WorkflowError::SubmissionNotFound(submission_id.to_string())
            }
            other => other.into(),
        }
    }
}

impl From<VerificationError> for WorkflowError {
    fn from(value: VerificationError) -> Self {
        match value {
            VerificationError::UnknownRequirement(id) => WorkflowError::UnknownRequirement(id),
            VerificationError::RetryLimitExceeded {
                requirement_id,
                attempts,
                max_attempts,
                issues,
            } => WorkflowError::RetryLimitExceeded {
                requirement_id,
                attempts,
                max_attempts,
                issues,
            },
            VerificationError::ClassifierUnavailable(err) => WorkflowError::ClassifierUnavailable(err),
            VerificationError::DocumentsLocked(stage) => WorkflowError::DocumentsLocked(stage),
            VerificationError::Repository(err) => WorkflowError::Repository(err),
        }
    }
}

impl From<SyncError> for WorkflowError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::NotCompleted(stage) => WorkflowError::NotCompleted(stage),
            SyncError::Failed { retryable, message } => {
                WorkflowError::SyncFailed { retryable, message }
            }
            SyncError::RetriesExhausted {
                attempts,
                last_error,
            } => WorkflowError::RetriesExhausted {
                attempts,
                last_error,
            },
            SyncError::Interrupted => WorkflowError::SyncFailed {
                retryable: true,
                message: SyncError::Interrupted.to_string(),
            },
            SyncError::Repository(err) => WorkflowError::Repository(err),
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::catalog::RequirementCatalog;
use super::classifier::{ClassifierError, ClassifierVerdict, DocumentClassifier};
use super::domain::{
    DocumentRecord, DocumentRequirement, DocumentUpload, FileRef, RequirementId, Submission,
    SubmissionId, SubmissionStage,
};
use super::repository::{read_modify_write, RepositoryError, SubmissionRepository};
use crate::config::WorkflowConfig;

/// Bounds applied to every verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    pub max_attempts: u32,
    pub classifier_timeout: Duration,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self::from(&WorkflowConfig::default())
    }
}

impl From<&WorkflowConfig> for VerificationPolicy {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_attempts: config.max_verification_attempts,
            classifier_timeout: config.classifier_timeout,
        }
    }
}

/// Result of one counted verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub requirement_id: RequirementId,
    pub verified: bool,
    pub confidence: f32,
    pub issues: Vec<String>,
    pub attempt_count: u32,
    pub attempts_remaining: u32,
}

impl VerificationOutcome {
    fn from_record(record: &DocumentRecord, max_attempts: u32) -> Self {
        Self {
            requirement_id: record.requirement_id.clone(),
            verified: record.verified,
            confidence: record.last_confidence.unwrap_or(0.0),
            issues: record.last_issues.clone(),
            attempt_count: record.attempt_count,
            attempts_remaining: max_attempts.saturating_sub(record.attempt_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerificationError {
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
    ClassifierUnavailable(#[from] ClassifierError),
    #[error("documents can no longer change once the submission is {0}")]
    DocumentsLocked(SubmissionStage),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

type AttemptKey = (SubmissionId, RequirementId);

/// Counts classification attempts per document and enforces the retry ceiling.
///
/// Attempts on the same `(submission, requirement)` pair are serialized so
/// the counter never loses an update; different requirements proceed in
/// parallel and meet only at the repository's compare-and-swap.
pub struct VerificationTracker {
    repository: Arc<dyn SubmissionRepository>,
    classifier: Arc<dyn DocumentClassifier>,
    catalog: Arc<RequirementCatalog>,
    policy: VerificationPolicy,
    in_progress: Mutex<HashMap<AttemptKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl VerificationTracker {
    pub fn new(
        repository: Arc<dyn SubmissionRepository>,
        classifier: Arc<dyn DocumentClassifier>,
        catalog: Arc<RequirementCatalog>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            repository,
            classifier,
            catalog,
            policy,
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    /// Classify `upload` against `requirement_id` and record the verdict.
    ///
    /// A rejection that uses up the last attempt is reported as
    /// [`VerificationError::RetryLimitExceeded`] after it has been recorded;
    /// any further call fails the same way without reaching the classifier.
    pub async fn submit(
        &self,
        submission_id: &SubmissionId,
        requirement_id: &RequirementId,
        upload: DocumentUpload,
    ) -> Result<(Submission, VerificationOutcome), VerificationError> {
        let requirement = self
            .catalog
            .get(requirement_id)
            .ok_or_else(|| VerificationError::UnknownRequirement(requirement_id.clone()))?;

        let key = (submission_id.clone(), requirement_id.clone());
        let slot = self.slot(&key);
        let result = {
            let _serialized = slot.lock().await;
            self.attempt(submission_id, requirement_id, &upload, requirement)
                .await
        };
        self.release(&key, slot);
        result
    }

    async fn attempt(
        &self,
        submission_id: &SubmissionId,
        requirement_id: &RequirementId,
        upload: &DocumentUpload,
        requirement: &DocumentRequirement,
    ) -> Result<(Submission, VerificationOutcome), VerificationError> {
        let max_attempts = self.policy.max_attempts;
        let current = self
            .repository
            .fetch(submission_id)?
            .ok_or(RepositoryError::NotFound)?;

        let record = Self::writable_record(&current, requirement_id, max_attempts)?;
        if record.verified {
            debug!(%submission_id, %requirement_id, "document already verified, counting upload without reclassifying");
            return read_modify_write(self.repository.as_ref(), submission_id, |submission| {
                Self::writable_record(submission, requirement_id, max_attempts)?;
                let record = submission
                    .documents
                    .get_mut(requirement_id)
                    .ok_or_else(|| VerificationError::UnknownRequirement(requirement_id.clone()))?;
                record.attempt_count = record.attempt_count.saturating_add(1);
                Ok::<_, VerificationError>(VerificationOutcome::from_record(record, max_attempts))
            });
        }

        let verdict = self.classify(upload, requirement).await?;
        let uploaded_at = Utc::now();

        let (stored, outcome) =
            read_modify_write(self.repository.as_ref(), submission_id, |submission| {
                Self::writable_record(submission, requirement_id, max_attempts)?;
                let record = submission
                    .documents
                    .get_mut(requirement_id)
                    .ok_or_else(|| VerificationError::UnknownRequirement(requirement_id.clone()))?;
                apply_verdict(record, &verdict, FileRef::from_upload(upload, uploaded_at));
                Ok::<_, VerificationError>(VerificationOutcome::from_record(record, max_attempts))
            })?;

        if outcome.verified {
            info!(
                %submission_id,
                %requirement_id,
                attempt = outcome.attempt_count,
                confidence = outcome.confidence,
                "document verified"
            );
            return Ok((stored, outcome));
        }

        warn!(
            %submission_id,
            %requirement_id,
            attempt = outcome.attempt_count,
            issues = ?outcome.issues,
            "document rejected"
        );

        if outcome.attempts_remaining == 0 {
            return Err(VerificationError::RetryLimitExceeded {
                requirement_id: requirement_id.clone(),
                attempts: outcome.attempt_count,
                max_attempts,
                issues: outcome.issues,
            });
        }

        Ok((stored, outcome))
    }

    fn writable_record<'a>(
        submission: &'a Submission,
        requirement_id: &RequirementId,
        max_attempts: u32,
    ) -> Result<&'a DocumentRecord, VerificationError> {
        if submission.stage != SubmissionStage::Collecting {
            return Err(VerificationError::DocumentsLocked(submission.stage));
        }
        let record = submission
            .documents
            .get(requirement_id)
            .ok_or_else(|| VerificationError::UnknownRequirement(requirement_id.clone()))?;
        if !record.verified && record.attempt_count >= max_attempts {
            return Err(VerificationError::RetryLimitExceeded {
                requirement_id: requirement_id.clone(),
                attempts: record.attempt_count,
                max_attempts,
                issues: record.last_issues.clone(),
            });
        }
        Ok(record)
    }

    async fn classify(
        &self,
        upload: &DocumentUpload,
        requirement: &DocumentRequirement,
    ) -> Result<ClassifierVerdict, VerificationError> {
        let timeout = self.policy.classifier_timeout;
        match tokio::time::timeout(timeout, self.classifier.classify(upload, requirement)).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(err)) => {
                warn!(requirement_id = %requirement.id, error = %err, "classifier call failed");
                Err(err.into())
            }
            Err(_) => {
                warn!(requirement_id = %requirement.id, ?timeout, "classifier timed out");
                Err(ClassifierError::TimedOut(timeout).into())
            }
        }
    }

    fn slot(&self, key: &AttemptKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self
            .in_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &AttemptKey, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self
            .in_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(slot);
        if slots
            .get(key)
            .map(|held| Arc::strong_count(held) == 1)
            .unwrap_or(false)
        {
            slots.remove(key);
        }
    }
}

fn apply_verdict(record: &mut DocumentRecord, verdict: &ClassifierVerdict, file_ref: FileRef) {
    record.attempt_count = record.attempt_count.saturating_add(1);
    record.uploaded = true;
    record.file_ref = Some(file_ref);
    record.last_confidence = Some(verdict.normalized_confidence());
    if verdict.accepted {
        record.verified = true;
        record.last_issues.clear();
    } else {
        record.verified = false;
        record.last_issues = verdict.issues.clone();
    }
}

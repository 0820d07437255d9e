//! Outbound delivery of completed submissions to the CRM.
//!
//! A delivery is single-flight per submission id: the first caller leads the
//! attempt and every concurrent caller for the same id waits for and shares
//! the leader's result. The persisted `SYNCING` claim extends the guarantee
//! to other processes sharing the record store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::domain::{
    CrmSyncState, OwnerId, RequirementId, Submission, SubmissionId, SubmissionStage,
};
use super::repository::{read_modify_write, RepositoryError, SubmissionRepository};
use crate::config::SyncConfig;

pub const PAYLOAD_SOURCE: &str = "SecureFlow Document Collection";
pub const PAYLOAD_STATUS: &str = "completed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDocument {
    pub kind: RequirementId,
    pub file_name: Option<String>,
    pub verified: bool,
    pub uploaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSignature {
    pub signed: bool,
    pub signed_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot handed to the CRM. Built once per attempt from the
/// latest stored submission; later edits never reach an in-flight delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub owner_id: OwnerId,
    pub owner_profile: PayloadProfile,
    pub documents: Vec<PayloadDocument>,
    pub signature: PayloadSignature,
    pub submission_id: SubmissionId,
    pub completed_at: DateTime<Utc>,
    pub source: String,
    pub status: String,
}

impl SyncPayload {
    pub fn snapshot(submission: &Submission) -> Result<Self, SyncError> {
        let completed_at = match (submission.stage, submission.completed_at) {
            (SubmissionStage::Completed, Some(at)) => at,
            (stage, _) => return Err(SyncError::NotCompleted(stage)),
        };

        let owner = &submission.owner;
        Ok(Self {
            owner_id: owner.owner_id.clone(),
            owner_profile: PayloadProfile {
                first_name: owner.first_name.clone(),
                last_name: owner.last_name.clone(),
                email: owner.email.clone(),
                phone: owner.phone.clone(),
            },
            documents: submission
                .documents
                .values()
                .map(|record| PayloadDocument {
                    kind: record.requirement_id.clone(),
                    file_name: record.file_ref.as_ref().map(|file| file.file_name.clone()),
                    verified: record.verified,
                    uploaded_at: record.file_ref.as_ref().map(|file| file.uploaded_at),
                })
                .collect(),
            signature: PayloadSignature {
                signed: submission.signature.signed,
                signed_at: submission.signature.signed_at,
            },
            submission_id: submission.id.clone(),
            completed_at,
            source: PAYLOAD_SOURCE.to_string(),
            status: PAYLOAD_STATUS.to_string(),
        })
    }
}

/// Answer from the external CRM for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub ok: bool,
    pub external_id: Option<String>,
    pub retryable: bool,
    pub error_message: Option<String>,
}

impl DeliveryResponse {
    pub fn delivered(external_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            external_id: Some(external_id.into()),
            retryable: false,
            error_message: None,
        }
    }

    pub fn failed(retryable: bool, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            external_id: None,
            retryable,
            error_message: Some(message.into()),
        }
    }
}

/// Transport to the relationship-management system. Implementations classify
/// their own failures as retryable or not.
#[async_trait]
pub trait CrmDelivery: Send + Sync {
    async fn deliver(&self, payload: &SyncPayload) -> DeliveryResponse;
}

/// Outcome of one `sync` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
    /// Sync state observed when the call returned.
    pub state: CrmSyncState,
}

impl SyncResult {
    fn synced(external_id: Option<String>) -> Self {
        Self {
            success: true,
            external_id,
            error: None,
            retryable: false,
            state: CrmSyncState::Synced,
        }
    }

    fn failed(retryable: bool, error: String) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(error),
            retryable,
            state: CrmSyncState::Failed,
        }
    }

    fn in_flight() -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some("delivery already in progress".to_string()),
            retryable: true,
            state: CrmSyncState::Syncing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("submission must be completed before syncing (currently {0})")]
    NotCompleted(SubmissionStage),
    #[error("crm sync failed: {message}")]
    Failed { retryable: bool, message: String },
    #[error("crm sync retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("in-flight sync ended without reporting a result")]
    Interrupted,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Delivery and retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub lease: Duration,
    pub delivery_timeout: Duration,
}

impl SyncPolicy {
    /// Wait after `attempt` failed deliveries: `backoff_base * 2^attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << attempt.min(20))
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base,
            lease: config.lease,
            delivery_timeout: config.delivery_timeout,
        }
    }
}

type Shared = Option<Result<SyncResult, SyncError>>;

enum Flight {
    Leader(watch::Sender<Shared>),
    Follower(watch::Receiver<Shared>),
}

enum Claim {
    Deliver(SyncPayload),
    AlreadySynced(Option<String>),
    Busy,
    Exhausted { attempts: u32, last_error: String },
}

/// Removes the in-flight entry even when the leading future is dropped.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<SubmissionId, watch::Receiver<Shared>>>,
    id: &'a SubmissionId,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(self.id);
    }
}

pub struct SyncCoordinator {
    repository: Arc<dyn SubmissionRepository>,
    delivery: Arc<dyn CrmDelivery>,
    policy: SyncPolicy,
    in_flight: Mutex<HashMap<SubmissionId, watch::Receiver<Shared>>>,
}

impl SyncCoordinator {
    pub fn new(
        repository: Arc<dyn SubmissionRepository>,
        delivery: Arc<dyn CrmDelivery>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            repository,
            delivery,
            policy,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Deliver the submission once. Concurrent calls for the same id share
    /// a single delivery. Refused with `RetriesExhausted` once the submission
    /// has used the policy's delivery ceiling.
    pub async fn sync(&self, id: &SubmissionId) -> Result<SyncResult, SyncError> {
        match self.join_or_lead(id) {
            Flight::Follower(mut receiver) => {
                debug!(submission_id = %id, "joining in-flight crm sync");
                let shared = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| SyncError::Interrupted)?;
                shared.clone().unwrap_or(Err(SyncError::Interrupted))
            }
            Flight::Leader(sender) => {
                let guard = FlightGuard {
                    in_flight: &self.in_flight,
                    id,
                };
                let result = self.lead(id).await;
                drop(guard);
                sender.send_replace(Some(result.clone()));
                result
            }
        }
    }

    /// Repeat `sync` with exponential backoff until it succeeds, a failure is
    /// classified as permanent, or the submission has used `max_attempts`
    /// deliveries. The count is persisted, so every run (automatic or manual)
    /// draws from the same per-submission budget; `max_attempts` is capped by
    /// the policy ceiling.
    pub async fn retry_sync(
        &self,
        id: &SubmissionId,
        max_attempts: u32,
    ) -> Result<SyncResult, SyncError> {
        let ceiling = max_attempts.min(self.policy.max_attempts);
        let current = self.repository.fetch(id)?.ok_or(RepositoryError::NotFound)?;
        if current.stage != SubmissionStage::Completed {
            return Err(SyncError::NotCompleted(current.stage));
        }
        if current.crm_sync_state == CrmSyncState::Synced {
            return Ok(SyncResult::synced(current.external_id));
        }

        let mut attempts = current.sync_attempts;
        let mut backoff_due = current.crm_sync_state == CrmSyncState::Failed;
        let mut last_error = current
            .last_sync_error
            .unwrap_or_else(|| "no delivery attempted yet".to_string());

        while attempts < ceiling {
            if backoff_due {
                let wait = self.policy.backoff_for(attempts);
                info!(submission_id = %id, attempt = attempts + 1, ?wait, "scheduling crm sync retry");
                tokio::time::sleep(wait).await;
            }

            let result = self.sync(id).await?;
            if result.success {
                info!(submission_id = %id, attempt = attempts + 1, "crm sync succeeded");
                return Ok(result);
            }
            if result.state == CrmSyncState::Syncing {
                return Ok(result);
            }

            let stored = self
                .repository
                .fetch(id)?
                .map(|submission| submission.sync_attempts)
                .unwrap_or_default();
            attempts = stored.max(attempts + 1);
            let message = result
                .error
                .unwrap_or_else(|| "unknown delivery failure".to_string());
            if !result.retryable && attempts < ceiling {
                warn!(submission_id = %id, attempts, error = %message, "crm sync failed permanently");
                return Err(SyncError::Failed {
                    retryable: false,
                    message,
                });
            }
            last_error = message;
            backoff_due = true;
        }

        warn!(submission_id = %id, attempts, error = %last_error, "crm sync retries exhausted");
        Err(SyncError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    fn join_or_lead(&self, id: &SubmissionId) -> Flight {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(receiver) = in_flight.get(id) {
            return Flight::Follower(receiver.clone());
        }
        let (sender, receiver) = watch::channel(None);
        in_flight.insert(id.clone(), receiver);
        Flight::Leader(sender)
    }

    async fn lead(&self, id: &SubmissionId) -> Result<SyncResult, SyncError> {
        let lease = chrono::Duration::from_std(self.policy.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let (_, claim) = read_modify_write(self.repository.as_ref(), id, |submission| {
            claim(submission, Utc::now(), lease, self.policy.max_attempts)
        })?;

        let payload = match claim {
            Claim::AlreadySynced(external_id) => return Ok(SyncResult::synced(external_id)),
            Claim::Busy => {
                debug!(submission_id = %id, "crm sync claimed elsewhere");
                return Ok(SyncResult::in_flight());
            }
            Claim::Exhausted {
                attempts,
                last_error,
            } => {
                debug!(submission_id = %id, attempts, "crm sync ceiling reached, not delivering");
                return Err(SyncError::RetriesExhausted {
                    attempts,
                    last_error,
                });
            }
            Claim::Deliver(payload) => payload,
        };

        info!(submission_id = %id, documents = payload.documents.len(), "delivering submission to crm");
        let response = match tokio::time::timeout(
            self.policy.delivery_timeout,
            self.delivery.deliver(&payload),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => DeliveryResponse::failed(
                true,
                format!(
                    "crm delivery timed out after {:?}",
                    self.policy.delivery_timeout
                ),
            ),
        };

        let result = if response.ok {
            SyncResult::synced(response.external_id)
        } else {
            SyncResult::failed(
                response.retryable,
                response
                    .error_message
                    .unwrap_or_else(|| "crm rejected the submission".to_string()),
            )
        };

        read_modify_write(self.repository.as_ref(), id, |submission| {
            record_result(submission, &result);
            Ok::<_, SyncError>(())
        })?;

        if result.success {
            info!(submission_id = %id, external_id = ?result.external_id, "crm sync succeeded");
        } else {
            warn!(
                submission_id = %id,
                retryable = result.retryable,
                error = ?result.error,
                "crm sync failed"
            );
        }
        Ok(result)
    }
}

fn claim(
    submission: &mut Submission,
    now: DateTime<Utc>,
    lease: chrono::Duration,
    max_attempts: u32,
) -> Result<Claim, SyncError> {
    match submission.crm_sync_state {
        CrmSyncState::Synced => return Ok(Claim::AlreadySynced(submission.external_id.clone())),
        CrmSyncState::Syncing => {
            let fresh = submission
                .sync_started_at
                .map(|started| now - started < lease)
                .unwrap_or(false);
            if fresh {
                return Ok(Claim::Busy);
            }
        }
        CrmSyncState::Pending | CrmSyncState::Failed => {}
    }
    if submission.sync_attempts >= max_attempts {
        // a stale claim left by the last allowed delivery settles as FAILED
        submission.crm_sync_state = CrmSyncState::Failed;
        submission.sync_started_at = None;
        return Ok(Claim::Exhausted {
            attempts: submission.sync_attempts,
            last_error: submission
                .last_sync_error
                .clone()
                .unwrap_or_else(|| "delivery ceiling reached".to_string()),
        });
    }

    let payload = SyncPayload::snapshot(submission)?;
    submission.crm_sync_state = CrmSyncState::Syncing;
    submission.sync_started_at = Some(now);
    submission.sync_attempts = submission.sync_attempts.saturating_add(1);
    Ok(Claim::Deliver(payload))
}

fn record_result(submission: &mut Submission, result: &SyncResult) {
    submission.sync_started_at = None;
    if result.success {
        submission.crm_sync_state = CrmSyncState::Synced;
        submission.external_id = result.external_id.clone();
        submission.last_sync_error = None;
    } else {
        submission.crm_sync_state = CrmSyncState::Failed;
        submission.last_sync_error = result.error.clone();
    }
}

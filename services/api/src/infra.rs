use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusHandle;
use secureflow::workflows::intake::{
    Collaborators, CrmDelivery, DeliveryResponse, KeywordClassifier, Notifier, NotifyError,
    OwnerId, ReminderKind, RepositoryError, Submission, SubmissionId, SubmissionRepository,
    SyncPayload,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<SubmissionId, Submission>,
    by_owner: HashMap<OwnerId, SubmissionId>,
}

/// Process-local record store with version compare-and-swap on update.
#[derive(Default, Clone)]
pub(crate) struct InMemorySubmissionRepository {
    records: Arc<Mutex<Records>>,
}

impl InMemorySubmissionRepository {
    fn lock(&self) -> Result<MutexGuard<'_, Records>, RepositoryError> {
        self.records
            .lock()
            .map_err(|_| RepositoryError::Unavailable("record store lock poisoned".to_string()))
    }
}

impl SubmissionRepository for InMemorySubmissionRepository {
    fn insert(&self, submission: Submission) -> Result<Submission, RepositoryError> {
        let mut guard = self.lock()?;
        if guard.by_owner.contains_key(submission.owner_id())
            || guard.by_id.contains_key(submission.id())
        {
            return Err(RepositoryError::Conflict);
        }
        let submission = submission.with_version(1);
        guard
            .by_owner
            .insert(submission.owner_id().clone(), submission.id().clone());
        guard
            .by_id
            .insert(submission.id().clone(), submission.clone());
        Ok(submission)
    }

    fn update(&self, submission: Submission) -> Result<Submission, RepositoryError> {
        let mut guard = self.lock()?;
        let current = guard
            .by_id
            .get(submission.id())
            .map(Submission::version)
            .ok_or(RepositoryError::NotFound)?;
        if current != submission.version() {
            return Err(RepositoryError::Conflict);
        }
        let submission = submission.with_version(current + 1);
        guard
            .by_id
            .insert(submission.id().clone(), submission.clone());
        Ok(submission)
    }

    fn fetch(&self, id: &SubmissionId) -> Result<Option<Submission>, RepositoryError> {
        Ok(self.lock()?.by_id.get(id).cloned())
    }

    fn fetch_by_owner(&self, owner: &OwnerId) -> Result<Option<Submission>, RepositoryError> {
        let guard = self.lock()?;
        Ok(guard
            .by_owner
            .get(owner)
            .and_then(|id| guard.by_id.get(id))
            .cloned())
    }
}

/// Stand-in for the CRM webhook. Waits `latency`, fails the first
/// `transient_failures` deliveries with a retryable error, then issues
/// sequential `CRM-` record ids.
pub(crate) struct SimulatedCrmDelivery {
    latency: Duration,
    transient_failures: AtomicU32,
    sequence: AtomicU64,
}

impl SimulatedCrmDelivery {
    pub(crate) fn new(latency: Duration, transient_failures: u32) -> Self {
        Self {
            latency,
            transient_failures: AtomicU32::new(transient_failures),
            sequence: AtomicU64::new(1),
        }
    }
}

impl Default for SimulatedCrmDelivery {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500), 0)
    }
}

#[async_trait]
impl CrmDelivery for SimulatedCrmDelivery {
    async fn deliver(&self, payload: &SyncPayload) -> DeliveryResponse {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let should_fail = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            warn!(submission_id = %payload.submission_id, "simulated crm returned 503");
            return DeliveryResponse::failed(true, "crm responded 503 service unavailable");
        }

        let record = self.sequence.fetch_add(1, Ordering::SeqCst);
        let external_id = format!("CRM-{record:06}");
        info!(
            submission_id = %payload.submission_id,
            %external_id,
            documents = payload.documents.len(),
            "simulated crm record created"
        );
        DeliveryResponse::delivered(external_id)
    }
}

/// Writes reminders to the log instead of an SMS or e-mail gateway.
#[derive(Default, Clone)]
pub(crate) struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, kind: ReminderKind, contact: &str) -> Result<(), NotifyError> {
        info!(reminder = %kind, %contact, message = kind.message(), "reminder sent");
        Ok(())
    }
}

pub(crate) fn in_process_collaborators(delivery: SimulatedCrmDelivery) -> Collaborators {
    Collaborators {
        repository: Arc::new(InMemorySubmissionRepository::default()),
        classifier: Arc::new(KeywordClassifier::standard()),
        delivery: Arc::new(delivery),
        notifier: Arc::new(LoggingNotifier),
    }
}

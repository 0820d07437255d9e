use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use serde_json::Value;

use crate::config::WorkflowConfig;
use crate::workflows::intake::classifier::{ClassifierError, ClassifierVerdict, DocumentClassifier};
use crate::workflows::intake::domain::{
    DocumentRequirement, DocumentUpload, OwnerId, OwnerProfile, RequirementId, Submission,
    SubmissionId,
};
use crate::workflows::intake::reminders::{Notifier, NotifyError, ReminderKind};
use crate::workflows::intake::repository::{RepositoryError, SubmissionRepository};
use crate::workflows::intake::sync::{CrmDelivery, DeliveryResponse, SyncPayload};
use crate::workflows::intake::{
    intake_router, Collaborators, IntakeService, KeywordClassifier, RequirementCatalog,
};

pub(super) const OWNER: &str = "owner-42";

pub(super) fn owner_id() -> OwnerId {
    OwnerId(OWNER.to_string())
}

pub(super) fn profile(owner: &str) -> OwnerProfile {
    OwnerProfile {
        owner_id: OwnerId(owner.to_string()),
        first_name: "Jordan".to_string(),
        last_name: "Alvarez".to_string(),
        email: "jordan@example.com".to_string(),
        phone: Some("555-0100".to_string()),
    }
}

/// File names the keyword classifier accepts for each standard requirement.
pub(super) fn accepted_upload(requirement: &str) -> DocumentUpload {
    let file_name = match requirement {
        "proof-id" => "passport.pdf",
        "proof-address" => "utility-bill.pdf",
        "bank-statement" => "bank-march.pdf",
        "written-summary" => "summary.pdf",
        "authorization" => "auth-form.pdf",
        other => other,
    };
    DocumentUpload::new(
        file_name,
        Some("application/pdf".to_string()),
        b"%PDF-1.7 scanned".to_vec(),
    )
}

pub(super) fn rejected_upload() -> DocumentUpload {
    DocumentUpload::new("IMG_0042.jpg", Some("image/jpeg".to_string()), vec![0xFF, 0xD8])
}

pub(super) const STANDARD_REQUIREMENTS: [&str; 5] = [
    "proof-id",
    "proof-address",
    "bank-statement",
    "written-summary",
    "authorization",
];

/// Workflow settings with fast retries for deterministic paused-time tests.
pub(super) fn workflow_config() -> WorkflowConfig {
    let mut config = WorkflowConfig::default();
    config.sync.backoff_base = Duration::from_secs(1);
    config.reminders.incomplete_delay = Duration::from_secs(60 * 60);
    config.reminders.signature_delay = Duration::from_secs(30 * 60);
    config
}

pub(super) struct Harness {
    pub(super) service: Arc<IntakeService>,
    pub(super) repository: Arc<MemoryRepository>,
    pub(super) delivery: Arc<ScriptedDelivery>,
    pub(super) notifier: Arc<RecordingNotifier>,
}

pub(super) fn harness_with(
    classifier: Arc<dyn DocumentClassifier>,
    delivery: ScriptedDelivery,
    config: WorkflowConfig,
) -> Harness {
    let repository = Arc::new(MemoryRepository::default());
    let delivery = Arc::new(delivery);
    let notifier = Arc::new(RecordingNotifier::default());
    let service = IntakeService::new(
        Collaborators {
            repository: repository.clone(),
            classifier,
            delivery: delivery.clone(),
            notifier: notifier.clone(),
        },
        RequirementCatalog::standard(),
        config,
    );
    Harness {
        service: Arc::new(service),
        repository,
        delivery,
        notifier,
    }
}

pub(super) fn harness() -> Harness {
    harness_with(
        Arc::new(KeywordClassifier::standard()),
        ScriptedDelivery::default(),
        workflow_config(),
    )
}

/// Open a submission and verify every standard document.
pub(super) async fn verified_submission(harness: &Harness) -> SubmissionId {
    let view = harness
        .service
        .open_submission(profile(OWNER))
        .expect("submission opens");
    for requirement in STANDARD_REQUIREMENTS {
        let result = harness
            .service
            .submit_document(
                &owner_id(),
                &RequirementId::new(requirement),
                accepted_upload(requirement),
            )
            .await
            .expect("document accepted");
        assert!(result.verification.verified, "{requirement} should verify");
    }
    view.submission_id
}

#[derive(Default)]
pub(super) struct MemoryRepository {
    records: Mutex<HashMap<SubmissionId, Submission>>,
}

impl MemoryRepository {
    pub(super) fn stored(&self, id: &SubmissionId) -> Submission {
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .get(id)
            .cloned()
            .expect("submission stored")
    }

    pub(super) fn with_stored(&self, id: &SubmissionId, edit: impl FnOnce(&mut Submission)) {
        let mut guard = self.records.lock().expect("repository mutex poisoned");
        let record = guard.get_mut(id).expect("submission stored");
        edit(record);
    }
}

impl SubmissionRepository for MemoryRepository {
    fn insert(&self, submission: Submission) -> Result<Submission, RepositoryError> {
        let mut guard = self.records.lock().expect("repository mutex poisoned");
        let owner_taken = guard
            .values()
            .any(|stored| stored.owner_id() == submission.owner_id());
        if owner_taken || guard.contains_key(submission.id()) {
            return Err(RepositoryError::Conflict);
        }
        let submission = submission.with_version(1);
        guard.insert(submission.id().clone(), submission.clone());
        Ok(submission)
    }

    fn update(&self, submission: Submission) -> Result<Submission, RepositoryError> {
        let mut guard = self.records.lock().expect("repository mutex poisoned");
        let stored = guard.get(submission.id()).ok_or(RepositoryError::NotFound)?;
        if stored.version() != submission.version() {
            return Err(RepositoryError::Conflict);
        }
        let submission = submission.with_version(stored.version() + 1);
        guard.insert(submission.id().clone(), submission.clone());
        Ok(submission)
    }

    fn fetch(&self, id: &SubmissionId) -> Result<Option<Submission>, RepositoryError> {
        let guard = self.records.lock().expect("repository mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn fetch_by_owner(&self, owner: &OwnerId) -> Result<Option<Submission>, RepositoryError> {
        let guard = self.records.lock().expect("repository mutex poisoned");
        Ok(guard
            .values()
            .find(|stored| stored.owner_id() == owner)
            .cloned())
    }
}

pub(super) struct UnavailableRepository;

impl SubmissionRepository for UnavailableRepository {
    fn insert(&self, _submission: Submission) -> Result<Submission, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn update(&self, _submission: Submission) -> Result<Submission, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &SubmissionId) -> Result<Option<Submission>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch_by_owner(&self, _owner: &OwnerId) -> Result<Option<Submission>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

/// Classifier replaying a fixed script, then repeating the last entry.
pub(super) struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<ClassifierVerdict, ClassifierError>>>,
    last: Mutex<Option<Result<ClassifierVerdict, ClassifierError>>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedClassifier {
    pub(super) fn new(script: Vec<Result<ClassifierVerdict, ClassifierError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub(super) fn always(verdict: Result<ClassifierVerdict, ClassifierError>) -> Self {
        Self::new(vec![verdict])
    }

    pub(super) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        _upload: &DocumentUpload,
        _requirement: &DocumentRequirement,
    ) -> Result<ClassifierVerdict, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().expect("script mutex poisoned").pop_front();
        let mut last = self.last.lock().expect("script mutex poisoned");
        match next {
            Some(entry) => {
                *last = Some(entry.clone());
                entry
            }
            None => last
                .clone()
                .unwrap_or_else(|| Ok(ClassifierVerdict::accepted(0.9))),
        }
    }
}

/// CRM double replaying scripted responses; once exhausted it succeeds with
/// `CRM-<n>` where `n` counts deliveries.
#[derive(Default)]
pub(super) struct ScriptedDelivery {
    script: Mutex<VecDeque<DeliveryResponse>>,
    payloads: Mutex<Vec<SyncPayload>>,
    delivered_at: Mutex<Vec<tokio::time::Instant>>,
    latency: Duration,
}

impl ScriptedDelivery {
    pub(super) fn new(script: Vec<DeliveryResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(super) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(super) fn calls(&self) -> usize {
        self.payloads.lock().expect("delivery mutex poisoned").len()
    }

    pub(super) fn payloads(&self) -> Vec<SyncPayload> {
        self.payloads.lock().expect("delivery mutex poisoned").clone()
    }

    pub(super) fn delivered_at(&self) -> Vec<tokio::time::Instant> {
        self.delivered_at
            .lock()
            .expect("delivery mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl CrmDelivery for ScriptedDelivery {
    async fn deliver(&self, payload: &SyncPayload) -> DeliveryResponse {
        let call = {
            let mut payloads = self.payloads.lock().expect("delivery mutex poisoned");
            payloads.push(payload.clone());
            payloads.len()
        };
        self.delivered_at
            .lock()
            .expect("delivery mutex poisoned")
            .push(tokio::time::Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.script
            .lock()
            .expect("delivery mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| DeliveryResponse::delivered(format!("CRM-{call}")))
    }
}

#[derive(Default)]
pub(super) struct RecordingNotifier {
    sent: Mutex<Vec<(ReminderKind, String)>>,
}

impl RecordingNotifier {
    pub(super) fn sent(&self) -> Vec<(ReminderKind, String)> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, kind: ReminderKind, contact: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier mutex poisoned")
            .push((kind, contact.to_string()));
        Ok(())
    }
}

pub(super) fn router(harness: &Harness) -> axum::Router {
    intake_router(harness.service.clone())
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

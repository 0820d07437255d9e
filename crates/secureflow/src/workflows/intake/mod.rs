//! Applicant document intake: per-document verification with bounded
//! attempts, the COLLECTING → SIGNING → COMPLETED progression, outbound CRM
//! synchronization, and stall reminders.

pub mod catalog;
pub mod classifier;
pub mod domain;
pub mod machine;
pub mod reminders;
pub mod repository;
pub mod router;
pub mod service;
pub mod sync;
pub mod verification;
pub mod view;

#[cfg(test)]
mod tests;

pub use catalog::{CatalogError, RequirementCatalog};
pub use classifier::{ClassifierError, ClassifierVerdict, DocumentClassifier, KeywordClassifier};
pub use domain::{
    CrmSyncState, DocumentRecord, DocumentRequirement, DocumentStatus, DocumentUpload, FileRef,
    OwnerId, OwnerProfile, RequirementId, SignatureRecord, Submission, SubmissionId,
    SubmissionStage,
};
pub use machine::{GuardFailure, Transition, TransitionError};
pub use reminders::{Notifier, NotifyError, ReminderKind, ReminderScheduler};
pub use repository::{read_modify_write, RepositoryError, SubmissionRepository};
pub use router::intake_router;
pub use service::{Collaborators, Completion, DocumentSubmission, IntakeService, WorkflowError};
pub use sync::{
    CrmDelivery, DeliveryResponse, SyncCoordinator, SyncError, SyncPayload, SyncPolicy,
    SyncResult,
};
pub use verification::{
    VerificationError, VerificationOutcome, VerificationPolicy, VerificationTracker,
};
pub use view::{DocumentView, SignatureView, SubmissionView};

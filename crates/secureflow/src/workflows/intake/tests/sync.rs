use super::common::*;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::workflows::intake::domain::{CrmSyncState, Submission, SubmissionId, SubmissionStage};
use crate::workflows::intake::repository::SubmissionRepository;
use crate::workflows::intake::sync::{
    DeliveryResponse, SyncCoordinator, SyncError, SyncPayload, SyncPolicy,
};
use crate::workflows::intake::RequirementCatalog;

fn completed_submission(repository: &MemoryRepository, id: &str) -> SubmissionId {
    let now = Utc::now();
    let mut submission = Submission::new(
        SubmissionId(id.to_string()),
        profile(&format!("owner-{id}")),
        &RequirementCatalog::standard(),
        now,
    );
    for record in submission.documents.values_mut() {
        record.uploaded = true;
        record.verified = true;
    }
    submission.advance_to_signing().expect("signing");
    submission.record_signature(now);
    submission.complete(now).expect("completes");
    repository
        .insert(submission)
        .expect("insert succeeds")
        .id()
        .clone()
}

fn coordinator(
    delivery: ScriptedDelivery,
) -> (Arc<SyncCoordinator>, Arc<MemoryRepository>, Arc<ScriptedDelivery>) {
    let repository = Arc::new(MemoryRepository::default());
    let delivery = Arc::new(delivery);
    let coordinator = Arc::new(SyncCoordinator::new(
        repository.clone(),
        delivery.clone(),
        SyncPolicy::default(),
    ));
    (coordinator, repository, delivery)
}

#[tokio::test(start_paused = true)]
async fn concurrent_syncs_share_a_single_delivery() {
    let (coordinator, repository, delivery) =
        coordinator(ScriptedDelivery::default().with_latency(Duration::from_secs(1)));
    let id = completed_submission(&repository, "sub-concurrent");

    let (first, second) = tokio::join!(coordinator.sync(&id), coordinator.sync(&id));
    let first = first.expect("first sync");
    let second = second.expect("second sync");

    assert_eq!(delivery.calls(), 1);
    assert!(first.success && second.success);
    assert_eq!(first.external_id.as_deref(), Some("CRM-1"));
    assert_eq!(first, second);
    assert_eq!(repository.stored(&id).crm_sync_state(), CrmSyncState::Synced);
}

#[tokio::test(start_paused = true)]
async fn spawned_syncs_from_many_tasks_deliver_once() {
    let (coordinator, repository, delivery) =
        coordinator(ScriptedDelivery::default().with_latency(Duration::from_millis(500)));
    let id = completed_submission(&repository, "sub-spawned");

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let id = id.clone();
            tokio::spawn(async move { coordinator.sync(&id).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.expect("joins").expect("sync");
        assert_eq!(result.external_id.as_deref(), Some("CRM-1"));
    }
    assert_eq!(delivery.calls(), 1);
}

#[tokio::test]
async fn synced_submissions_return_the_stored_external_id() {
    let (coordinator, repository, delivery) =
        coordinator(ScriptedDelivery::new(vec![DeliveryResponse::delivered("CRM-77")]));
    let id = completed_submission(&repository, "sub-synced");

    coordinator.sync(&id).await.expect("first sync");
    let again = coordinator.sync(&id).await.expect("second sync");

    assert!(again.success);
    assert_eq!(again.external_id.as_deref(), Some("CRM-77"));
    assert_eq!(delivery.calls(), 1);

    let retried = coordinator.retry_sync(&id, 3).await.expect("already synced");
    assert_eq!(retried.external_id.as_deref(), Some("CRM-77"));
    assert_eq!(delivery.calls(), 1);
}

#[tokio::test]
async fn sync_requires_a_completed_submission() {
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::default());
    let submission = Submission::new(
        SubmissionId("sub-open".to_string()),
        profile(OWNER),
        &RequirementCatalog::standard(),
        Utc::now(),
    );
    let id = repository.insert(submission).expect("insert").id().clone();

    assert_eq!(
        coordinator.sync(&id).await,
        Err(SyncError::NotCompleted(SubmissionStage::Collecting))
    );
    assert_eq!(delivery.calls(), 0);
    assert_eq!(repository.stored(&id).crm_sync_state(), CrmSyncState::Pending);
}

#[tokio::test]
async fn fresh_claims_block_delivery_and_stale_claims_are_reclaimed() {
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::default());
    let id = completed_submission(&repository, "sub-claimed");

    repository.with_stored(&id, |submission| {
        submission.crm_sync_state = CrmSyncState::Syncing;
        submission.sync_started_at = Some(Utc::now());
    });
    let observed = coordinator.sync(&id).await.expect("observes claim");
    assert!(!observed.success);
    assert_eq!(observed.state, CrmSyncState::Syncing);
    assert_eq!(delivery.calls(), 0);

    repository.with_stored(&id, |submission| {
        submission.sync_started_at = Some(Utc::now() - chrono::Duration::minutes(10));
    });
    let reclaimed = coordinator.sync(&id).await.expect("reclaims");
    assert!(reclaimed.success);
    assert_eq!(delivery.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_backoff_doubles_and_stops_at_the_ceiling() {
    let failures = (0..5)
        .map(|_| DeliveryResponse::failed(true, "503 from crm"))
        .collect();
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::new(failures));
    let id = completed_submission(&repository, "sub-backoff");
    let started = tokio::time::Instant::now();

    match coordinator.retry_sync(&id, 3).await {
        Err(SyncError::RetriesExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, "503 from crm");
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let offsets: Vec<Duration> = delivery
        .delivered_at()
        .into_iter()
        .map(|at| at - started)
        .collect();
    assert_eq!(
        offsets,
        vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(6)
        ]
    );
    let stored = repository.stored(&id);
    assert_eq!(stored.sync_attempts(), 3);
    assert_eq!(stored.crm_sync_state(), CrmSyncState::Failed);
    assert_eq!(stored.stage(), SubmissionStage::Completed);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_ends_a_retry_run_early() {
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::new(vec![
        DeliveryResponse::failed(false, "schema mismatch"),
    ]));
    let id = completed_submission(&repository, "sub-permanent");

    assert_eq!(
        coordinator.retry_sync(&id, 3).await,
        Err(SyncError::Failed {
            retryable: false,
            message: "schema mismatch".to_string()
        })
    );
    assert_eq!(delivery.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_on_the_last_allowed_attempt_reports_exhaustion() {
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::new(vec![
        DeliveryResponse::failed(true, "503 from crm"),
        DeliveryResponse::failed(true, "503 from crm"),
        DeliveryResponse::failed(false, "schema mismatch"),
    ]));
    let id = completed_submission(&repository, "sub-last-permanent");

    assert_eq!(
        coordinator.retry_sync(&id, 3).await,
        Err(SyncError::RetriesExhausted {
            attempts: 3,
            last_error: "schema mismatch".to_string()
        })
    );
    assert_eq!(delivery.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_submissions_refuse_further_deliveries() {
    let failures = (0..10)
        .map(|_| DeliveryResponse::failed(true, "503 from crm"))
        .collect();
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::new(failures));
    let id = completed_submission(&repository, "sub-exhausted");

    assert!(matches!(
        coordinator.retry_sync(&id, 3).await,
        Err(SyncError::RetriesExhausted { attempts: 3, .. })
    ));
    for _ in 0..3 {
        assert!(matches!(
            coordinator.retry_sync(&id, 3).await,
            Err(SyncError::RetriesExhausted { attempts: 3, .. })
        ));
    }
    assert_eq!(
        coordinator.sync(&id).await,
        Err(SyncError::RetriesExhausted {
            attempts: 3,
            last_error: "503 from crm".to_string()
        })
    );
    assert_eq!(delivery.calls(), 3);
    assert_eq!(repository.stored(&id).sync_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn runs_share_one_budget_per_submission() {
    let failures = (0..10)
        .map(|_| DeliveryResponse::failed(true, "503 from crm"))
        .collect();
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::new(failures));
    let id = completed_submission(&repository, "sub-budget");

    let first = coordinator.sync(&id).await.expect("first delivery");
    assert!(!first.success && first.retryable);

    match coordinator.retry_sync(&id, 3).await {
        Err(SyncError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(delivery.calls(), 3);
}

#[tokio::test]
async fn stale_claim_at_the_ceiling_settles_as_failed() {
    let (coordinator, repository, delivery) = coordinator(ScriptedDelivery::default());
    let id = completed_submission(&repository, "sub-stale-ceiling");
    repository.with_stored(&id, |submission| {
        submission.crm_sync_state = CrmSyncState::Syncing;
        submission.sync_started_at = Some(Utc::now() - chrono::Duration::minutes(10));
        submission.sync_attempts = 3;
        submission.last_sync_error = Some("crm delivery timed out".to_string());
    });

    assert!(matches!(
        coordinator.sync(&id).await,
        Err(SyncError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(delivery.calls(), 0);
    let stored = repository.stored(&id);
    assert_eq!(stored.crm_sync_state(), CrmSyncState::Failed);
    assert_eq!(stored.sync_started_at, None);
}

#[tokio::test(start_paused = true)]
async fn hung_delivery_times_out_as_retryable() {
    let (coordinator, repository, _) =
        coordinator(ScriptedDelivery::default().with_latency(Duration::from_secs(120)));
    let id = completed_submission(&repository, "sub-hung");

    let result = coordinator.sync(&id).await.expect("sync returns");
    assert!(!result.success);
    assert!(result.retryable);
    assert_eq!(result.state, CrmSyncState::Failed);
    let stored = repository.stored(&id);
    assert_eq!(stored.crm_sync_state(), CrmSyncState::Failed);
    assert!(stored
        .last_sync_error()
        .is_some_and(|error| error.contains("timed out")));
}

#[tokio::test(start_paused = true)]
async fn in_flight_payload_ignores_later_edits() {
    let (coordinator, repository, delivery) =
        coordinator(ScriptedDelivery::default().with_latency(Duration::from_secs(1)));
    let id = completed_submission(&repository, "sub-snapshot");

    let sync = coordinator.sync(&id);
    let edit = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        repository.with_stored(&id, |submission| {
            submission.owner.email = "changed@example.com".to_string();
        });
    };
    let (result, ()) = tokio::join!(sync, edit);
    result.expect("sync");

    let payloads = delivery.payloads();
    assert_eq!(payloads[0].owner_profile.email, "jordan@example.com");
}

#[test]
fn payload_serializes_with_camel_case_keys() {
    let repository = MemoryRepository::default();
    let id = completed_submission(&repository, "sub-json");
    let payload = SyncPayload::snapshot(&repository.stored(&id)).expect("snapshot");
    let json = serde_json::to_value(&payload).expect("serializes");

    assert_eq!(json["submissionId"], "sub-json");
    assert_eq!(json["source"], "SecureFlow Document Collection");
    assert_eq!(json["ownerProfile"]["firstName"], "Jordan");
    assert_eq!(json["documents"][0]["kind"], "authorization");
    assert!(json["completedAt"].is_string());
    assert_eq!(json["signature"]["signed"], true);
}

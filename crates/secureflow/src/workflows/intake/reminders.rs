use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::domain::SubmissionId;
use crate::config::ReminderConfig;

/// Condition a reminder nudges the applicant about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Incomplete,
    MissingSignature,
}

impl ReminderKind {
    pub const ALL: [ReminderKind; 2] = [ReminderKind::Incomplete, ReminderKind::MissingSignature];

    pub const fn label(self) -> &'static str {
        match self {
            ReminderKind::Incomplete => "incomplete",
            ReminderKind::MissingSignature => "missing_signature",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            ReminderKind::Incomplete => {
                "Reminder: Please complete your document upload to continue with your application."
            }
            ReminderKind::MissingSignature => {
                "Reminder: Your electronic signature is required to finalize your application."
            }
        }
    }
}

impl fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification could not be delivered: {0}")]
    Failed(String),
}

/// Outbound channel for reminders (SMS, e-mail, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: ReminderKind, contact: &str) -> Result<(), NotifyError>;
}

type TimerKey = (SubmissionId, ReminderKind);

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    timers: HashMap<TimerKey, Timer>,
    next_generation: u64,
    closed: bool,
}

/// Process-wide registry of one-shot reminder timers.
///
/// At most one timer is pending per `(submission, kind)`; arming again
/// cancels the pending one first. Each timer carries a generation so a
/// replaced timer that already woke up cannot fire. Timers run on the
/// runtime that was current when the scheduler was built, so arming works
/// from synchronous callers too.
pub struct ReminderScheduler {
    notifier: Arc<dyn Notifier>,
    enabled: bool,
    runtime: Option<Handle>,
    registry: Arc<Mutex<Registry>>,
}

impl ReminderScheduler {
    pub fn new(notifier: Arc<dyn Notifier>, enabled: bool) -> Self {
        Self {
            notifier,
            enabled,
            runtime: Handle::try_current().ok(),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn from_config(notifier: Arc<dyn Notifier>, config: &ReminderConfig) -> Self {
        Self::new(notifier, config.enabled)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn arm_incomplete_reminder(
        &self,
        submission_id: &SubmissionId,
        contact: Option<&str>,
        delay: Duration,
    ) -> bool {
        self.arm(submission_id, ReminderKind::Incomplete, contact, delay)
    }

    pub fn arm_signature_reminder(
        &self,
        submission_id: &SubmissionId,
        contact: Option<&str>,
        delay: Duration,
    ) -> bool {
        self.arm(submission_id, ReminderKind::MissingSignature, contact, delay)
    }

    /// Schedule `kind` for `submission_id`, replacing any pending timer.
    /// Returns whether a timer is now pending.
    pub fn arm(
        &self,
        submission_id: &SubmissionId,
        kind: ReminderKind,
        contact: Option<&str>,
        delay: Duration,
    ) -> bool {
        if !self.enabled {
            debug!(%submission_id, %kind, "reminders disabled, not arming");
            return false;
        }
        let Some(contact) = contact.map(str::to_string) else {
            debug!(%submission_id, %kind, "no contact on file, not arming reminder");
            return false;
        };
        let Some(runtime) = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!(%submission_id, %kind, "no async runtime available, reminder not armed");
            return false;
        };

        let mut registry = lock(&self.registry);
        if registry.closed {
            debug!(%submission_id, %kind, "scheduler shut down, ignoring arm");
            return false;
        }

        registry.next_generation += 1;
        let generation = registry.next_generation;
        let key = (submission_id.clone(), kind);

        let handle = runtime.spawn(fire_after(
            Arc::clone(&self.registry),
            Arc::clone(&self.notifier),
            key.clone(),
            generation,
            contact,
            delay,
        ));

        if let Some(previous) = registry.timers.insert(key, Timer { generation, handle }) {
            previous.handle.abort();
            debug!(%submission_id, %kind, "replaced pending reminder");
        }
        debug!(%submission_id, %kind, ?delay, "reminder armed");
        true
    }

    /// Cancel a pending reminder. Returns `false` when nothing was pending.
    pub fn disarm(&self, submission_id: &SubmissionId, kind: ReminderKind) -> bool {
        let removed = lock(&self.registry)
            .timers
            .remove(&(submission_id.clone(), kind));
        match removed {
            Some(timer) => {
                timer.handle.abort();
                debug!(%submission_id, %kind, "reminder disarmed");
                true
            }
            None => false,
        }
    }

    /// Cancel every reminder belonging to `submission_id`.
    pub fn disarm_all(&self, submission_id: &SubmissionId) -> usize {
        ReminderKind::ALL
            .into_iter()
            .filter(|kind| self.disarm(submission_id, *kind))
            .count()
    }

    pub fn is_pending(&self, submission_id: &SubmissionId, kind: ReminderKind) -> bool {
        lock(&self.registry)
            .timers
            .contains_key(&(submission_id.clone(), kind))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.registry).timers.len()
    }

    /// Cancel all outstanding timers; later arms are ignored.
    pub fn shutdown(&self) {
        let mut registry = lock(&self.registry);
        registry.closed = true;
        let cancelled = registry.timers.len();
        for (_, timer) in registry.timers.drain() {
            timer.handle.abort();
        }
        info!(cancelled, "reminder scheduler shut down");
    }
}

impl Drop for ReminderScheduler {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        registry.closed = true;
        for (_, timer) in registry.timers.drain() {
            timer.handle.abort();
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn fire_after(
    registry: Arc<Mutex<Registry>>,
    notifier: Arc<dyn Notifier>,
    key: TimerKey,
    generation: u64,
    contact: String,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;

    {
        let mut registry = lock(&registry);
        match registry.timers.get(&key) {
            Some(timer) if timer.generation == generation => {
                registry.timers.remove(&key);
            }
            _ => return,
        }
    }

    let (submission_id, kind) = key;
    match notifier.notify(kind, &contact).await {
        Ok(()) => info!(%submission_id, %kind, "reminder sent"),
        Err(err) => warn!(%submission_id, %kind, error = %err, "reminder delivery failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(ReminderKind, String)>>,
    }

    impl RecordingNotifier {
        fn sent(&self) -> Vec<(ReminderKind, String)> {
            self.sent.lock().expect("notifier mutex").clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, kind: ReminderKind, contact: &str) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .expect("notifier mutex")
                .push((kind, contact.to_string()));
            Ok(())
        }
    }

    fn scheduler(enabled: bool) -> (ReminderScheduler, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        (ReminderScheduler::new(notifier.clone(), enabled), notifier)
    }

    fn id() -> SubmissionId {
        SubmissionId("sub-000001".to_string())
    }

    const CONTACT: Option<&str> = Some("dana@example.com");

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (scheduler, notifier) = scheduler(true);
        assert!(scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(60)));
        assert!(scheduler.is_pending(&id(), ReminderKind::Incomplete));

        advance(Duration::from_secs(59)).await;
        assert!(notifier.sent().is_empty());

        advance(Duration::from_secs(2)).await;
        assert_eq!(
            notifier.sent(),
            vec![(ReminderKind::Incomplete, "dana@example.com".to_string())]
        );
        assert!(!scheduler.is_pending(&id(), ReminderKind::Incomplete));
        assert!(!scheduler.disarm(&id(), ReminderKind::Incomplete));
    }

    #[tokio::test(start_paused = true)]
    async fn arming_twice_replaces_the_pending_timer() {
        let (scheduler, notifier) = scheduler(true);
        scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(600));
        scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(1200));
        assert_eq!(scheduler.pending_count(), 1);

        advance(Duration::from_secs(900)).await;
        assert!(notifier.sent().is_empty());

        advance(Duration::from_secs(400)).await;
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timers_never_fire() {
        let (scheduler, notifier) = scheduler(true);
        scheduler.arm_signature_reminder(&id(), CONTACT, Duration::from_secs(30));
        scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(30));

        assert!(scheduler.disarm(&id(), ReminderKind::MissingSignature));
        assert!(!scheduler.disarm(&id(), ReminderKind::MissingSignature));
        assert_eq!(scheduler.disarm_all(&id()), 1);

        advance(Duration::from_secs(60)).await;
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn kinds_are_tracked_independently() {
        let (scheduler, notifier) = scheduler(true);
        scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(10));
        scheduler.arm_signature_reminder(&id(), CONTACT, Duration::from_secs(20));
        assert_eq!(scheduler.pending_count(), 2);

        advance(Duration::from_secs(25)).await;
        let kinds: Vec<ReminderKind> = notifier.sent().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![ReminderKind::Incomplete, ReminderKind::MissingSignature]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_scheduler_and_missing_contact_do_not_arm() {
        let (disabled, _) = scheduler(false);
        assert!(!disabled.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(1)));
        assert_eq!(disabled.pending_count(), 0);

        let (enabled, _) = scheduler(true);
        assert!(!enabled.arm_incomplete_reminder(&id(), None, Duration::from_secs(1)));
        assert_eq!(enabled.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything_and_rejects_new_timers() {
        let (scheduler, notifier) = scheduler(true);
        scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(5));
        scheduler.arm_signature_reminder(&id(), CONTACT, Duration::from_secs(5));

        scheduler.shutdown();
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(5)));

        advance(Duration::from_secs(10)).await;
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn arming_without_a_runtime_is_refused() {
        let (scheduler, notifier) = scheduler(true);
        assert!(!scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_secs(1)));
        assert_eq!(scheduler.pending_count(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plain_threads_arm_on_the_captured_runtime() {
        let (scheduler, notifier) = scheduler(true);
        let scheduler = Arc::new(scheduler);

        let armed = std::thread::spawn({
            let scheduler = Arc::clone(&scheduler);
            move || scheduler.arm_incomplete_reminder(&id(), CONTACT, Duration::from_millis(20))
        })
        .join()
        .expect("arming thread joins");
        assert!(armed);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            notifier.sent(),
            vec![(ReminderKind::Incomplete, "dana@example.com".to_string())]
        );
    }

    #[test]
    fn messages_match_kind() {
        assert_eq!(ReminderKind::Incomplete.label(), "incomplete");
        assert_eq!(ReminderKind::MissingSignature.label(), "missing_signature");
        assert!(ReminderKind::MissingSignature.message().contains("electronic signature"));
    }
}

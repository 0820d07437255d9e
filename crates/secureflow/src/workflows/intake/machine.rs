//! Stage progression for a [`Submission`]: COLLECTING → SIGNING → COMPLETED.
//!
//! The graph is linear with no back-edges. Every transition re-evaluates its
//! guard against the aggregate it is applied to; a failed guard leaves the
//! submission untouched.

use std::fmt;

use chrono::{DateTime, Utc};

use super::domain::{RequirementId, Submission, SubmissionStage};

/// Effect of a state machine operation on the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced {
        from: SubmissionStage,
        to: SubmissionStage,
    },
    SignatureRecorded,
    /// The operation had already taken effect earlier.
    Unchanged,
}

impl Transition {
    pub fn changed(self) -> bool {
        !matches!(self, Transition::Unchanged)
    }
}

/// Why a guard rejected a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardFailure {
    UnverifiedDocuments(Vec<RequirementId>),
    SignatureMissing,
    StageMismatch { current: SubmissionStage },
}

impl fmt::Display for GuardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardFailure::UnverifiedDocuments(pending) => {
                let names: Vec<&str> = pending.iter().map(RequirementId::as_str).collect();
                write!(f, "required documents not verified: {}", names.join(", "))
            }
            GuardFailure::SignatureMissing => write!(f, "signature has not been captured"),
            GuardFailure::StageMismatch { current } => {
                write!(f, "submission is in the {} stage", current.label())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot advance to {to}: {reason}")]
    GuardNotSatisfied {
        to: SubmissionStage,
        reason: GuardFailure,
    },
}

impl Submission {
    /// Required documents that still lack a verified upload, in catalog-key order.
    pub fn unverified_required(&self) -> Vec<RequirementId> {
        self.documents
            .values()
            .filter(|record| record.required && !record.verified)
            .map(|record| record.requirement_id.clone())
            .collect()
    }

    fn documents_guard(&self) -> Result<(), GuardFailure> {
        let pending = self.unverified_required();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(GuardFailure::UnverifiedDocuments(pending))
        }
    }

    fn completion_guard(&self) -> Result<(), GuardFailure> {
        if !self.signature.signed {
            return Err(GuardFailure::SignatureMissing);
        }
        self.documents_guard()
    }

    /// Whether the transition out of `from` would currently succeed.
    pub fn can_advance(&self, from: SubmissionStage) -> bool {
        if self.stage != from {
            return false;
        }
        match from {
            SubmissionStage::Collecting => self.documents_guard().is_ok(),
            SubmissionStage::Signing => self.completion_guard().is_ok(),
            SubmissionStage::Completed => false,
        }
    }

    /// Verified required documents over total required documents.
    pub fn progress_fraction(&self) -> f64 {
        let (verified, total) = self
            .documents
            .values()
            .filter(|record| record.required)
            .fold((0u32, 0u32), |(verified, total), record| {
                (verified + u32::from(record.verified), total + 1)
            });

        if total == 0 {
            1.0
        } else {
            f64::from(verified) / f64::from(total)
        }
    }

    /// COLLECTING → SIGNING. Idempotent once the stage has moved on.
    pub fn advance_to_signing(&mut self) -> Result<Transition, TransitionError> {
        if self.stage >= SubmissionStage::Signing {
            return Ok(Transition::Unchanged);
        }

        self.documents_guard()
            .map_err(|reason| TransitionError::GuardNotSatisfied {
                to: SubmissionStage::Signing,
                reason,
            })?;

        self.stage = SubmissionStage::Signing;
        Ok(Transition::Advanced {
            from: SubmissionStage::Collecting,
            to: SubmissionStage::Signing,
        })
    }

    /// Capture the signature once; later calls keep the original timestamp.
    pub fn record_signature(&mut self, now: DateTime<Utc>) -> Transition {
        if self.signature.signed {
            return Transition::Unchanged;
        }
        self.signature.signed = true;
        self.signature.signed_at = Some(now);
        Transition::SignatureRecorded
    }

    /// SIGNING → COMPLETED. Documents are re-checked alongside the signature.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match self.stage {
            SubmissionStage::Completed => return Ok(Transition::Unchanged),
            SubmissionStage::Collecting => {
                return Err(TransitionError::GuardNotSatisfied {
                    to: SubmissionStage::Completed,
                    reason: GuardFailure::StageMismatch {
                        current: self.stage,
                    },
                })
            }
            SubmissionStage::Signing => {}
        }

        self.completion_guard()
            .map_err(|reason| TransitionError::GuardNotSatisfied {
                to: SubmissionStage::Completed,
                reason,
            })?;

        self.stage = SubmissionStage::Completed;
        self.completed_at = Some(now);
        Ok(Transition::Advanced {
            from: SubmissionStage::Signing,
            to: SubmissionStage::Completed,
        })
    }
}

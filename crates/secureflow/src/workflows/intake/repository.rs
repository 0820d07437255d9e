use super::domain::{OwnerId, Submission, SubmissionId};

/// Durable record store keyed by submission id and by owner id.
///
/// `update` is a compare-and-swap: it succeeds only when the stored version
/// equals `submission.version()`, and returns the stored copy carrying the
/// bumped version. A mismatch is reported as [`RepositoryError::Conflict`].
pub trait SubmissionRepository: Send + Sync {
    fn insert(&self, submission: Submission) -> Result<Submission, RepositoryError>;
    fn update(&self, submission: Submission) -> Result<Submission, RepositoryError>;
    fn fetch(&self, id: &SubmissionId) -> Result<Option<Submission>, RepositoryError>;
    fn fetch_by_owner(&self, owner: &OwnerId) -> Result<Option<Submission>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists or was modified concurrently")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

const MAX_WRITE_ATTEMPTS: usize = 8;

/// Fetch, mutate, and compare-and-swap a submission, re-reading on conflicts.
///
/// When `apply` fails nothing is written and its error is returned unchanged.
pub fn read_modify_write<R, T, E, F>(
    repository: &R,
    id: &SubmissionId,
    mut apply: F,
) -> Result<(Submission, T), E>
where
    R: SubmissionRepository + ?Sized,
    E: From<RepositoryError>,
    F: FnMut(&mut Submission) -> Result<T, E>,
{
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let mut submission = repository.fetch(id)?.ok_or(RepositoryError::NotFound)?;
        let value = apply(&mut submission)?;
        match repository.update(submission) {
            Ok(stored) => return Ok((stored, value)),
            Err(RepositoryError::Conflict) => {
                tracing::debug!(submission_id = %id, "write conflict, re-reading submission");
                continue;
            }
            Err(other) => return Err(other.into()),
        }
    }
    Err(RepositoryError::Conflict.into())
}

use thiserror::Error;

use crate::types::JobType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to list jobs: {0}")]
    ListJobsFailed(#[source] kube::Error),
    #[error("Failed to list {0} objects: {1}")]
    ListObjectsFailed(JobType, #[source] kube::Error),
    #[error("Failed to get job: {0}")]
    GetJobFailed(#[source] kube::Error),
    #[error("Failed to create job: {0}")]
    CreateJobFailed(#[source] kube::Error),
    #[error("Failed to create object: {0}")]
    CreateObjectFailed(#[source] kube::Error),
    #[error("Failed to patch status: {0}")]
    PatchStatusFailed(#[source] kube::Error),
    #[error("Could not delete old {job_type} '{name}' ({deleted} deleted so far): {source}")]
    DeleteFailed {
        job_type: JobType,
        name: String,
        deleted: usize,
        #[source]
        source: kube::Error,
    },
    #[error("Failed to parse cron schedule '{schedule}': {source}")]
    ParseScheduleFailed {
        schedule: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("Unrecognized random schedule: '{0}'")]
    UnrecognizedRandomSchedule(String),
    #[error("Finalizer failed: {0}")]
    FinalizerFailed(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Whether the error reports a create call losing a race against another reconcile.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::CreateJobFailed(e) | Error::CreateObjectFailed(e) if is_already_exists(e)
        )
    }
}

pub(crate) fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

pub(crate) fn is_already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}

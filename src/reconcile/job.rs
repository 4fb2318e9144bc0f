use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use super::{patch_status, Data};
use crate::cleaner::{clean_history, ObjectDeleter, ObjectLister};
use crate::config::Config;
use crate::error::Error;
use crate::executor::JobExecutor;
use crate::types::{job_name, ConditionReason, ConditionStatus, ConditionType, JobObject, Status};

const STARTED_REQUEUE: Duration = Duration::from_secs(5);
const QUEUED_REQUEUE: Duration = Duration::from_secs(8);

/// Reconciles any job object: mirrors its batch job into the status, cleans up
/// the history once finished, and queues the job for execution otherwise.
pub async fn reconcile<K: JobObject>(obj: Arc<K>, ctx: Arc<Data>) -> Result<Action, Error> {
    let mut obj = (*obj).clone();
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let job_api = Api::<Job>::namespaced(ctx.client.clone(), &namespace);

    let batch_job_name = job_name(&obj);
    if let Some(batch_job) = job_api
        .get_opt(&batch_job_name)
        .await
        .map_err(Error::GetJobFailed)?
    {
        let before = obj.job_status();
        update_status_from_batch_job(&batch_job, obj.status_mut());
        if obj.status() != Some(&before) {
            tracing::debug!(job_type = %K::JOB_TYPE, name = %obj.name_any(), "updating status");
            patch_status(&ctx.client, &obj).await?;
        }
    }

    let status = obj.job_status();
    if status.has_finished() {
        if scrub(&ctx.client, &mut obj, &ctx.config).await {
            patch_status(&ctx.client, &obj).await?;
        }
        return Ok(Action::await_change());
    }
    if status.has_started() {
        return Ok(Action::requeue(STARTED_REQUEUE));
    }

    let repository = repository_of(&obj, &ctx.config);
    tracing::info!(job_type = %K::JOB_TYPE, name = %obj.name_any(), %namespace, %repository, "queueing job");
    ctx.queue.add(Arc::new(JobExecutor::new(
        ctx.client.clone(),
        ctx.config.clone(),
        obj,
        repository,
    )));
    Ok(Action::requeue(QUEUED_REQUEUE))
}

/// The repository of the object's backend, or the global one if it has none.
pub fn repository_of<K: JobObject>(obj: &K, config: &Config) -> String {
    obj.runnable_spec()
        .backend
        .as_ref()
        .map(|backend| backend.repository(config))
        .filter(|repository| !repository.is_empty())
        .unwrap_or_else(|| config.global_repository())
}

/// Copies the outcome of the batch job into the status.
pub fn update_status_from_batch_job(batch_job: &Job, status: &mut Status) {
    let name = batch_job.name_any();
    let counts = batch_job.status.clone().unwrap_or_default();
    let message = format!(
        "job '{}' has {} active, {} succeeded and {} failed pods",
        name,
        counts.active.unwrap_or(0),
        counts.succeeded.unwrap_or(0),
        counts.failed.unwrap_or(0)
    );

    match get_job_finished_type(batch_job).as_deref() {
        Some("Complete") => {
            if !status.has_succeeded() {
                tracing::info!(%name, "job succeeded");
            }
            status.set_succeeded(message);
            status.set_finished(format!("job '{}' completed successfully", name));
        }
        Some("Failed") => {
            if !status.has_failed() {
                tracing::info!(%name, "job failed");
            }
            status.set_failed(message);
            status.set_finished(format!("job '{}' has failed", name));
        }
        _ => {
            if !status.has_finished() {
                status.set_started(message);
            }
        }
    }
}

fn get_job_finished_type(job: &Job) -> Option<String> {
    for condition in job
        .status
        .clone()
        .unwrap_or_default()
        .conditions
        .unwrap_or_default()
    {
        if (condition.type_ == "Complete" || condition.type_ == "Failed")
            && condition.status == "True"
        {
            return Some(condition.type_);
        }
    }
    None
}

/// Runs the history cleaner over all objects of this kind in the namespace and
/// records the outcome in the `Scrubbed` condition. Returns whether the status
/// changed.
pub(crate) async fn scrub<K, C>(client: &C, obj: &mut K, config: &Config) -> bool
where
    K: JobObject,
    C: ObjectLister + ObjectDeleter,
{
    let (reason, status, message) = match clean_history(client, &*obj, config).await {
        Ok(deleted) => (
            ConditionReason::Succeeded,
            ConditionStatus::True,
            format!("Deleted {} resources", deleted),
        ),
        Err(error @ Error::ListObjectsFailed(..)) => {
            tracing::error!(%error, job_type = %K::JOB_TYPE, "could not list objects to cleanup old resources");
            (
                ConditionReason::RetrievalFailed,
                ConditionStatus::False,
                format!("could not list objects to cleanup old resources: {}", error),
            )
        }
        Err(error) => (
            ConditionReason::DeletionFailed,
            ConditionStatus::False,
            format!("could not cleanup old resources: {}", error),
        ),
    };

    let before = obj.job_status();
    obj.status_mut()
        .set_condition(ConditionType::Scrubbed, reason, status, message);
    obj.status() != Some(&before)
}

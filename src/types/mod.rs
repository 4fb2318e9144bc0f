mod backend;
mod jobs;
mod schedule;
mod status;

use std::fmt;

use k8s_openapi::api::core::v1::{EnvVar, PodSecurityContext, ResourceRequirements};
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use backend::{
    AzureSpec, B2Spec, Backend, GcsSpec, LocalSpec, RestServerSpec, S3Spec, SwiftSpec,
};
pub use jobs::{
    Archive, ArchiveSpec, Backup, BackupSpec, Check, CheckSpec, Prune, PruneRetention, PruneSpec,
    Restore, RestoreSpec,
};
pub use schedule::{
    ArchiveSchedule, BackupSchedule, CheckSchedule, EffectiveSchedule, PruneSchedule,
    RestoreSchedule, Schedule, ScheduleCommon, ScheduleDefinition, ScheduleSpec, ScheduleStatus,
};
pub use status::{
    find_status_condition, remove_status_condition, set_status_condition, ConditionReason,
    ConditionStatus, ConditionType, Status,
};

/// Marks batch jobs managed by this operator.
pub const LABEL_MANAGED: &str = "backup.example.com/managed";
/// Set to "true" on batch jobs that must run alone on their repository.
pub const LABEL_EXCLUSIVE: &str = "backup.example.com/exclusive";
pub const LABEL_TYPE: &str = "backup.example.com/type";
pub const LABEL_OWNED_BY: &str = "backup.example.com/owned-by";
pub const LABEL_REPOSITORY_HASH: &str = "backup.example.com/repository-hash";

pub const SCHEDULE_FINALIZER: &str = "backup.example.com/schedule";

/// The kinds of work this operator schedules.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Backup,
    Check,
    Archive,
    Restore,
    Prune,
    Schedule,
}

impl JobType {
    /// Job types a schedule can declare, in registration order.
    pub const SCHEDULABLE: [JobType; 5] = [
        JobType::Backup,
        JobType::Check,
        JobType::Prune,
        JobType::Archive,
        JobType::Restore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Backup => "backup",
            JobType::Check => "check",
            JobType::Archive => "archive",
            JobType::Restore => "restore",
            JobType::Prune => "prune",
            JobType::Schedule => "schedule",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields every runnable job object carries.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSpec {
    /// Where the repository lives. Falls back to the operator's global repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,

    /// Compute resources of the spawned workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Security context the spawned workload runs with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    /// Deadline in seconds for the spawned workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

/// How many finished objects to keep.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLimits {
    /// Amount of jobs to keep for later analysis.
    ///
    /// Deprecated: use failedJobsHistoryLimit and successfulJobsHistoryLimit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_jobs: Option<i32>,

    /// Amount of failed jobs to keep. keepJobs is used if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,

    /// Amount of successful jobs to keep. keepJobs is used if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,
}

impl HistoryLimits {
    pub fn is_unset(&self) -> bool {
        self.keep_jobs.is_none()
            && self.failed_jobs_history_limit.is_none()
            && self.successful_jobs_history_limit.is_none()
    }
}

/// Provides the retention limits the history cleaner applies.
pub trait JobsHistoryLimiter {
    fn successful_jobs_history_limit(&self) -> Option<i32>;
    fn failed_jobs_history_limit(&self) -> Option<i32>;
}

impl JobsHistoryLimiter for HistoryLimits {
    fn successful_jobs_history_limit(&self) -> Option<i32> {
        self.successful_jobs_history_limit.or(self.keep_jobs)
    }

    fn failed_jobs_history_limit(&self) -> Option<i32> {
        self.failed_jobs_history_limit.or(self.keep_jobs)
    }
}

/// Implemented by every custom resource that results in a spawned workload.
pub trait JobObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const JOB_TYPE: JobType;

    /// Whether the job must not run together with any other job on its repository.
    const EXCLUSIVE: bool = false;

    fn status(&self) -> Option<&Status>;

    fn status_mut(&mut self) -> &mut Status;

    fn runnable_spec(&self) -> &RunnableSpec;

    fn runnable_spec_mut(&mut self) -> &mut RunnableSpec;

    fn history_limits(&self) -> &HistoryLimits;

    fn history_limits_mut(&mut self) -> &mut HistoryLimits;

    /// Arguments passed to the workload container.
    fn container_args(&self) -> Vec<String>;

    /// Environment specific to this kind of job.
    fn container_env(&self) -> Vec<EnvVar> {
        Vec::new()
    }

    fn job_status(&self) -> Status {
        self.status().cloned().unwrap_or_default()
    }
}

/// Name of the batch job spawned for the given job object.
pub fn job_name<K: JobObject>(obj: &K) -> String {
    format!("{}-{}", K::JOB_TYPE, obj.meta().name.as_deref().unwrap_or_default())
}

/// Hex SHA-256 of the value, shortened to 63 characters to fit into a label.
/// Empty input gives an empty string.
pub fn sha256_hash(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let mut digest = format!("{:x}", Sha256::digest(value.as_bytes()));
    digest.truncate(63);
    digest
}

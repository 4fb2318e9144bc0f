use std::fmt;

use k8s_openapi::api::core::v1::{PodSecurityContext, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    ArchiveSpec, Backend, BackupSpec, CheckSpec, HistoryLimits, JobType, PruneSpec, RestoreSpec,
};

/// A cron expression, a `@`-macro, or one of the `@<period>-random` macros.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ScheduleDefinition(pub String);

impl ScheduleDefinition {
    /// True for any `@`-macro, random or not.
    pub fn is_non_standard(&self) -> bool {
        self.0.starts_with('@')
    }

    /// True for the `@<period>-random` macros.
    pub fn is_random(&self) -> bool {
        self.is_non_standard() && self.0.ends_with("-random")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ScheduleDefinition {
    fn from(value: &str) -> Self {
        ScheduleDefinition(value.to_string())
    }
}

impl From<String> for ScheduleDefinition {
    fn from(value: String) -> Self {
        ScheduleDefinition(value)
    }
}

impl fmt::Display for ScheduleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields every section of a Schedule shares.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleCommon {
    pub schedule: ScheduleDefinition,
    #[serde(default)]
    pub concurrent_runs_allowed: bool,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct BackupSchedule {
    #[serde(flatten)]
    pub spec: BackupSpec,
    #[serde(flatten)]
    pub common: ScheduleCommon,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct CheckSchedule {
    #[serde(flatten)]
    pub spec: CheckSpec,
    #[serde(flatten)]
    pub common: ScheduleCommon,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct PruneSchedule {
    #[serde(flatten)]
    pub spec: PruneSpec,
    #[serde(flatten)]
    pub common: ScheduleCommon,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct ArchiveSchedule {
    #[serde(flatten)]
    pub spec: ArchiveSpec,
    #[serde(flatten)]
    pub common: ScheduleCommon,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct RestoreSchedule {
    #[serde(flatten)]
    pub spec: RestoreSpec,
    #[serde(flatten)]
    pub common: ScheduleCommon,
}

/// ScheduleSpec declares recurring jobs. Schedule-level settings are applied to
/// every generated object that does not set them itself.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Schedule",
    namespaced,
    status = "ScheduleStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<PruneSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSchedule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,

    #[serde(flatten)]
    pub history_limits: HistoryLimits,

    /// Default resources for the workloads of every generated job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_requirements_template: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,
}

impl ScheduleSpec {
    /// The schedule section declared for the given job type, if any.
    pub fn common(&self, job_type: JobType) -> Option<&ScheduleCommon> {
        match job_type {
            JobType::Backup => self.backup.as_ref().map(|s| &s.common),
            JobType::Check => self.check.as_ref().map(|s| &s.common),
            JobType::Prune => self.prune.as_ref().map(|s| &s.common),
            JobType::Archive => self.archive.as_ref().map(|s| &s.common),
            JobType::Restore => self.restore.as_ref().map(|s| &s.common),
            JobType::Schedule => None,
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The concrete schedules resolved from random macros.
    #[serde(default)]
    pub effective_schedules: Vec<EffectiveSchedule>,
}

/// The cron expression actually registered for a randomized schedule.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveSchedule {
    pub job_type: JobType,
    pub generated_schedule: ScheduleDefinition,
    #[serde(default, skip_serializing_if = "ScheduleDefinition::is_empty")]
    pub original_schedule: ScheduleDefinition,
}

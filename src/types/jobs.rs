use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{HistoryLimits, JobObject, JobType, RunnableSpec, Status};

/// BackupSpec defines a single backup of the namespace's volumes into the repository.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Backup",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Completion","type":"string","jsonPath":".status.conditions[?(@.type == \"Completed\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(flatten)]
    pub runnable: RunnableSpec,

    #[serde(flatten)]
    pub history_limits: HistoryLimits,

    /// Prometheus push URL the workload sends metrics to.
    #[serde(default, rename = "promURL", skip_serializing_if = "Option::is_none")]
    pub prom_url: Option<String>,

    /// Tags attached to the created snapshots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// CheckSpec verifies the integrity of the repository.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Check",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Completion","type":"string","jsonPath":".status.conditions[?(@.type == \"Completed\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheckSpec {
    #[serde(flatten)]
    pub runnable: RunnableSpec,

    #[serde(flatten)]
    pub history_limits: HistoryLimits,

    #[serde(default, rename = "promURL", skip_serializing_if = "Option::is_none")]
    pub prom_url: Option<String>,
}

/// PruneSpec removes snapshots from the repository according to a retention policy.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Prune",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Completion","type":"string","jsonPath":".status.conditions[?(@.type == \"Completed\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PruneSpec {
    #[serde(flatten)]
    pub runnable: RunnableSpec,

    #[serde(flatten)]
    pub history_limits: HistoryLimits,

    #[serde(default)]
    pub retention: PruneRetention,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PruneRetention {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_hourly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_tags: Vec<String>,
    /// Only snapshots with these tags are considered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// ArchiveSpec copies the latest snapshots of the repository to another location.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Archive",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Completion","type":"string","jsonPath":".status.conditions[?(@.type == \"Completed\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSpec {
    #[serde(flatten)]
    pub runnable: RunnableSpec,

    #[serde(flatten)]
    pub history_limits: HistoryLimits,

    /// Only archive this snapshot instead of the latest ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// RestoreSpec restores a snapshot of the repository.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "backup.example.com",
    version = "v1",
    kind = "Restore",
    namespaced,
    status = "Status",
    printcolumn = r#"{"name":"Completion","type":"string","jsonPath":".status.conditions[?(@.type == \"Completed\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    #[serde(flatten)]
    pub runnable: RunnableSpec,

    #[serde(flatten)]
    pub history_limits: HistoryLimits,

    /// Snapshot to restore, the latest one if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

macro_rules! impl_job_object_accessors {
    () => {
        fn status(&self) -> Option<&Status> {
            self.status.as_ref()
        }

        fn status_mut(&mut self) -> &mut Status {
            self.status.get_or_insert_with(Status::default)
        }

        fn runnable_spec(&self) -> &RunnableSpec {
            &self.spec.runnable
        }

        fn runnable_spec_mut(&mut self) -> &mut RunnableSpec {
            &mut self.spec.runnable
        }

        fn history_limits(&self) -> &HistoryLimits {
            &self.spec.history_limits
        }

        fn history_limits_mut(&mut self) -> &mut HistoryLimits {
            &mut self.spec.history_limits
        }
    };
}

fn tag_args(tags: &[String]) -> Vec<String> {
    tags.iter()
        .flat_map(|tag| ["--tag".to_string(), tag.clone()])
        .collect()
}

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

impl JobObject for Backup {
    const JOB_TYPE: JobType = JobType::Backup;

    impl_job_object_accessors!();

    fn container_args(&self) -> Vec<String> {
        let mut args = vec!["-backup".to_string()];
        args.extend(tag_args(&self.spec.tags));
        args
    }

    fn container_env(&self) -> Vec<EnvVar> {
        self.spec
            .prom_url
            .iter()
            .map(|url| env("PROM_URL", url))
            .collect()
    }
}

impl JobObject for Check {
    const JOB_TYPE: JobType = JobType::Check;
    const EXCLUSIVE: bool = true;

    impl_job_object_accessors!();

    fn container_args(&self) -> Vec<String> {
        vec!["-check".to_string()]
    }

    fn container_env(&self) -> Vec<EnvVar> {
        self.spec
            .prom_url
            .iter()
            .map(|url| env("PROM_URL", url))
            .collect()
    }
}

impl JobObject for Prune {
    const JOB_TYPE: JobType = JobType::Prune;
    const EXCLUSIVE: bool = true;

    impl_job_object_accessors!();

    fn container_args(&self) -> Vec<String> {
        let mut args = vec!["-prune".to_string()];
        args.extend(tag_args(&self.spec.retention.tags));
        args
    }

    fn container_env(&self) -> Vec<EnvVar> {
        let retention = &self.spec.retention;
        let mut vars: Vec<EnvVar> = [
            ("KEEP_LAST", retention.keep_last),
            ("KEEP_HOURLY", retention.keep_hourly),
            ("KEEP_DAILY", retention.keep_daily.or(Some(14))),
            ("KEEP_WEEKLY", retention.keep_weekly),
            ("KEEP_MONTHLY", retention.keep_monthly),
            ("KEEP_YEARLY", retention.keep_yearly),
        ]
        .into_iter()
        .filter_map(|(name, keep)| keep.filter(|keep| *keep > 0).map(|keep| env(name, keep)))
        .collect();
        if !retention.keep_tags.is_empty() {
            vars.push(env("KEEP_TAGS", retention.keep_tags.join(",")));
        }
        vars
    }
}

impl JobObject for Archive {
    const JOB_TYPE: JobType = JobType::Archive;

    impl_job_object_accessors!();

    fn container_args(&self) -> Vec<String> {
        let mut args = vec!["-archive".to_string(), "-restoreType".to_string(), "s3".to_string()];
        if let Some(snapshot) = &self.spec.snapshot {
            args.push("-restoreSnap".to_string());
            args.push(snapshot.clone());
        }
        args.extend(tag_args(&self.spec.tags));
        args
    }
}

impl JobObject for Restore {
    const JOB_TYPE: JobType = JobType::Restore;

    impl_job_object_accessors!();

    fn container_args(&self) -> Vec<String> {
        let mut args = vec!["-restore".to_string()];
        if let Some(snapshot) = &self.spec.snapshot {
            args.push("-restoreSnap".to_string());
            args.push(snapshot.clone());
        }
        args.extend(tag_args(&self.spec.tags));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job_name;

    #[test]
    fn exclusive_kinds() {
        assert!(Check::EXCLUSIVE);
        assert!(Prune::EXCLUSIVE);
        assert!(!Backup::EXCLUSIVE);
        assert!(!Archive::EXCLUSIVE);
        assert!(!Restore::EXCLUSIVE);
    }

    #[test]
    fn batch_job_name_is_type_prefixed() {
        let prune = Prune::new("nightly", PruneSpec::default());
        assert_eq!(job_name(&prune), "prune-nightly");
    }

    #[test]
    fn prune_retention_env() {
        let prune = Prune::new(
            "nightly",
            PruneSpec {
                retention: PruneRetention {
                    keep_last: Some(5),
                    keep_weekly: Some(0),
                    keep_tags: vec!["a".to_string(), "b".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let vars: Vec<(String, Option<String>)> = prune
            .container_env()
            .into_iter()
            .map(|var| (var.name, var.value))
            .collect();
        assert_eq!(
            vars,
            vec![
                ("KEEP_LAST".to_string(), Some("5".to_string())),
                ("KEEP_DAILY".to_string(), Some("14".to_string())),
                ("KEEP_TAGS".to_string(), Some("a,b".to_string())),
            ]
        );
    }

    #[test]
    fn snapshot_args() {
        let archive = Archive::new(
            "a",
            ArchiveSpec {
                snapshot: Some("abc123".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            archive.container_args(),
            vec!["-archive", "-restoreType", "s3", "-restoreSnap", "abc123"]
        );

        let restore = Restore::new(
            "r",
            RestoreSpec {
                tags: vec!["daily".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(restore.container_args(), vec!["-restore", "--tag", "daily"]);
    }

    #[test]
    fn spec_fields_are_flattened() {
        let backup: Backup = serde_json::from_value(serde_json::json!({
            "apiVersion": "backup.example.com/v1",
            "kind": "Backup",
            "metadata": {"name": "b", "namespace": "ns"},
            "spec": {
                "keepJobs": 4,
                "activeDeadlineSeconds": 600,
                "backend": {"s3": {"bucket": "bucket"}},
                "tags": ["daily"]
            }
        }))
        .unwrap();
        assert_eq!(backup.spec.history_limits.keep_jobs, Some(4));
        assert_eq!(backup.spec.runnable.active_deadline_seconds, Some(600));
        assert_eq!(
            backup.container_args(),
            vec!["-backup".to_string(), "--tag".to_string(), "daily".to_string()]
        );
        assert!(backup.status().is_none());
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{object_to_owner_reference, Data};
use crate::effective_schedule::{cleanup_effective_schedules, effective_schedule};
use crate::error::{is_not_found, Error};
use crate::scheduler::{JobCreator, OwnerKey, ScheduledJob};
use crate::types::{
    set_status_condition, Archive, Backup, Check, ConditionReason, ConditionStatus,
    ConditionType, JobObject, JobType, Prune, Restore, Schedule, ScheduleSpec, ScheduleStatus,
    SCHEDULE_FINALIZER,
};

pub async fn reconcile(schedule: Arc<Schedule>, ctx: Arc<Data>) -> Result<Action, Error> {
    let namespace = schedule
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<Schedule>::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, SCHEDULE_FINALIZER, schedule, |event| async move {
        match event {
            Event::Apply(schedule) => apply(schedule, &ctx).await,
            Event::Cleanup(schedule) => {
                let owner = OwnerKey::of(&*schedule);
                ctx.scheduler.remove_schedules(&owner);
                tracing::info!(%owner, "removed schedules");
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| Error::FinalizerFailed(Box::new(e)))
}

/// Registers the cron entries of the schedule and persists its effective schedules.
async fn apply(schedule: Arc<Schedule>, ctx: &Data) -> Result<Action, Error> {
    let owner = OwnerKey::of(&*schedule);
    let owner_reference = OwnerReference {
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..object_to_owner_reference::<Schedule>(schedule.metadata.clone())?
    };

    let before = schedule.status.clone().unwrap_or_default();
    let mut status = before.clone();

    let mut jobs = Vec::new();
    for job_type in JobType::SCHEDULABLE {
        let original = schedule
            .spec
            .common(job_type)
            .map(|common| common.schedule.clone())
            .unwrap_or_default();
        cleanup_effective_schedules(&mut status.effective_schedules, job_type, &original);
        if original.is_empty() {
            continue;
        }
        let Some(creator) = job_creator(&schedule.spec, job_type, &ctx.client, &owner_reference)
        else {
            continue;
        };
        let effective = effective_schedule(
            &owner.namespace,
            &owner.name,
            job_type,
            &original,
            &mut status.effective_schedules,
        );
        jobs.push(ScheduledJob {
            job_type,
            schedule: effective,
            creator,
        });
    }

    match ctx.scheduler.sync_schedules(&owner, jobs) {
        Ok(()) => set_status_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            ConditionReason::Ready,
            "all schedules are registered",
        ),
        Err(error) => {
            tracing::warn!(%owner, %error, "could not register schedules");
            set_status_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::False,
                ConditionReason::Failed,
                format!("could not register schedules: {}", error),
            );
        }
    }

    if status != before {
        patch_schedule_status(ctx, &owner, &status).await?;
    }
    Ok(Action::await_change())
}

async fn patch_schedule_status(
    ctx: &Data,
    owner: &OwnerKey,
    status: &ScheduleStatus,
) -> Result<(), Error> {
    let api = Api::<Schedule>::namespaced(ctx.client.clone(), &owner.namespace);
    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(&owner.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::PatchStatusFailed(e)),
    }
}

/// The creator of the objects declared by the section of the given job type.
fn job_creator(
    spec: &ScheduleSpec,
    job_type: JobType,
    client: &kube::Client,
    owner: &OwnerReference,
) -> Option<Arc<dyn JobCreator>> {
    fn creator<K: JobObject>(
        prototype: K,
        spec: &ScheduleSpec,
        client: &kube::Client,
        owner: &OwnerReference,
    ) -> Arc<dyn JobCreator> {
        Arc::new(ObjectCreator {
            client: client.clone(),
            prototype: merge_defaults(prototype, spec),
            owner: owner.clone(),
        })
    }

    match job_type {
        JobType::Backup => spec
            .backup
            .as_ref()
            .map(|s| creator(Backup::new("", s.spec.clone()), spec, client, owner)),
        JobType::Check => spec
            .check
            .as_ref()
            .map(|s| creator(Check::new("", s.spec.clone()), spec, client, owner)),
        JobType::Prune => spec
            .prune
            .as_ref()
            .map(|s| creator(Prune::new("", s.spec.clone()), spec, client, owner)),
        JobType::Archive => spec
            .archive
            .as_ref()
            .map(|s| creator(Archive::new("", s.spec.clone()), spec, client, owner)),
        JobType::Restore => spec
            .restore
            .as_ref()
            .map(|s| creator(Restore::new("", s.spec.clone()), spec, client, owner)),
        JobType::Schedule => None,
    }
}

/// Fills in the schedule-level settings the object does not set itself. Backend,
/// resources and security context are merged field by field.
pub fn merge_defaults<K: JobObject>(mut obj: K, spec: &ScheduleSpec) -> K {
    let runnable = obj.runnable_spec_mut();
    runnable.backend = merge_unset(runnable.backend.take(), spec.backend.as_ref(), "backend");
    runnable.resources = merge_unset(
        runnable.resources.take(),
        spec.resource_requirements_template.as_ref(),
        "resources",
    );
    runnable.pod_security_context = merge_unset(
        runnable.pod_security_context.take(),
        spec.pod_security_context.as_ref(),
        "pod security context",
    );
    if obj.history_limits().is_unset() {
        *obj.history_limits_mut() = spec.history_limits.clone();
    }
    obj
}

fn merge_unset<T>(value: Option<T>, defaults: Option<&T>, what: &str) -> Option<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    match (value, defaults) {
        (None, defaults) => defaults.cloned(),
        (Some(value), None) => Some(value),
        (Some(value), Some(defaults)) => match fill_unset(&value, defaults) {
            Ok(merged) => Some(merged),
            Err(error) => {
                tracing::info!(%error, "could not merge the {} with the schedule's defaults", what);
                Some(value)
            }
        },
    }
}

/// Copies every field of `defaults` that is missing, null or empty in `value`,
/// descending into nested objects.
fn fill_unset<T: Serialize + DeserializeOwned>(value: &T, defaults: &T) -> serde_json::Result<T> {
    let mut merged = serde_json::to_value(value)?;
    fill_unset_fields(&mut merged, serde_json::to_value(defaults)?);
    serde_json::from_value(merged)
}

fn fill_unset_fields(value: &mut Value, defaults: Value) {
    if let (Value::Object(fields), Value::Object(defaults)) = (value, defaults) {
        for (key, default) in defaults {
            if fields.get(&key).map_or(true, is_unset) {
                fields.insert(key, default);
            } else if let Some(field) = fields.get_mut(&key) {
                fill_unset_fields(field, default);
            }
        }
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Creates copies of a prototype object owned by the schedule.
struct ObjectCreator<K> {
    client: kube::Client,
    prototype: K,
    owner: OwnerReference,
}

impl<K: JobObject> ObjectCreator<K> {
    fn instantiate(&self, name: &str, namespace: &str) -> K {
        let mut obj = self.prototype.clone();
        let meta = obj.meta_mut();
        meta.name = Some(name.to_string());
        meta.namespace = Some(namespace.to_string());
        meta.owner_references = Some(vec![self.owner.clone()]);
        obj
    }
}

#[async_trait]
impl<K: JobObject> JobCreator for ObjectCreator<K> {
    async fn create(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let obj = self.instantiate(name, namespace);
        Api::<K>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(Error::CreateObjectFailed)?;
        tracing::info!(job_type = %K::JOB_TYPE, %namespace, %name, "created object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{PodSecurityContext, ResourceRequirements, SecretKeySelector};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::config::Config;
    use crate::reconcile::job::repository_of;
    use crate::types::{Backend, BackupSpec, GcsSpec, HistoryLimits, RunnableSpec, S3Spec};

    fn schedule_spec() -> ScheduleSpec {
        ScheduleSpec {
            backend: Some(Backend {
                s3: Some(S3Spec {
                    endpoint: "https://s3.example.com".to_string(),
                    bucket: "schedule".to_string(),
                }),
                ..Backend::default()
            }),
            history_limits: HistoryLimits {
                keep_jobs: Some(4),
                ..HistoryLimits::default()
            },
            resource_requirements_template: Some(ResourceRequirements::default()),
            pod_security_context: Some(PodSecurityContext {
                run_as_user: Some(1000),
                ..PodSecurityContext::default()
            }),
            ..ScheduleSpec::default()
        }
    }

    #[test]
    fn schedule_settings_fill_unset_fields() {
        let backup = merge_defaults(Backup::new("", BackupSpec::default()), &schedule_spec());

        let runnable = backup.runnable_spec();
        assert_eq!(runnable.backend, schedule_spec().backend);
        assert_eq!(runnable.resources, Some(ResourceRequirements::default()));
        assert_eq!(
            runnable.pod_security_context.as_ref().and_then(|c| c.run_as_user),
            Some(1000)
        );
        assert_eq!(backup.history_limits().keep_jobs, Some(4));
    }

    #[test]
    fn object_settings_win() {
        let own_backend = Backend {
            gcs: Some(GcsSpec {
                bucket: "own".to_string(),
            }),
            ..Backend::default()
        };
        let spec = BackupSpec {
            runnable: RunnableSpec {
                backend: Some(own_backend.clone()),
                ..RunnableSpec::default()
            },
            history_limits: HistoryLimits {
                successful_jobs_history_limit: Some(1),
                ..HistoryLimits::default()
            },
            ..BackupSpec::default()
        };

        let backup = merge_defaults(Backup::new("", spec), &schedule_spec());

        let backend = backup.runnable_spec().backend.clone().unwrap();
        assert_eq!(backend.gcs, own_backend.gcs);
        assert_eq!(backend.repository(&Config::default()), "gs:own:/");
        assert_eq!(backup.history_limits().keep_jobs, None);
        assert_eq!(backup.history_limits().successful_jobs_history_limit, Some(1));
    }

    #[test]
    fn partial_backend_keeps_schedule_storage() {
        let password = SecretKeySelector {
            name: Some("repo".to_string()),
            key: "password".to_string(),
            optional: None,
        };
        let spec = BackupSpec {
            runnable: RunnableSpec {
                backend: Some(Backend {
                    repo_password_secret_ref: Some(password.clone()),
                    ..Backend::default()
                }),
                ..RunnableSpec::default()
            },
            ..BackupSpec::default()
        };
        let mut schedule = schedule_spec();
        schedule.backend = Some(Backend {
            s3: Some(S3Spec {
                endpoint: "https://s3.example.com".to_string(),
                bucket: "team".to_string(),
            }),
            ..Backend::default()
        });

        let backup = merge_defaults(Backup::new("", spec), &schedule);

        assert_eq!(
            repository_of(&backup, &Config::default()),
            "s3:https://s3.example.com/team"
        );
        let backend = backup.runnable_spec().backend.as_ref().unwrap();
        assert_eq!(backend.repo_password_secret_ref, Some(password));
    }

    #[test]
    fn nested_fields_are_merged_one_by_one() {
        let spec = BackupSpec {
            runnable: RunnableSpec {
                backend: Some(Backend {
                    s3: Some(S3Spec {
                        endpoint: String::new(),
                        bucket: "own".to_string(),
                    }),
                    ..Backend::default()
                }),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        "memory".to_string(),
                        Quantity("1Gi".to_string()),
                    )])),
                    ..ResourceRequirements::default()
                }),
                pod_security_context: Some(PodSecurityContext {
                    run_as_user: Some(2000),
                    ..PodSecurityContext::default()
                }),
                ..RunnableSpec::default()
            },
            ..BackupSpec::default()
        };
        let mut schedule = schedule_spec();
        schedule.resource_requirements_template = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("memory".to_string(), Quantity("256Mi".to_string())),
                ("cpu".to_string(), Quantity("500m".to_string())),
            ])),
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("100m".to_string()),
            )])),
            ..ResourceRequirements::default()
        });
        schedule.pod_security_context = Some(PodSecurityContext {
            run_as_user: Some(1000),
            fs_group: Some(3000),
            ..PodSecurityContext::default()
        });

        let backup = merge_defaults(Backup::new("", spec), &schedule);
        let runnable = backup.runnable_spec();

        let s3 = runnable.backend.as_ref().and_then(|b| b.s3.clone()).unwrap();
        assert_eq!(s3.endpoint, "https://s3.example.com");
        assert_eq!(s3.bucket, "own");

        let resources = runnable.resources.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("1Gi".to_string()));
        assert_eq!(limits["cpu"], Quantity("500m".to_string()));
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("100m".to_string())
        );

        let context = runnable.pod_security_context.as_ref().unwrap();
        assert_eq!(context.run_as_user, Some(2000));
        assert_eq!(context.fs_group, Some(3000));
    }
}

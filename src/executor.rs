use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::Resource;

use crate::config::Config;
use crate::error::Error;
use crate::queue::Executor;
use crate::reconcile::{object_to_owner_reference, patch_status};
use crate::types::{
    job_name, sha256_hash, ConditionReason, ConditionStatus, ConditionType, JobObject,
    LABEL_EXCLUSIVE, LABEL_MANAGED, LABEL_OWNED_BY, LABEL_REPOSITORY_HASH, LABEL_TYPE,
};

/// Creates the batch job of a job object once the worker admits it.
pub struct JobExecutor<K> {
    client: kube::Client,
    config: Arc<Config>,
    obj: K,
    repository: String,
}

impl<K: JobObject> JobExecutor<K> {
    pub fn new(client: kube::Client, config: Arc<Config>, obj: K, repository: String) -> Self {
        JobExecutor {
            client,
            config,
            obj,
            repository,
        }
    }
}

#[async_trait]
impl<K: JobObject> Executor for JobExecutor<K> {
    async fn execute(&self) -> Result<(), Error> {
        let mut obj = self.obj.clone();
        let batch_job = build_batch_job(&obj, &self.repository, &self.config)?;
        let api = Api::<Job>::namespaced(self.client.clone(), self.namespace());

        if let Err(e) = api.create(&PostParams::default(), &batch_job).await {
            let error = Error::CreateJobFailed(e);
            if !error.is_already_exists() {
                obj.status_mut().set_condition(
                    ConditionType::Ready,
                    ConditionReason::CreationFailed,
                    ConditionStatus::False,
                    format!("could not create job: {}", error),
                );
                if let Err(patch_error) = patch_status(&self.client, &obj).await {
                    tracing::error!(error = %patch_error, "could not record creation failure");
                }
            }
            return Err(error);
        }

        let name = job_name(&obj);
        tracing::info!(job_type = %K::JOB_TYPE, namespace = self.namespace(), %name, "created job");
        let status = obj.status_mut();
        status.set_started(format!("the job '{}' was created", name));
        status.exclusive = K::EXCLUSIVE;
        patch_status(&self.client, &obj).await
    }

    fn exclusive(&self) -> bool {
        K::EXCLUSIVE
    }

    fn concurrency_limit(&self) -> usize {
        self.config.concurrency_limit(K::JOB_TYPE)
    }

    fn repository(&self) -> &str {
        &self.repository
    }

    fn job_type(&self) -> crate::types::JobType {
        K::JOB_TYPE
    }

    fn namespace(&self) -> &str {
        self.obj.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.obj.meta().name.as_deref().unwrap_or_default()
    }
}

/// The batch job running the workload of `obj` against `repository`.
pub fn build_batch_job<K: JobObject>(obj: &K, repository: &str, config: &Config) -> Result<Job, Error> {
    let meta = obj.meta();
    let name = meta
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let owner = OwnerReference {
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..object_to_owner_reference::<K>(meta.clone())?
    };

    let mut labels = BTreeMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_TYPE.to_string(), K::JOB_TYPE.to_string()),
        (LABEL_OWNED_BY.to_string(), format!("{}_{}", K::JOB_TYPE, name)),
        (LABEL_REPOSITORY_HASH.to_string(), sha256_hash(repository)),
    ]);
    if K::EXCLUSIVE {
        labels.insert(LABEL_EXCLUSIVE.to_string(), "true".to_string());
    }

    let runnable = obj.runnable_spec();
    let mut env = vec![EnvVar {
        name: "RESTIC_REPOSITORY".to_string(),
        value: Some(repository.to_string()),
        value_from: None,
    }];
    if let Some(secret) = runnable
        .backend
        .as_ref()
        .and_then(|backend| backend.repo_password_secret_ref.clone())
    {
        env.push(EnvVar {
            name: "RESTIC_PASSWORD".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(secret),
                ..EnvVarSource::default()
            }),
        });
    }
    env.extend(obj.container_env());

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(obj)),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            active_deadline_seconds: runnable.active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([(
                        LABEL_MANAGED.to_string(),
                        "true".to_string(),
                    )])),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".to_string()),
                    security_context: runnable.pod_security_context.clone(),
                    containers: vec![Container {
                        name: K::JOB_TYPE.to_string(),
                        image: Some(config.backup_image.clone()),
                        command: Some(config.backup_command.clone()),
                        args: Some(obj.container_args()),
                        env: Some(env),
                        resources: runnable.resources.clone(),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    })
}

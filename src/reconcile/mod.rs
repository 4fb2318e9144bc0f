pub mod job;
pub mod schedule;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};

use crate::config::Config;
use crate::error::{is_not_found, Error};
use crate::queue::ExecutionQueue;
use crate::scheduler::Scheduler;
use crate::types::JobObject;

/// Shared by every reconciler.
pub struct Data {
    pub client: kube::Client,
    pub config: Arc<Config>,
    pub queue: Arc<ExecutionQueue>,
    pub scheduler: Arc<Scheduler>,
}

pub fn error_policy<K>(_obj: Arc<K>, error: &Error, _ctx: Arc<Data>) -> Action {
    tracing::error!(%error);
    Action::requeue(Duration::from_secs(3))
}

/// Merge-patches the status of the object. A deleted object is not an error.
pub(crate) async fn patch_status<K: JobObject>(client: &kube::Client, obj: &K) -> Result<(), Error> {
    let api = Api::<K>::namespaced(client.clone(), &obj.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": obj.status() });
    match api
        .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::PatchStatusFailed(e)),
    }
}

pub(crate) fn object_to_owner_reference<K: Resource<DynamicType = ()>>(
    meta: ObjectMeta,
) -> Result<OwnerReference, Error> {
    Ok(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: meta.uid.ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        ..OwnerReference::default()
    })
}

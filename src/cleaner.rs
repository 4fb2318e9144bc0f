use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams};
use kube::ResourceExt;

use crate::config::Config;
use crate::error::{is_not_found, Error};
use crate::types::{JobObject, JobsHistoryLimiter};

/// Deletes a single job object from the cluster.
#[async_trait]
pub trait ObjectDeleter: Send + Sync {
    async fn delete_object<K: JobObject>(&self, obj: &K) -> Result<(), kube::Error>;
}

#[async_trait]
impl ObjectDeleter for kube::Client {
    async fn delete_object<K: JobObject>(&self, obj: &K) -> Result<(), kube::Error> {
        let namespace = obj.namespace().unwrap_or_default();
        let api = Api::<K>::namespaced(self.clone(), &namespace);
        api.delete(&obj.name_any(), &DeleteParams::foreground())
            .await
            .map(|_| ())
    }
}

/// Lists the job objects of one kind in a namespace.
#[async_trait]
pub trait ObjectLister: Send + Sync {
    async fn list_objects<K: JobObject>(&self, namespace: &str) -> Result<Vec<K>, kube::Error>;
}

#[async_trait]
impl ObjectLister for kube::Client {
    async fn list_objects<K: JobObject>(&self, namespace: &str) -> Result<Vec<K>, kube::Error> {
        let api = Api::<K>::namespaced(self.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Cleans the history of all objects of the kind of `obj` in its namespace,
/// applying the limits of `obj`. Returns the number of deleted objects.
pub async fn clean_history<K, C>(client: &C, obj: &K, config: &Config) -> Result<usize, Error>
where
    K: JobObject,
    C: ObjectLister + ObjectDeleter,
{
    let namespace = obj.namespace().unwrap_or_default();
    let objects = client
        .list_objects::<K>(&namespace)
        .await
        .map_err(|source| Error::ListObjectsFailed(K::JOB_TYPE, source))?;
    let cleaner = ObjectCleaner::new(
        client,
        Some(obj.history_limits() as &dyn JobsHistoryLimiter),
        config,
    );
    cleaner.clean_old_objects(objects).await
}

/// Removes finished job objects beyond the configured history limits, oldest first.
pub struct ObjectCleaner<'a, D> {
    deleter: &'a D,
    max_successful: usize,
    max_failed: usize,
}

impl<'a, D: ObjectDeleter> ObjectCleaner<'a, D> {
    /// Uses the limits of `limiter` where set and the global limits otherwise.
    pub fn new(deleter: &'a D, limiter: Option<&dyn JobsHistoryLimiter>, config: &Config) -> Self {
        let (max_successful, max_failed) = history_limits(limiter, config);
        Self::with_limits(deleter, max_successful, max_failed)
    }

    pub fn with_limits(deleter: &'a D, max_successful: usize, max_failed: usize) -> Self {
        ObjectCleaner {
            deleter,
            max_successful,
            max_failed,
        }
    }

    /// Deletes the oldest successful and failed objects until the limits are met.
    /// Running objects are never touched. Returns the number of deleted objects;
    /// the first failed deletion aborts the run and reports the count so far.
    pub async fn clean_old_objects<K: JobObject>(&self, objects: Vec<K>) -> Result<usize, Error> {
        let (_running, failed, successful) = group_by_status(objects);

        let deleted = self.clean(successful, self.max_successful, 0).await?;
        let deleted = self.clean(failed, self.max_failed, deleted).await?;
        Ok(deleted)
    }

    async fn clean<K: JobObject>(
        &self,
        mut objects: Vec<K>,
        max_objects: usize,
        deleted: usize,
    ) -> Result<usize, Error> {
        let to_delete = objects.len().saturating_sub(max_objects);
        tracing::info!(
            have = objects.len(),
            want = max_objects,
            deleting = to_delete,
            "cleaning old jobs"
        );
        if to_delete == 0 {
            return Ok(deleted);
        }

        sort_oldest_first(&mut objects);
        for (i, obj) in objects.iter().take(to_delete).enumerate() {
            let name = obj.name_any();
            tracing::info!(namespace = ?obj.namespace(), %name, "cleaning old job");
            match self.deleter.delete_object(obj).await {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(source) => {
                    tracing::error!(error = %source, namespace = ?obj.namespace(), "could not delete old job");
                    return Err(Error::DeleteFailed {
                        job_type: K::JOB_TYPE,
                        name,
                        deleted: deleted + i,
                        source,
                    });
                }
            }
        }
        Ok(deleted + to_delete)
    }
}

/// Splits objects into running, failed and successful ones.
pub fn group_by_status<K: JobObject>(objects: Vec<K>) -> (Vec<K>, Vec<K>, Vec<K>) {
    let mut running = Vec::new();
    let mut failed = Vec::new();
    let mut successful = Vec::new();
    for obj in objects {
        let status = obj.job_status();
        if !status.has_finished() {
            running.push(obj);
        } else if status.has_failed() {
            failed.push(obj);
        } else {
            successful.push(obj);
        }
    }
    (running, failed, successful)
}

fn sort_oldest_first<K: JobObject>(objects: &mut [K]) {
    objects.sort_by(|left, right| {
        let left_key = (
            left.meta().creation_timestamp.as_ref().map(|time| time.0),
            left.meta().name.as_deref(),
        );
        let right_key = (
            right.meta().creation_timestamp.as_ref().map(|time| time.0),
            right.meta().name.as_deref(),
        );
        left_key.cmp(&right_key)
    });
}

/// Resolves the (successful, failed) limits of an object against the global ones.
pub fn history_limits(limiter: Option<&dyn JobsHistoryLimiter>, config: &Config) -> (usize, usize) {
    let successful = config.global_successful_jobs_history_limit();
    let failed = config.global_failed_jobs_history_limit();
    match limiter {
        Some(limiter) => (
            get_or_default(limiter.successful_jobs_history_limit(), successful),
            get_or_default(limiter.failed_jobs_history_limit(), failed),
        ),
        None => (successful, failed),
    }
}

fn get_or_default(limit: Option<i32>, default: usize) -> usize {
    match limit {
        None => default,
        Some(limit) => usize::try_from(limit).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::error::api_error;
    use crate::types::{HistoryLimits, Restore, RestoreSpec, Status};

    #[derive(Default)]
    struct FakeDeleter {
        deleted: Mutex<Vec<String>>,
        not_found: HashSet<String>,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl ObjectDeleter for FakeDeleter {
        async fn delete_object<K: JobObject>(&self, obj: &K) -> Result<(), kube::Error> {
            let name = obj.name_any();
            if self.failing.contains(&name) {
                return Err(api_error(500, "InternalError"));
            }
            if self.not_found.contains(&name) {
                return Err(api_error(404, "NotFound"));
            }
            self.deleted.lock().unwrap().push(name);
            Ok(())
        }
    }

    fn restore(name: &str, minute: u32, status: Option<Status>) -> Restore {
        let mut restore = Restore::new(name, RestoreSpec::default());
        restore.metadata.namespace = Some("ns".to_string());
        restore.metadata.creation_timestamp =
            Some(Time(Utc.with_ymd_and_hms(2023, 1, 1, 0, minute, 0).unwrap()));
        restore.status = status;
        restore
    }

    fn succeeded() -> Option<Status> {
        let mut status = Status::default();
        status.set_succeeded("done");
        Some(status)
    }

    fn failed() -> Option<Status> {
        let mut status = Status::default();
        status.set_failed("boom");
        Some(status)
    }

    #[test]
    fn groups_by_status() {
        let (running, failed, successful) = group_by_status(vec![
            restore("success", 0, succeeded()),
            restore("failed", 1, failed()),
            restore("running", 2, None),
        ]);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name_any(), "running");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name_any(), "failed");
        assert_eq!(successful.len(), 1);
        assert_eq!(successful[0].name_any(), "success");
    }

    #[test]
    fn object_limits_override_global_limits() {
        let mut config = Config::default();
        config.global_successful_jobs_history_limit = 5;
        config.global_failed_jobs_history_limit = 4;

        assert_eq!(history_limits(None, &config), (5, 4));

        let limits = HistoryLimits {
            successful_jobs_history_limit: Some(1),
            ..Default::default()
        };
        assert_eq!(history_limits(Some(&limits as &dyn JobsHistoryLimiter), &config), (1, 4));

        let negative = HistoryLimits {
            keep_jobs: Some(-2),
            ..Default::default()
        };
        assert_eq!(history_limits(Some(&negative as &dyn JobsHistoryLimiter), &config), (0, 0));
    }

    #[tokio::test]
    async fn keeps_newest_objects_within_limits() {
        let deleter = FakeDeleter::default();
        let objects = vec![
            restore("s-3", 3, succeeded()),
            restore("s-1", 1, succeeded()),
            restore("f-2", 2, failed()),
            restore("s-2", 2, succeeded()),
            restore("f-1", 1, failed()),
            restore("r-0", 0, None),
            restore("f-3", 3, failed()),
        ];

        let deleted = ObjectCleaner::with_limits(&deleter, 1, 2)
            .clean_old_objects(objects)
            .await
            .unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(
            *deleter.deleted.lock().unwrap(),
            vec!["s-1".to_string(), "s-2".to_string(), "f-1".to_string()]
        );
    }

    #[tokio::test]
    async fn ties_are_broken_by_name() {
        let deleter = FakeDeleter::default();
        let objects = vec![
            restore("b", 0, succeeded()),
            restore("a", 0, succeeded()),
            restore("c", 0, succeeded()),
        ];
        let deleted = ObjectCleaner::with_limits(&deleter, 1, 0)
            .clean_old_objects(objects)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(
            *deleter.deleted.lock().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn nothing_to_delete_below_limits() {
        let deleter = FakeDeleter::default();
        let deleted = ObjectCleaner::with_limits(&deleter, 3, 3)
            .clean_old_objects(vec![restore("s", 0, succeeded()), restore("f", 0, failed())])
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(deleter.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_found_counts_as_deleted() {
        let deleter = FakeDeleter {
            not_found: HashSet::from(["s-1".to_string()]),
            ..Default::default()
        };
        let deleted = ObjectCleaner::with_limits(&deleter, 0, 0)
            .clean_old_objects(vec![restore("s-1", 1, succeeded()), restore("s-2", 2, succeeded())])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(*deleter.deleted.lock().unwrap(), vec!["s-2".to_string()]);
    }

    #[tokio::test]
    async fn aborts_on_first_error_with_partial_count() {
        let deleter = FakeDeleter {
            failing: HashSet::from(["f-2".to_string()]),
            ..Default::default()
        };
        let objects = vec![
            restore("s-1", 1, succeeded()),
            restore("f-1", 1, failed()),
            restore("f-2", 2, failed()),
            restore("f-3", 3, failed()),
        ];

        let error = ObjectCleaner::with_limits(&deleter, 0, 0)
            .clean_old_objects(objects)
            .await
            .unwrap_err();

        match error {
            Error::DeleteFailed { name, deleted, .. } => {
                assert_eq!(name, "f-2");
                assert_eq!(deleted, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            *deleter.deleted.lock().unwrap(),
            vec!["s-1".to_string(), "f-1".to_string()]
        );
    }
}

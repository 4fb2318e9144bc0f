//! Admission control per repository.
//!
//! Every decision to start work on a repository funnels through that
//! repository's mutex: the live batch jobs are listed, the admission predicates
//! are evaluated and the caller's runnable is executed, all while the lock is
//! held. Two reconciles can therefore never both conclude that a limit has not
//! been reached yet.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::types::{sha256_hash, JobType, LABEL_EXCLUSIVE, LABEL_MANAGED, LABEL_REPOSITORY_HASH, LABEL_TYPE};

/// Lists batch jobs across all namespaces by label selector.
#[async_trait]
pub trait JobLister: Send + Sync {
    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>, kube::Error>;
}

#[async_trait]
impl JobLister for kube::Client {
    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>, kube::Error> {
        let api = Api::<Job>::all(self.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }
}

/// Hands out one locker per repository, created on first use and kept for the
/// lifetime of the process.
pub struct Lockers {
    lister: Arc<dyn JobLister>,
    lockers: DashMap<String, Arc<RepositoryLocker>>,
}

impl Lockers {
    pub fn new(lister: Arc<dyn JobLister>) -> Self {
        Lockers {
            lister,
            lockers: DashMap::new(),
        }
    }

    pub fn for_repository(&self, repository: &str) -> Arc<RepositoryLocker> {
        if let Some(locker) = self.lockers.get(repository) {
            return locker.clone();
        }
        self.lockers
            .entry(repository.to_string())
            .or_insert_with(|| {
                Arc::new(RepositoryLocker {
                    repository: repository.to_string(),
                    lister: self.lister.clone(),
                    mutex: Mutex::new(()),
                })
            })
            .clone()
    }
}

pub struct RepositoryLocker {
    repository: String,
    lister: Arc<dyn JobLister>,
    mutex: Mutex<()>,
}

impl RepositoryLocker {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Runs `runnable` if no exclusive job is active on the repository and the
    /// active jobs of `job_type` stay below `concurrency_limit` (0 is unlimited).
    ///
    /// Returns `Ok(None)` if the job was not admitted, and `Ok(Some(_))` with the
    /// runnable's result otherwise. Errors mean admission could not be decided.
    pub async fn try_run<F, Fut, R>(
        &self,
        job_type: JobType,
        concurrency_limit: usize,
        runnable: F,
    ) -> Result<Option<R>, Error>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let _guard = self.lock().await;

        let running = self.fetch_running_jobs().await?;
        let admitted = !is_exclusive_job_running(&running)
            && !is_concurrency_limit_reached(&running, job_type, concurrency_limit);
        let result = if admitted { Some(runnable().await) } else { None };

        tracing::debug!(repository = %self.repository, "unlocked");
        Ok(result)
    }

    /// Runs `runnable` only if no job at all is active on the repository.
    pub async fn try_run_exclusively<F, Fut, R>(&self, runnable: F) -> Result<Option<R>, Error>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let _guard = self.lock().await;

        let running = self.fetch_running_jobs().await?;
        let result = if running.is_empty() {
            Some(runnable().await)
        } else {
            None
        };

        tracing::debug!(repository = %self.repository, "unlocked");
        Ok(result)
    }

    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        let guard = self.mutex.lock().await;
        tracing::debug!(repository = %self.repository, "locked");
        guard
    }

    /// Batch jobs of this repository with at least one active pod.
    async fn fetch_running_jobs(&self) -> Result<Vec<Job>, Error> {
        let selector = format!(
            "{}=true,{}={}",
            LABEL_MANAGED,
            LABEL_REPOSITORY_HASH,
            sha256_hash(&self.repository)
        );
        let jobs = self
            .lister
            .list_jobs(&selector)
            .await
            .map_err(Error::ListJobsFailed)?;
        Ok(jobs.into_iter().filter(|job| active_pods(job) > 0).collect())
    }
}

fn active_pods(job: &Job) -> i32 {
    job.status
        .as_ref()
        .and_then(|status| status.active)
        .unwrap_or(0)
}

fn label<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

/// True if any of the jobs is active and labeled exclusive.
pub fn is_exclusive_job_running(jobs: &[Job]) -> bool {
    jobs.iter()
        .any(|job| active_pods(job) > 0 && label(job, LABEL_EXCLUSIVE) == Some("true"))
}

/// True if the active pods of jobs of the given type add up to the limit.
/// A limit of 0 is never reached.
pub fn is_concurrency_limit_reached(jobs: &[Job], job_type: JobType, limit: usize) -> bool {
    if limit == 0 {
        return false;
    }
    let active: usize = jobs
        .iter()
        .filter(|job| label(job, LABEL_TYPE) == Some(job_type.as_str()))
        .map(|job| usize::try_from(active_pods(job)).unwrap_or(0))
        .sum();
    active >= limit
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::error::api_error;

    /// Serves a fixed list of jobs and records the selectors it was asked for.
    #[derive(Default)]
    pub(crate) struct FakeLister {
        pub(crate) jobs: StdMutex<Vec<Job>>,
        pub(crate) selectors: StdMutex<Vec<String>>,
        pub(crate) fail: bool,
    }

    impl FakeLister {
        pub(crate) fn with_jobs(jobs: Vec<Job>) -> Self {
            FakeLister {
                jobs: StdMutex::new(jobs),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl JobLister for FakeLister {
        async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>, kube::Error> {
            self.selectors.lock().unwrap().push(label_selector.to_string());
            if self.fail {
                return Err(api_error(500, "InternalError"));
            }
            Ok(self.jobs.lock().unwrap().clone())
        }
    }

    pub(crate) fn batch_job(job_type: JobType, exclusive: bool, active: i32) -> Job {
        let mut labels = BTreeMap::from([(LABEL_TYPE.to_string(), job_type.to_string())]);
        if exclusive {
            labels.insert(LABEL_EXCLUSIVE.to_string(), "true".to_string());
        }
        Job {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            },
            spec: None,
            status: Some(JobStatus {
                active: Some(active),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn concurrency_limit() {
        let cases = [
            (0, vec![1], false),
            (4, vec![1, 2], false),
            (1, vec![1], true),
            (2, vec![1, 0, 2], true),
        ];
        for (limit, active, expected) in cases {
            let jobs: Vec<Job> = active
                .iter()
                .map(|active| batch_job(JobType::Backup, false, *active))
                .collect();
            assert_eq!(
                is_concurrency_limit_reached(&jobs, JobType::Backup, limit),
                expected,
                "limit {} active {:?}",
                limit,
                active
            );
        }
    }

    #[test]
    fn concurrency_limit_counts_same_type_only() {
        let jobs = vec![
            batch_job(JobType::Archive, false, 3),
            batch_job(JobType::Backup, false, 1),
        ];
        assert!(!is_concurrency_limit_reached(&jobs, JobType::Backup, 2));
        assert!(is_concurrency_limit_reached(&jobs, JobType::Archive, 2));
    }

    #[test]
    fn exclusive_job_running() {
        assert!(!is_exclusive_job_running(&[batch_job(JobType::Backup, false, 1)]));
        assert!(!is_exclusive_job_running(&[batch_job(JobType::Prune, true, 0)]));
        assert!(is_exclusive_job_running(&[
            batch_job(JobType::Backup, false, 1),
            batch_job(JobType::Prune, true, 1),
        ]));
    }

    #[tokio::test]
    async fn fetches_active_jobs_of_repository() {
        let lister = Arc::new(FakeLister::with_jobs(vec![
            batch_job(JobType::Backup, false, 0),
            batch_job(JobType::Backup, false, 1),
        ]));
        let lockers = Lockers::new(lister.clone());
        let locker = lockers.for_repository("s3:https://s3.example.com/bucket");

        let running = locker.fetch_running_jobs().await.unwrap();

        assert_eq!(running.len(), 1);
        assert_eq!(
            lister.selectors.lock().unwrap().as_slice(),
            [format!(
                "backup.example.com/managed=true,backup.example.com/repository-hash={}",
                sha256_hash("s3:https://s3.example.com/bucket")
            )]
        );
    }

    #[tokio::test]
    async fn lockers_are_cached_per_repository() {
        let lockers = Lockers::new(Arc::new(FakeLister::default()));
        let first = lockers.for_repository("repo-a");
        assert!(Arc::ptr_eq(&first, &lockers.for_repository("repo-a")));
        assert!(!Arc::ptr_eq(&first, &lockers.for_repository("repo-b")));
        assert_eq!(first.repository(), "repo-a");
    }

    #[tokio::test]
    async fn exclusive_job_blocks_everything() {
        let lockers = Lockers::new(Arc::new(FakeLister::with_jobs(vec![batch_job(
            JobType::Prune,
            true,
            1,
        )])));
        let locker = lockers.for_repository("repo");

        let ran = locker.try_run(JobType::Backup, 0, || async {}).await.unwrap();
        assert!(ran.is_none());
        let ran = locker.try_run_exclusively(|| async {}).await.unwrap();
        assert!(ran.is_none());
    }

    #[tokio::test]
    async fn regular_job_blocks_exclusive_only() {
        let lockers = Lockers::new(Arc::new(FakeLister::with_jobs(vec![batch_job(
            JobType::Backup,
            false,
            1,
        )])));
        let locker = lockers.for_repository("repo");

        let ran = locker.try_run(JobType::Backup, 0, || async { 42 }).await.unwrap();
        assert_eq!(ran, Some(42));
        let ran = locker.try_run(JobType::Backup, 1, || async { 42 }).await.unwrap();
        assert_eq!(ran, None);
        let ran = locker.try_run_exclusively(|| async {}).await.unwrap();
        assert!(ran.is_none());
    }

    #[tokio::test]
    async fn idle_repository_admits_exclusive_job() {
        let lockers = Lockers::new(Arc::new(FakeLister::default()));
        let ran = lockers
            .for_repository("repo")
            .try_run_exclusively(|| async { "created" })
            .await
            .unwrap();
        assert_eq!(ran, Some("created"));
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let lockers = Lockers::new(Arc::new(FakeLister {
            fail: true,
            ..Default::default()
        }));
        let locker = lockers.for_repository("repo");

        let result = locker.try_run(JobType::Backup, 0, || async {}).await;
        assert!(matches!(result, Err(Error::ListJobsFailed(_))));
        let result = locker.try_run_exclusively(|| async {}).await;
        assert!(matches!(result, Err(Error::ListJobsFailed(_))));
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::locker::Lockers;
use crate::queue::{ExecutionQueue, Executor};

/// Drains the execution queues, asking the repository's locker for admission
/// before running each executor.
pub struct QueueWorker {
    queue: Arc<ExecutionQueue>,
    lockers: Arc<Lockers>,
    interval: Duration,
}

impl QueueWorker {
    pub fn new(queue: Arc<ExecutionQueue>, lockers: Arc<Lockers>, interval: Duration) -> Self {
        QueueWorker {
            queue,
            lockers,
            interval,
        }
    }

    /// Runs forever, one pass over all repositories per tick.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        for repository in self.queue.repositories() {
            self.process_repository(&repository).await;
        }
    }

    /// Runs executors of the repository until its queue is empty, one of them is
    /// not admitted, or an exclusive one was started.
    async fn process_repository(&self, repository: &str) {
        let locker = self.lockers.for_repository(repository);
        while let Some(executor) = self.queue.get(repository) {
            let exclusive = executor.exclusive();
            let job_type = executor.job_type();

            let ran = if exclusive {
                locker
                    .try_run_exclusively(|| execute(executor.as_ref()))
                    .await
            } else {
                locker
                    .try_run(job_type, executor.concurrency_limit(), || {
                        execute(executor.as_ref())
                    })
                    .await
            };

            match ran {
                Err(error) => {
                    tracing::error!(%error, %job_type, %repository, "cannot schedule job");
                    return;
                }
                Ok(None) => {
                    tracing::info!(
                        %job_type,
                        exclusive,
                        %repository,
                        namespace = executor.namespace(),
                        name = executor.name(),
                        "skipping job due to exclusivity or concurrency limit"
                    );
                    return;
                }
                Ok(Some(())) if exclusive => return,
                Ok(Some(())) => {}
            }
        }
    }
}

async fn execute(executor: &dyn Executor) {
    match executor.execute().await {
        Ok(()) => {}
        Err(error) if error.is_already_exists() => {
            tracing::info!(
                job_type = %executor.job_type(),
                namespace = executor.namespace(),
                name = executor.name(),
                "job already exists"
            );
        }
        Err(error) => {
            tracing::error!(
                %error,
                job_type = %executor.job_type(),
                repository = executor.repository(),
                "failed to execute"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{api_error, Error};
    use crate::locker::tests::{batch_job, FakeLister};
    use crate::queue::tests::FakeExecutor;
    use crate::types::JobType;

    struct Setup {
        queue: Arc<ExecutionQueue>,
        worker: QueueWorker,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    fn setup(lister: FakeLister) -> Setup {
        let queue = Arc::new(ExecutionQueue::new());
        let lockers = Arc::new(Lockers::new(Arc::new(lister)));
        let worker = QueueWorker::new(queue.clone(), lockers, Duration::from_secs(1));
        Setup {
            queue,
            worker,
            log: Arc::default(),
        }
    }

    impl Setup {
        fn add(&self, mut executor: FakeExecutor) -> Arc<FakeExecutor> {
            executor.log = self.log.clone();
            let executor = Arc::new(executor);
            self.queue.add(executor.clone());
            executor
        }

        fn executed(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[tokio::test]
    async fn runs_regular_jobs_until_drained() {
        let setup = setup(FakeLister::default());
        setup.add(FakeExecutor::new("backup-1", false));
        setup.add(FakeExecutor::new("backup-2", false));

        setup.worker.tick().await;

        assert_eq!(setup.executed(), vec!["backup-1", "backup-2"]);
        assert!(setup.queue.is_empty("repo"));
    }

    #[tokio::test]
    async fn exclusive_job_ends_the_pass_for_its_repository() {
        let setup = setup(FakeLister::default());
        setup.add(FakeExecutor::new("backup-1", false));
        setup.add(FakeExecutor::new("prune-1", true));

        setup.worker.tick().await;

        assert_eq!(setup.executed(), vec!["prune-1"]);
        assert!(!setup.queue.is_empty("repo"));

        setup.worker.tick().await;
        assert_eq!(setup.executed(), vec!["prune-1", "backup-1"]);
    }

    #[tokio::test]
    async fn denied_job_is_dropped_and_stops_the_repository() {
        let setup = setup(FakeLister::with_jobs(vec![batch_job(JobType::Check, true, 1)]));
        let denied = setup.add(FakeExecutor::new("backup-1", false));
        setup.add(FakeExecutor::new("backup-2", false));

        setup.worker.tick().await;

        assert!(setup.executed().is_empty());
        assert_eq!(denied.executions.load(std::sync::atomic::Ordering::SeqCst), 0);
        // the denied executor is gone, the next one waits for the following tick
        assert_eq!(
            setup.queue.get("repo").map(|executor| executor.name().to_string()),
            Some("backup-2".to_string())
        );
        assert!(setup.queue.is_empty("repo"));
    }

    #[tokio::test]
    async fn concurrency_limit_is_applied_per_job_type() {
        let setup = setup(FakeLister::with_jobs(vec![batch_job(JobType::Backup, false, 1)]));
        let mut limited = FakeExecutor::new("backup-1", false);
        limited.concurrency_limit = 1;
        setup.add(limited);

        setup.worker.tick().await;
        assert!(setup.executed().is_empty());

        let mut archive = FakeExecutor::new("archive-1", false);
        archive.job_type = JobType::Archive;
        archive.concurrency_limit = 1;
        setup.add(archive);

        setup.worker.tick().await;
        assert_eq!(setup.executed(), vec!["archive-1"]);
    }

    #[tokio::test]
    async fn execution_failures_do_not_stop_the_repository() {
        let setup = setup(FakeLister::default());
        let mut racing = FakeExecutor::new("backup-1", false);
        racing.result = || Err(Error::CreateJobFailed(api_error(409, "AlreadyExists")));
        setup.add(racing);
        let mut failing = FakeExecutor::new("backup-2", false);
        failing.result = || Err(Error::CreateJobFailed(api_error(500, "InternalError")));
        setup.add(failing);
        setup.add(FakeExecutor::new("backup-3", false));

        setup.worker.tick().await;

        assert_eq!(setup.executed(), vec!["backup-1", "backup-2", "backup-3"]);
        assert!(setup.queue.is_empty("repo"));
    }

    #[tokio::test]
    async fn listing_failure_leaves_the_rest_for_later() {
        let setup = setup(FakeLister {
            fail: true,
            ..Default::default()
        });
        setup.add(FakeExecutor::new("backup-1", false));
        setup.add(FakeExecutor::new("backup-2", false));

        setup.worker.tick().await;

        assert!(setup.executed().is_empty());
        assert!(!setup.queue.is_empty("repo"));
    }
}

//! Pending executions, one queue per repository. Exclusive executors are served
//! before regular ones, and insertion order is kept within each class.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Error;
use crate::types::JobType;

/// A unit of work waiting for admission on its repository.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Creates the workload.
    async fn execute(&self) -> Result<(), Error>;

    /// Whether the job must not run together with any other job on its repository.
    fn exclusive(&self) -> bool;

    /// Maximum of active jobs of this type on the repository, 0 is unlimited.
    fn concurrency_limit(&self) -> usize;

    fn repository(&self) -> &str;

    fn job_type(&self) -> JobType;

    fn namespace(&self) -> &str;

    fn name(&self) -> &str;
}

#[derive(Default)]
struct RepositoryQueue {
    exclusive: VecDeque<Arc<dyn Executor>>,
    regular: VecDeque<Arc<dyn Executor>>,
}

impl RepositoryQueue {
    fn contains(&self, executor: &dyn Executor) -> bool {
        self.exclusive
            .iter()
            .chain(self.regular.iter())
            .any(|queued| {
                queued.job_type() == executor.job_type()
                    && queued.namespace() == executor.namespace()
                    && queued.name() == executor.name()
            })
    }

    fn pop(&mut self) -> Option<Arc<dyn Executor>> {
        self.exclusive
            .pop_front()
            .or_else(|| self.regular.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.exclusive.is_empty() && self.regular.is_empty()
    }
}

#[derive(Default)]
pub struct ExecutionQueue {
    queues: Mutex<HashMap<String, RepositoryQueue>>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the executor on its repository. An executor for the same object
    /// that is still pending is not queued twice.
    pub fn add(&self, executor: Arc<dyn Executor>) {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(executor.repository().to_string())
            .or_default();
        if queue.contains(executor.as_ref()) {
            tracing::debug!(
                job_type = %executor.job_type(),
                namespace = executor.namespace(),
                name = executor.name(),
                "already queued"
            );
            return;
        }
        if executor.exclusive() {
            queue.exclusive.push_back(executor);
        } else {
            queue.regular.push_back(executor);
        }
    }

    /// Pops the next executor of the repository. A drained queue is removed.
    pub fn get(&self, repository: &str) -> Option<Arc<dyn Executor>> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(repository)?;
        let executor = queue.pop();
        if queue.is_empty() {
            queues.remove(repository);
        }
        executor
    }

    pub fn is_empty(&self, repository: &str) -> bool {
        self.queues
            .lock()
            .get(repository)
            .map_or(true, RepositoryQueue::is_empty)
    }

    /// Repositories with pending work.
    pub fn repositories(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }
}

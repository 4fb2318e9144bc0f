use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use kube::Client;
use tracing_subscriber::EnvFilter;

use backup_operator::config::Config;
use backup_operator::locker::Lockers;
use backup_operator::queue::ExecutionQueue;
use backup_operator::reconcile::{self, Data};
use backup_operator::scheduler::Scheduler;
use backup_operator::types::{Archive, Backup, Check, JobObject, Prune, Restore, Schedule};
use backup_operator::worker::QueueWorker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::parse());
    let client = Client::try_default().await?;

    let queue = Arc::new(ExecutionQueue::new());
    let lockers = Arc::new(Lockers::new(Arc::new(client.clone())));
    let ctx = Arc::new(Data {
        client: client.clone(),
        config: config.clone(),
        queue: queue.clone(),
        scheduler: Arc::new(Scheduler::new()),
    });

    tokio::spawn(QueueWorker::new(queue, lockers, config.queue_worker_interval()).run());

    let schedules = Controller::new(Api::<Schedule>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile::schedule::reconcile,
            reconcile::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        });

    futures_util::join!(
        run_job_controller::<Backup>(client.clone(), ctx.clone()),
        run_job_controller::<Check>(client.clone(), ctx.clone()),
        run_job_controller::<Prune>(client.clone(), ctx.clone()),
        run_job_controller::<Archive>(client.clone(), ctx.clone()),
        run_job_controller::<Restore>(client.clone(), ctx.clone()),
        schedules,
    );

    tracing::info!("controller terminated");

    Ok(())
}

/// Watches one job kind and the batch jobs it owns.
async fn run_job_controller<K: JobObject>(client: Client, ctx: Arc<Data>) {
    Controller::new(Api::<K>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Job>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile::job::reconcile::<K>,
            reconcile::error_policy::<K>,
            ctx,
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!(job_type = %K::JOB_TYPE, "reconciled {:?}", o),
                Err(e) => tracing::warn!(job_type = %K::JOB_TYPE, "reconcile failed: {}", e),
            }
        })
        .await;
}

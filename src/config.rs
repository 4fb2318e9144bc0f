use std::time::Duration;

use clap::Parser;

use crate::types::JobType;

const DEFAULT_BACKUP_IMAGE: &str = "ghcr.io/example/backup-engine:latest";
const DEFAULT_BACKUP_COMMAND: &str = "/usr/local/bin/backup-engine,restic";

/// Operator configuration, read from flags or `BACKUP_*` environment variables.
#[derive(Parser, Clone, Debug)]
#[command(name = "controller", version, about)]
pub struct Config {
    /// Image used to run the spawned backup workloads
    #[arg(long, env = "BACKUP_IMAGE", default_value = DEFAULT_BACKUP_IMAGE)]
    pub backup_image: String,

    /// Command of the spawned workload container
    #[arg(
        long,
        env = "BACKUP_COMMAND",
        value_delimiter = ',',
        default_value = DEFAULT_BACKUP_COMMAND
    )]
    pub backup_command: Vec<String>,

    /// S3 endpoint of the repository used when a job has no backend
    #[arg(long, env = "BACKUP_GLOBALS3ENDPOINT", default_value = "")]
    pub global_s3_endpoint: String,

    /// S3 bucket of the repository used when a job has no backend
    #[arg(long, env = "BACKUP_GLOBALS3BUCKET", default_value = "")]
    pub global_s3_bucket: String,

    /// Deprecated combined history limit, negative means unset
    #[arg(long, env = "BACKUP_GLOBALKEEPJOBS", default_value_t = -1, allow_negative_numbers = true)]
    pub global_keep_jobs: i32,

    #[arg(long, env = "BACKUP_GLOBAL_FAILED_JOBS_HISTORY_LIMIT", default_value_t = 3, allow_negative_numbers = true)]
    pub global_failed_jobs_history_limit: i32,

    #[arg(long, env = "BACKUP_GLOBAL_SUCCESSFUL_JOBS_HISTORY_LIMIT", default_value_t = 3, allow_negative_numbers = true)]
    pub global_successful_jobs_history_limit: i32,

    /// Concurrent backup jobs per repository, 0 is unlimited
    #[arg(long, env = "BACKUP_GLOBAL_CONCURRENT_BACKUP_JOBS_LIMIT", default_value_t = 0)]
    pub global_concurrent_backup_jobs_limit: usize,

    #[arg(long, env = "BACKUP_GLOBAL_CONCURRENT_CHECK_JOBS_LIMIT", default_value_t = 0)]
    pub global_concurrent_check_jobs_limit: usize,

    #[arg(long, env = "BACKUP_GLOBAL_CONCURRENT_PRUNE_JOBS_LIMIT", default_value_t = 0)]
    pub global_concurrent_prune_jobs_limit: usize,

    #[arg(long, env = "BACKUP_GLOBAL_CONCURRENT_ARCHIVE_JOBS_LIMIT", default_value_t = 0)]
    pub global_concurrent_archive_jobs_limit: usize,

    #[arg(long, env = "BACKUP_GLOBAL_CONCURRENT_RESTORE_JOBS_LIMIT", default_value_t = 0)]
    pub global_concurrent_restore_jobs_limit: usize,

    /// How often the queue worker drains the repository queues
    #[arg(long, env = "BACKUP_QUEUE_WORKER_INTERVAL_MS", default_value_t = 1000)]
    pub queue_worker_interval_ms: u64,
}

/// The flag defaults, without reading the environment.
impl Default for Config {
    fn default() -> Self {
        Config {
            backup_image: DEFAULT_BACKUP_IMAGE.to_string(),
            backup_command: DEFAULT_BACKUP_COMMAND.split(',').map(str::to_string).collect(),
            global_s3_endpoint: String::new(),
            global_s3_bucket: String::new(),
            global_keep_jobs: -1,
            global_failed_jobs_history_limit: 3,
            global_successful_jobs_history_limit: 3,
            global_concurrent_backup_jobs_limit: 0,
            global_concurrent_check_jobs_limit: 0,
            global_concurrent_prune_jobs_limit: 0,
            global_concurrent_archive_jobs_limit: 0,
            global_concurrent_restore_jobs_limit: 0,
            queue_worker_interval_ms: 1000,
        }
    }
}

impl Config {
    /// `s3:<endpoint>/<bucket>` built from the global S3 settings.
    pub fn global_repository(&self) -> String {
        format!("s3:{}/{}", self.global_s3_endpoint, self.global_s3_bucket)
    }

    /// Falls back to the global keep-jobs value when the specific limit is unset.
    pub fn global_failed_jobs_history_limit(&self) -> usize {
        resolve_global_limit(self.global_failed_jobs_history_limit, self.global_keep_jobs)
    }

    pub fn global_successful_jobs_history_limit(&self) -> usize {
        resolve_global_limit(
            self.global_successful_jobs_history_limit,
            self.global_keep_jobs,
        )
    }

    pub fn concurrency_limit(&self, job_type: JobType) -> usize {
        match job_type {
            JobType::Backup => self.global_concurrent_backup_jobs_limit,
            JobType::Check => self.global_concurrent_check_jobs_limit,
            JobType::Prune => self.global_concurrent_prune_jobs_limit,
            JobType::Archive => self.global_concurrent_archive_jobs_limit,
            JobType::Restore => self.global_concurrent_restore_jobs_limit,
            JobType::Schedule => 0,
        }
    }

    pub fn queue_worker_interval(&self) -> Duration {
        Duration::from_millis(self.queue_worker_interval_ms.max(1))
    }
}

fn resolve_global_limit(specific: i32, keep_jobs: i32) -> usize {
    let resolved = if keep_jobs < 0 || specific >= 0 {
        specific
    } else {
        keep_jobs
    };
    usize::try_from(resolved).unwrap_or(0)
}

//! The live cron table. Each owner (a Schedule object) has a set of entries that
//! is replaced as a whole on every reconcile; every entry is a task that sleeps
//! until its next fire time and then creates a new job object.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::types::{JobType, ScheduleDefinition};

const NAME_RANDOM_LENGTH: usize = 5;
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const DAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn of<K: Resource>(obj: &K) -> Self {
        OwnerKey {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Creates a job object with the given name when a cron entry fires.
#[async_trait]
pub trait JobCreator: Send + Sync {
    async fn create(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// One cron entry to register for an owner.
pub struct ScheduledJob {
    pub job_type: JobType,
    pub schedule: ScheduleDefinition,
    pub creator: Arc<dyn JobCreator>,
}

struct Registration {
    job_type: JobType,
    schedule: ScheduleDefinition,
    handle: JoinHandle<()>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Default)]
pub struct Scheduler {
    registrations: Mutex<HashMap<OwnerKey, Vec<Registration>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all entries of the owner with the given jobs.
    ///
    /// Every schedule is parsed before anything changes: if one of them is
    /// invalid the error is returned and the previous entries stay active.
    /// Must be called within a Tokio runtime.
    pub fn sync_schedules(&self, owner: &OwnerKey, jobs: Vec<ScheduledJob>) -> Result<(), Error> {
        let parsed = jobs
            .into_iter()
            .map(|job| to_cron_schedule(&job.schedule).map(|cron| (job, cron)))
            .collect::<Result<Vec<_>, _>>()?;

        if parsed.is_empty() {
            self.remove_schedules(owner);
            return Ok(());
        }

        let registrations = parsed
            .into_iter()
            .map(|(job, cron)| {
                tracing::debug!(%owner, job_type = %job.job_type, cron = %job.schedule, "set schedule");
                let handle = tokio::spawn(run_entry(
                    owner.clone(),
                    job.job_type,
                    job.schedule.clone(),
                    cron,
                    job.creator,
                ));
                Registration {
                    job_type: job.job_type,
                    schedule: job.schedule,
                    handle,
                }
            })
            .collect();

        // dropping the previous registrations aborts their tasks
        let previous = self.registrations.lock().insert(owner.clone(), registrations);
        drop(previous);
        Ok(())
    }

    /// Cancels all entries of the owner.
    pub fn remove_schedules(&self, owner: &OwnerKey) {
        let removed = self.registrations.lock().remove(owner);
        if let Some(removed) = removed {
            for registration in &removed {
                tracing::debug!(%owner, job_type = %registration.job_type, cron = %registration.schedule, "removed schedule");
            }
        }
    }

    pub fn has_schedule(&self, owner: &OwnerKey) -> bool {
        self.registrations.lock().contains_key(owner)
    }

    /// The job types and schedules currently registered for the owner.
    pub fn registered(&self, owner: &OwnerKey) -> Vec<(JobType, ScheduleDefinition)> {
        self.registrations
            .lock()
            .get(owner)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|registration| (registration.job_type, registration.schedule.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

async fn run_entry(
    owner: OwnerKey,
    job_type: JobType,
    definition: ScheduleDefinition,
    schedule: CronSchedule,
    creator: Arc<dyn JobCreator>,
) {
    let mut cursor: DateTime<Utc> = Utc::now();
    loop {
        let next = match schedule.next_after(&cursor) {
            Some(next) => next,
            None => {
                tracing::info!(%owner, %job_type, cron = %definition, "schedule has no upcoming runs");
                return;
            }
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        tracing::info!(%owner, %job_type, cron = %definition, "running schedule");
        fire(&owner, job_type, creator.as_ref()).await;
        cursor = next;
    }
}

async fn fire(owner: &OwnerKey, job_type: JobType, creator: &dyn JobCreator) {
    let name = generate_name(job_type, &owner.name);
    match creator.create(&name, &owner.namespace).await {
        Ok(()) => {}
        Err(error) if error.is_already_exists() => {
            tracing::info!(%job_type, namespace = %owner.namespace, %name, "object already exists");
        }
        Err(error) => {
            tracing::error!(%error, %job_type, namespace = %owner.namespace, %name, "could not create new object");
        }
    }
}

/// `<prefix>-<jobType>-<random>`, with the prefix shortened so the name fits
/// into 63 characters.
pub fn generate_name(job_type: JobType, prefix: &str) -> String {
    let remaining = 63 - NAME_RANDOM_LENGTH - job_type.as_str().len() - 2;
    let short_prefix: String = prefix.chars().take(remaining).collect();
    let mut rng = rand::thread_rng();
    let random: String = (0..NAME_RANDOM_LENGTH)
        .map(|_| char::from(NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())]))
        .collect();
    format!("{}-{}-{}", short_prefix, job_type, random)
}

/// A parsed cron expression. Standard cron fires when either the day of month
/// or the day of week matches if both are restricted, which the parser cannot
/// express in one schedule, so such expressions are split in two.
#[derive(Clone, Debug)]
pub struct CronSchedule {
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    /// The first fire time strictly after the given instant.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

/// Parses a standard 5-field cron expression or one of the `@` macros.
pub fn to_cron_schedule(definition: &ScheduleDefinition) -> Result<CronSchedule, Error> {
    let expressions = match definition.as_str().trim() {
        "@yearly" | "@annually" => vec!["0 0 0 1 1 *".to_string()],
        "@monthly" => vec!["0 0 0 1 * *".to_string()],
        "@weekly" => vec!["0 0 0 * * Sun".to_string()],
        "@daily" | "@midnight" => vec!["0 0 0 * * *".to_string()],
        "@hourly" => vec!["0 0 * * * *".to_string()],
        other => with_seconds(other),
    };
    let schedules = expressions
        .iter()
        .map(|expression| {
            cron::Schedule::from_str(expression).map_err(|source| Error::ParseScheduleFailed {
                schedule: definition.to_string(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CronSchedule { schedules })
}

/// Prepends a seconds field and spells out numeric weekdays, whose numbering
/// differs between standard cron (0-7, Sunday is 0 and 7) and the parser.
fn with_seconds(expression: &str) -> Vec<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return vec![expression.to_string()];
    }
    let weekdays = weekdays_by_name(fields[4]);
    let entry = |days: &str, weekdays: &str| {
        format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], days, fields[3], weekdays
        )
    };
    if is_restricted(fields[2]) && is_restricted(fields[4]) {
        vec![entry(fields[2], "*"), entry("*", &weekdays)]
    } else {
        vec![entry(fields[2], &weekdays)]
    }
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

fn weekdays_by_name(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => match step.parse::<usize>() {
                    Ok(step) if step > 0 => (range, Some(step)),
                    _ => return part.to_string(),
                },
                None => (part, None),
            };
            let bounds = match range.split_once('-') {
                Some((start, end)) => day_number(start).zip(day_number(end)),
                // a single day with a step runs to the end of the week
                None => day_number(range).map(|day| (day, if step.is_some() { 6 } else { day })),
            };
            match bounds {
                Some((start, end)) if start > end => part.to_string(),
                Some((start, end)) if step.is_none() && end < 7 => {
                    if start == end {
                        DAY_NAMES[start].to_string()
                    } else {
                        format!("{}-{}", DAY_NAMES[start], DAY_NAMES[end])
                    }
                }
                // stepped ranges and ranges up to 7 are listed day by day
                Some((start, end)) => {
                    let mut days: Vec<&str> = Vec::new();
                    for day in (start..=end).step_by(step.unwrap_or(1)) {
                        let name = DAY_NAMES[day % 7];
                        if !days.contains(&name) {
                            days.push(name);
                        }
                    }
                    days.join(",")
                }
                None => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn day_number(token: &str) -> Option<usize> {
    token.parse::<usize>().ok().filter(|day| *day < DAY_NAMES.len())
}

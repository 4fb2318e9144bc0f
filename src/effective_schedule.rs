//! Keeps the persisted list of generated schedules of a Schedule in line with
//! its spec. Nothing here talks to the cluster; the caller persists the status.

use crate::randomizer::{create_seed, randomize_schedule};
use crate::types::{EffectiveSchedule, JobType, ScheduleDefinition};

/// Resolves the schedule to register for the given job type.
///
/// Standard cron expressions and plain macros are returned as they are. A random
/// macro reuses the generated schedule already persisted for it, otherwise a new
/// one is derived and recorded in `effective_schedules`. If the macro cannot be
/// randomized the original is used.
pub fn effective_schedule(
    namespace: &str,
    name: &str,
    job_type: JobType,
    original: &ScheduleDefinition,
    effective_schedules: &mut Vec<EffectiveSchedule>,
) -> ScheduleDefinition {
    if !original.is_random() {
        return original.clone();
    }

    if let Some(existing) = effective_schedules.iter().find(|effective| {
        effective.job_type == job_type
            && &effective.original_schedule == original
            && !effective.generated_schedule.is_empty()
    }) {
        tracing::debug!(
            %job_type,
            schedule = %existing.generated_schedule,
            "using generated schedule"
        );
        return existing.generated_schedule.clone();
    }

    let seed = create_seed(namespace, name, job_type);
    match randomize_schedule(&seed, original) {
        Ok(generated) => {
            tracing::debug!(%seed, from_schedule = %original, effective_schedule = %generated, "randomized schedule");
            set_effective_schedule(effective_schedules, job_type, generated.clone(), original);
            generated
        }
        Err(error) => {
            tracing::info!(schedule = %original, %error, "could not randomize schedule, continuing with original schedule");
            original.clone()
        }
    }
}

/// Upserts the entry of the given job type.
pub fn set_effective_schedule(
    effective_schedules: &mut Vec<EffectiveSchedule>,
    job_type: JobType,
    generated: ScheduleDefinition,
    original: &ScheduleDefinition,
) {
    match effective_schedules
        .iter_mut()
        .find(|effective| effective.job_type == job_type)
    {
        Some(existing) => {
            existing.generated_schedule = generated;
            existing.original_schedule = original.clone();
        }
        None => effective_schedules.push(EffectiveSchedule {
            job_type,
            generated_schedule: generated,
            original_schedule: original.clone(),
        }),
    }
}

/// Drops the entry of the given job type unless its new schedule is still random.
/// An empty schedule means the job type is no longer declared.
pub fn cleanup_effective_schedules(
    effective_schedules: &mut Vec<EffectiveSchedule>,
    job_type: JobType,
    new_schedule: &ScheduleDefinition,
) {
    effective_schedules.retain(|effective| {
        let keep = effective.job_type != job_type || new_schedule.is_random();
        if !keep {
            tracing::debug!(%job_type, "removing from effective schedules");
        }
        keep
    });
}

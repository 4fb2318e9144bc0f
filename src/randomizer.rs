//! Resolves the `@<period>-random` macros into concrete cron expressions.
//!
//! The fields are derived from the SHA-1 of a seed built from the owner and the
//! job type, so every owner gets its own stable slot that survives restarts.

use sha1::{Digest, Sha1};

use crate::error::Error;
use crate::types::{JobType, ScheduleDefinition};

pub const SCHEDULE_HOURLY_RANDOM: &str = "@hourly-random";
pub const SCHEDULE_DAILY_RANDOM: &str = "@daily-random";
pub const SCHEDULE_WEEKLY_RANDOM: &str = "@weekly-random";
pub const SCHEDULE_MONTHLY_RANDOM: &str = "@monthly-random";
pub const SCHEDULE_YEARLY_RANDOM: &str = "@yearly-random";
pub const SCHEDULE_ANNUALLY_RANDOM: &str = "@annually-random";

/// `<namespace>/<name>@<jobType>`
pub fn create_seed(namespace: &str, name: &str, job_type: JobType) -> String {
    format!("{}/{}@{}", namespace, name, job_type)
}

/// Maps a random macro to a concrete cron expression. Anything that is not a
/// random macro is returned unchanged.
pub fn randomize_schedule(
    seed: &str,
    schedule: &ScheduleDefinition,
) -> Result<ScheduleDefinition, Error> {
    if !schedule.is_random() {
        return Ok(schedule.clone());
    }

    let checksum = Sha1::digest(seed.as_bytes());
    let minute = remainder(&checksum, 60, 0);
    let hour = remainder(&checksum, 24, 0);
    // capped at 27 so the expression fires in February too
    let day_of_month = remainder(&checksum, 27, 1);
    let month = remainder(&checksum, 12, 1);
    let weekday = remainder(&checksum, 6, 0);

    let generated = match schedule.as_str() {
        SCHEDULE_HOURLY_RANDOM => format!("{} * * * *", minute),
        SCHEDULE_DAILY_RANDOM => format!("{} {} * * *", minute, hour),
        SCHEDULE_WEEKLY_RANDOM => format!("{} {} * * {}", minute, hour, weekday),
        SCHEDULE_MONTHLY_RANDOM => format!("{} {} {} * *", minute, hour, day_of_month),
        SCHEDULE_YEARLY_RANDOM | SCHEDULE_ANNUALLY_RANDOM => {
            format!("{} {} {} {} *", minute, hour, day_of_month, month)
        }
        other => return Err(Error::UnrecognizedRandomSchedule(other.to_string())),
    };
    Ok(ScheduleDefinition(generated))
}

/// Remainder of the big-endian integer `bytes` divided by `divisor`, plus `offset`.
fn remainder(bytes: &[u8], divisor: u64, offset: u64) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, byte| (acc * 256 + u64::from(*byte)) % divisor)
        + offset
}

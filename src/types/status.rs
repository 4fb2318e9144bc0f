//! Status conditions shared by every job-like object and the lifecycle predicates
//! derived from them.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// The resource has completed its main function.
    Completed,
    /// All preconditions are met.
    Ready,
    /// Outdated resources of the same kind were cleaned up.
    Scrubbed,
    /// The resource is doing its main function.
    Progressing,
    /// The pre-backup workloads were created and are ready.
    PreBackupPodReady,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Completed => "Completed",
            ConditionType::Ready => "Ready",
            ConditionType::Scrubbed => "Scrubbed",
            ConditionType::Progressing => "Progressing",
            ConditionType::PreBackupPodReady => "PreBackupPodReady",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionReason {
    Ready,
    Started,
    Finished,
    Succeeded,
    Failed,
    CreationFailed,
    UpdateFailed,
    DeletionFailed,
    RetrievalFailed,
    NoPreBackupPodsFound,
    Waiting,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::Ready => "Ready",
            ConditionReason::Started => "Started",
            ConditionReason::Finished => "Finished",
            ConditionReason::Succeeded => "Succeeded",
            ConditionReason::Failed => "Failed",
            ConditionReason::CreationFailed => "CreationFailed",
            ConditionReason::UpdateFailed => "UpdateFailed",
            ConditionReason::DeletionFailed => "DeletionFailed",
            ConditionReason::RetrievalFailed => "RetrievalFailed",
            ConditionReason::NoPreBackupPodsFound => "NoPreBackupPodsFound",
            ConditionReason::Waiting => "Waiting",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Status defines the observed state of a job object. It is what the operator
/// looks at to decide what to do next.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub exclusive: bool,

    /// Standard conditions for higher-level status reporting.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Status {
    /// True if pre-backup work failed, or `Completed` is true with any reason but `Succeeded`.
    pub fn has_failed(&self) -> bool {
        if self.has_failed_pre_backup() {
            return true;
        }
        match find_status_condition(&self.conditions, ConditionType::Completed) {
            Some(completed) if !match_any_reason(completed, &[ConditionReason::Succeeded]) => {
                completed.status == ConditionStatus::True.as_str()
            }
            _ => false,
        }
    }

    /// True if `Completed` is true with reason `Succeeded` and pre-backup work did not fail.
    pub fn has_succeeded(&self) -> bool {
        if self.has_failed_pre_backup() {
            return false;
        }
        match find_status_condition(&self.conditions, ConditionType::Completed) {
            Some(completed) if match_any_reason(completed, &[ConditionReason::Succeeded]) => {
                completed.status == ConditionStatus::True.as_str()
            }
            _ => false,
        }
    }

    pub fn has_finished(&self) -> bool {
        self.has_failed() || self.has_succeeded()
    }

    /// True if `PreBackupPodReady` is false with a reason other than the non-terminal ones.
    pub fn has_failed_pre_backup(&self) -> bool {
        match find_status_condition(&self.conditions, ConditionType::PreBackupPodReady) {
            Some(condition) if is_pre_backup_failed(condition) => {
                condition.status == ConditionStatus::False.as_str()
            }
            _ => false,
        }
    }

    pub fn has_started(&self) -> bool {
        match find_status_condition(&self.conditions, ConditionType::Progressing) {
            Some(condition) if match_any_reason(condition, &[ConditionReason::Started]) => {
                condition.status == ConditionStatus::True.as_str()
            }
            _ => false,
        }
    }

    pub fn is_waiting_for_pre_backup(&self) -> bool {
        match find_status_condition(&self.conditions, ConditionType::PreBackupPodReady) {
            Some(condition) if match_any_reason(condition, &[ConditionReason::Waiting]) => {
                condition.status == ConditionStatus::Unknown.as_str()
            }
            _ => false,
        }
    }

    /// Marks `Ready` and `Progressing` as true. The message goes to `Ready`.
    pub fn set_started(&mut self, message: impl Into<String>) {
        self.started = true;
        set_status_condition(
            &mut self.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            ConditionReason::Ready,
            message,
        );
        set_status_condition(
            &mut self.conditions,
            ConditionType::Progressing,
            ConditionStatus::True,
            ConditionReason::Started,
            "The job is progressing",
        );
    }

    /// Marks `Progressing` as false and drops `Ready`.
    pub fn set_finished(&mut self, message: impl Into<String>) {
        self.finished = true;
        set_status_condition(
            &mut self.conditions,
            ConditionType::Progressing,
            ConditionStatus::False,
            ConditionReason::Finished,
            message,
        );
        remove_status_condition(&mut self.conditions, ConditionType::Ready);
    }

    pub fn set_failed(&mut self, message: impl Into<String>) {
        set_status_condition(
            &mut self.conditions,
            ConditionType::Completed,
            ConditionStatus::True,
            ConditionReason::Failed,
            message,
        );
    }

    pub fn set_succeeded(&mut self, message: impl Into<String>) {
        set_status_condition(
            &mut self.conditions,
            ConditionType::Completed,
            ConditionStatus::True,
            ConditionReason::Succeeded,
            message,
        );
    }

    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        reason: ConditionReason,
        status: ConditionStatus,
        message: impl Into<String>,
    ) {
        set_status_condition(&mut self.conditions, type_, status, reason, message);
    }
}

pub fn find_status_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == type_.as_str())
}

/// Upserts the condition of the given type. The transition time only moves when
/// the status value changes.
pub fn set_status_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
) {
    let message = message.into();
    match conditions
        .iter_mut()
        .find(|condition| condition.type_ == type_.as_str())
    {
        Some(existing) => {
            if existing.status != status.as_str() {
                existing.status = status.as_str().to_string();
                existing.last_transition_time = Time(Utc::now());
            }
            existing.reason = reason.as_str().to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.as_str().to_string(),
            status: status.as_str().to_string(),
            reason: reason.as_str().to_string(),
            message,
            last_transition_time: Time(Utc::now()),
            observed_generation: None,
        }),
    }
}

pub fn remove_status_condition(conditions: &mut Vec<Condition>, type_: ConditionType) {
    conditions.retain(|condition| condition.type_ != type_.as_str());
}

fn is_pre_backup_failed(condition: &Condition) -> bool {
    !match_any_reason(
        condition,
        &[
            ConditionReason::Succeeded,
            ConditionReason::Waiting,
            ConditionReason::NoPreBackupPodsFound,
            ConditionReason::Ready,
        ],
    )
}

fn match_any_reason(condition: &Condition, reasons: &[ConditionReason]) -> bool {
    reasons
        .iter()
        .any(|reason| condition.reason == reason.as_str())
}

//! Status conditions, keyed by type.
//!
//! `Ready` always sorts first, the rest alphabetically. Setting a condition
//! replaces the previous one of the same type; the transition time only
//! moves when the status changes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Overall readiness; gates downstream bootstrap.
pub const READY: &str = "Ready";
/// Rescue system booted and reachable.
pub const RESCUE_SYSTEM_READY: &str = "RescueSystemReady";
/// Hardware inventory collected.
pub const HARDWARE_INSPECTED: &str = "HardwareInspected";
/// Install pipeline finished.
pub const IMAGE_INSTALLED: &str = "ImageInstalled";
/// Installed OS answers on SSH.
pub const HOST_REACHABLE: &str = "HostReachable";
/// Referenced secrets resolved.
pub const CREDENTIALS_AVAILABLE: &str = "CredentialsAvailable";
/// The machine in `consumerRef` holds no other host. Only set while false.
pub const CLAIM_ACCEPTED: &str = "ClaimAccepted";

/// Condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Severity of a non-true condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// A `True` condition.
    #[must_use]
    pub fn new_true(condition_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: now,
        }
    }

    /// A `False` condition with reason and message.
    #[must_use]
    pub fn new_false(
        condition_type: &str,
        reason: &str,
        severity: Severity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: now,
        }
    }
}

/// Ordered conditions, at most one per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// Condition of the given type.
    #[must_use]
    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    /// Whether the condition exists and is `True`.
    #[must_use]
    pub fn is_true(&self, condition_type: &str) -> bool {
        self.get(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Insert or replace a condition.
    pub fn set(&mut self, mut condition: Condition) {
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.0.push(condition);
        }
        self.0.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    }

    /// Mark a condition `True`.
    pub fn mark_true(&mut self, condition_type: &str, now: DateTime<Utc>) {
        self.set(Condition::new_true(condition_type, now));
    }

    /// Mark a condition `False`.
    pub fn mark_false(
        &mut self,
        condition_type: &str,
        reason: &str,
        severity: Severity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.set(Condition::new_false(condition_type, reason, severity, message, now));
    }

    /// Drop a condition.
    pub fn remove(&mut self, condition_type: &str) {
        self.0.retain(|c| c.condition_type != condition_type);
    }

    /// Keep only the listed condition types.
    pub fn retain_types(&mut self, keep: &[&str]) {
        self.0.retain(|c| keep.contains(&c.condition_type.as_str()));
    }

    /// Conditions in order.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn sort_key(condition: &Condition) -> (bool, &str) {
    (condition.condition_type != READY, condition.condition_type.as_str())
}

//! Wire commands carried on the bus.
//!
//! Commands are JSON with camelCase field names. They are transient: nothing
//! persists them beyond the bus.

use serde::{Deserialize, Serialize};

/// "Run job X", produced by the publisher and consumed by the trigger dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCommand {
    pub job: String,
    /// Unix seconds at which the trigger was issued; 0 when the sender omits it.
    #[serde(default)]
    pub trigger_time: i64,
}

impl TriggerCommand {
    pub fn new(job: impl Into<String>, trigger_time: i64) -> Self {
        Self {
            job: job.into(),
            trigger_time,
        }
    }

    /// A trigger stamped with the current wall-clock time.
    pub fn now(job: impl Into<String>) -> Self {
        Self::new(job, chrono::Utc::now().timestamp())
    }
}

/// A unit of bulk work fanned out by the built-in jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoTaskCommand {
    pub name: String,
    #[serde(default)]
    pub trigger_time: i64,
}

impl DoTaskCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger_time: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoSmallTaskCommand {
    pub name: String,
    #[serde(default)]
    pub trigger_time: i64,
}

impl DoSmallTaskCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger_time: 0,
        }
    }
}

//! Static topic catalog.
//!
//! Every topic the service publishes to or subscribes on is declared here;
//! startup ensures all of [`Topic::ALL`] exist.

/// Bus topics, independent of deployment environment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Trigger commands consumed by the trigger dispatcher.
    Trigger,
    /// Bulk work fanned out by the built-in jobs.
    DoTask,
    DoSmallTask,
    /// Payloads that exhausted their delivery attempts elsewhere.
    DeadLetter,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Trigger, Topic::DoTask, Topic::DoSmallTask, Topic::DeadLetter];

    pub fn slug(self) -> &'static str {
        match self {
            Topic::Trigger => "trigger-job",
            Topic::DoTask => "do-task",
            Topic::DoSmallTask => "do-small-task-send",
            Topic::DeadLetter => "deadletter",
        }
    }

    /// Bus-level topic name, scoped by deployment environment (e.g. `uat-trigger-job`).
    pub fn name(self, deploy_env: &str) -> String {
        format!("{deploy_env}-{}", self.slug())
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Subscription id for `app_id` on a bus-level topic name.
pub fn subscription_id(topic_name: &str, app_id: &str) -> String {
    format!("{topic_name}.sub.{app_id}")
}

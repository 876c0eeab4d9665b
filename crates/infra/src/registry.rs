//! Job registry: name → handler.
//!
//! The registry is built once during startup and is read-only afterwards, so
//! lookups from any number of dispatcher threads need no locking.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use jobrelay_core::Context;

/// A registered job. Handlers get the dispatch context and report failure
/// with any error type.
pub type JobHandler = Arc<dyn Fn(&Context) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job: {0}")]
pub struct UnknownJob(pub String);

/// Immutable job table.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobHandler>,
}

impl core::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<JobHandler, UnknownJob> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownJob(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Default)]
pub struct JobRegistryBuilder {
    jobs: HashMap<String, JobHandler>,
}

impl JobRegistryBuilder {
    /// Register `handler` under `name`. A later registration of the same name
    /// replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.jobs.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(job = %name, "job registered twice; keeping the latest handler");
        }
        self
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry { jobs: self.jobs }
    }
}

/// Process-wide, initialise-once slot for the registry.
///
/// Concurrent or repeated `initialize` calls run the setup closure at most
/// once; every caller gets the same registry.
#[derive(Debug, Default)]
pub struct RegistryCell {
    cell: OnceLock<Arc<JobRegistry>>,
}

impl RegistryCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    pub fn initialize<F>(&self, setup: F) -> Arc<JobRegistry>
    where
        F: FnOnce(&mut JobRegistryBuilder),
    {
        self.cell
            .get_or_init(|| {
                let mut builder = JobRegistry::builder();
                setup(&mut builder);
                let registry = builder.build();
                info!(jobs = ?registry.names(), "job registry initialised");
                Arc::new(registry)
            })
            .clone()
    }

    pub fn get(&self) -> Option<Arc<JobRegistry>> {
        self.cell.get().cloned()
    }
}

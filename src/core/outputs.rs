//! CF-006: Stack output bindings and collection.
//!
//! Every output a template declares may carry a collector that writes the
//! live value back onto the cluster config. Bindings live in a side table
//! owned by the Resource Set that declared them and travel with the
//! rendered stack; they are never serialized and never global.
//!
//! Collection is a single pass: `Declared` (bindings registered at build
//! time) → `Read` (live outputs fetched, required ones checked) →
//! `Collected`. A missing required output fails the read step before any
//! collector runs; it is never retried.

use crate::core::types::ClusterConfig;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Callback that stores an output value onto the config.
pub type Collector = Box<dyn FnOnce(&str, &mut ClusterConfig) -> Result<()> + Send + Sync>;

/// One declared output and what to do with its value.
pub struct OutputBinding {
    pub name: String,
    /// Absent required outputs fail collection; absent optional ones are skipped
    pub required: bool,
    collector: Collector,
}

impl OutputBinding {
    pub fn new(name: impl Into<String>, required: bool, collector: Collector) -> Self {
        Self {
            name: name.into(),
            required,
            collector,
        }
    }
}

impl fmt::Debug for OutputBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBinding")
            .field("name", &self.name)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Side table of collectors for one stack, keyed by output name.
#[derive(Debug, Default)]
pub struct OutputCollectors {
    bindings: BTreeMap<String, OutputBinding>,
}

/// Outcome of a collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub collected: Vec<String>,
    pub skipped: Vec<String>,
}

/// Live outputs checked against the declared bindings; ready to collect.
#[derive(Debug)]
pub struct ReadOutputs {
    stack: String,
    bindings: BTreeMap<String, OutputBinding>,
    live: BTreeMap<String, String>,
}

impl OutputCollectors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. Output names are unique per stack.
    pub fn insert(&mut self, binding: OutputBinding) -> Result<()> {
        if self.bindings.contains_key(&binding.name) {
            return Err(Error::DuplicateOutput { name: binding.name });
        }
        self.bindings.insert(binding.name.clone(), binding);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Declared → Read. Fails with the first missing required output (by name).
    pub fn read(self, stack: &str, live: &BTreeMap<String, String>) -> Result<ReadOutputs> {
        if let Some(missing) = self
            .bindings
            .values()
            .find(|b| b.required && !live.contains_key(&b.name))
        {
            return Err(Error::MissingOutput {
                stack: stack.to_string(),
                output: missing.name.clone(),
            });
        }
        Ok(ReadOutputs {
            stack: stack.to_string(),
            bindings: self.bindings,
            live: live.clone(),
        })
    }

    /// Read and collect in one call.
    pub fn collect(
        self,
        stack: &str,
        live: &BTreeMap<String, String>,
        config: &mut ClusterConfig,
    ) -> Result<CollectReport> {
        self.read(stack, live)?.collect(config)
    }
}

impl ReadOutputs {
    /// Read → Collected. Collectors run one after another in output-name order.
    pub fn collect(self, config: &mut ClusterConfig) -> Result<CollectReport> {
        let mut report = CollectReport::default();
        for (name, binding) in self.bindings {
            match self.live.get(&name) {
                Some(value) => {
                    debug!(stack = %self.stack, output = %name, "collecting output");
                    (binding.collector)(value, config)?;
                    report.collected.push(name);
                }
                None => report.skipped.push(name),
            }
        }
        Ok(report)
    }

    /// Collect into a config shared between concurrent tasks. The lock is held
    /// for the whole pass so collectors never run concurrently.
    pub async fn collect_shared(
        self,
        config: &tokio::sync::Mutex<ClusterConfig>,
    ) -> Result<CollectReport> {
        let mut guard = config.lock().await;
        self.collect(&mut guard)
    }
}

/// Split a comma-joined list output. An empty value is an empty list.
pub fn split_joined(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(',').map(str::to_string).collect()
}

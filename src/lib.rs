//! Clusterforge compiles a declarative Kubernetes cluster config into
//! CloudFormation stacks and drives them to completion.
//!
//! Templates are built by domain builders on a `ResourceSet`, rendered once
//! and hashed with BLAKE3. Stack outputs flow back into the config through
//! collectors, and a task tree deploys the cluster, its access entries and
//! its node pools in dependency order.

pub mod builder;
pub mod cli;
pub mod core;
pub mod error;
pub mod placement;
pub mod provider;
pub mod stack;
pub mod tasks;

pub use error::{Error, Result};

//! # dockform
//!
//! A declarative reconciliation engine for container workloads managed by an
//! external Docker-compatible daemon.
//!
//! The engine consumes a manifest-shaped [`Config`] enumerating contexts
//! (daemon endpoints), stacks (compose projects), filesets
//! (content-addressed directories synchronized into named volumes), and
//! top-level resources. It computes a diff between desired and observed
//! state and either reports it ([`Engine::plan`]) or drives the daemon to
//! converge ([`Engine::apply`]). Managed-but-undesired resources can be
//! removed selectively ([`Engine::prune`]) or wholesale
//! ([`Engine::destroy`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dockform::{Config, Engine};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dockform::Error> {
//!     let config: Config = serde_json::from_str(r#"{
//!         "identifier": "myapp",
//!         "contexts": {"default": {}},
//!         "stacks": {"default/web": {"root": "/srv/web"}}
//!     }"#).map_err(|e| dockform::Error::invalid_input("manifest", e.to_string()))?;
//!
//!     let engine = Engine::builder(config).build()?;
//!     let cancel = CancellationToken::new();
//!
//!     let plan = engine.plan(&cancel).await?;
//!     println!("{}", plan.resources.render());
//!     if plan.summary().changes() > 0 {
//!         engine.apply(&plan, &cancel).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - builder-constructed entry point for plan/apply/prune/destroy
//! - [`planner`] / [`applier`] - the two phases of a reconciliation cycle
//! - [`detector`] - per-stack service state classification
//! - [`fileset`] - diff-based volume content synchronization
//! - [`index`] - content-addressed directory snapshots and diffs
//! - [`client`] - the daemon contract; [`cli`] implements it over the CLI
//! - [`orchestrator`] - per-context fan-out with cancellation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub use client::{
    ComposeConfigDoc, ComposeContainer, ComposeInvocation, DaemonClient, NetworkOpts, PsEntry,
    ScriptOutput,
};
pub use config::{
    ApplyMode, Config, ContextConfig, Fileset, Ownership, RestartServices, SopsConfig, Stack,
    IDENTIFIER_LABEL,
};
pub use detector::{ServiceInfo, ServiceState};
pub use engine::{ClientFactory, Engine, EngineBuilder};
pub use error::{AggregateError, Error, ErrorKind, Result};
pub use index::{FileEntry, Index, IndexDiff, INDEX_FILE_NAME};
pub use plan::{
    Action, ExecutionContext, FilesetCacheEntry, Plan, PlanSummary, ResourceEntry, ResourcePlan,
    StackCacheEntry,
};
pub use report::{Reporter, TracingReporter};

pub mod applier;
pub mod cli;
pub mod client;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fileset;
pub mod index;
pub mod orchestrator;
pub mod ownership;
pub mod plan;
pub mod planner;
pub mod prune;
pub mod report;
pub mod resources;
pub mod secrets;

/// The version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_label_constant() {
        assert_eq!(IDENTIFIER_LABEL, "io.dockform.identifier");
    }
}

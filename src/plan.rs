//! Plan structure: what a reconciliation intends to do, plus the execution
//! cache that lets apply reuse the daemon observations made during planning.
//!
//! Resource entries live in ordered maps keyed by fully-qualified names
//! (context-prefixed), so rendering a plan is a straight iteration and two
//! plans built from the same inputs render identically.

use std::collections::BTreeMap;

use crate::detector::ServiceInfo;
use crate::index::{Index, IndexDiff};

/// What the plan intends to do with one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Resource is desired but absent
    Create,
    /// Resource exists but its configuration drifted
    Update,
    /// Resource exists but is no longer desired
    Delete,
    /// Resource exists but is not attributable to this engine instance
    Reconcile,
    /// Resource is converged
    Noop,
}

impl Action {
    /// Lowercase verb used in rendered plans.
    #[must_use]
    pub fn verb(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Reconcile => "reconcile",
            Self::Noop => "noop",
        }
    }
}

/// One planned resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Intended action
    pub action: Action,
    /// Short human-readable qualifier, e.g. `exists` or `config drift`
    pub detail: String,
}

impl ResourceEntry {
    /// Entry with an action and a qualifier.
    #[must_use]
    pub fn new(action: Action, detail: impl Into<String>) -> Self {
        Self {
            action,
            detail: detail.into(),
        }
    }
}

/// Planned resources grouped by kind, keyed by context-prefixed names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePlan {
    /// Volumes keyed `<context>/<volume>`
    pub volumes: BTreeMap<String, ResourceEntry>,
    /// Networks keyed `<context>/<network>`
    pub networks: BTreeMap<String, ResourceEntry>,
    /// Services keyed `<context>/<stack>/<service>`
    pub services: BTreeMap<String, ResourceEntry>,
    /// Fileset files keyed `<context>/<fileset>/<path>`
    pub files: BTreeMap<String, ResourceEntry>,
    /// Orphan containers keyed `<context>/<project>/<container>`
    pub containers: BTreeMap<String, ResourceEntry>,
}

impl ResourcePlan {
    /// Merge another plan into this one. Keys are context-prefixed and
    /// therefore disjoint across contexts.
    pub fn merge(&mut self, other: ResourcePlan) {
        self.volumes.extend(other.volumes);
        self.networks.extend(other.networks);
        self.services.extend(other.services);
        self.files.extend(other.files);
        self.containers.extend(other.containers);
    }

    /// Canonical text rendering, one line per resource, sorted within each
    /// kind. Byte-identical for equal plans.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (kind, entries) in [
            ("volume", &self.volumes),
            ("network", &self.networks),
            ("service", &self.services),
            ("fileset", &self.files),
            ("container", &self.containers),
        ] {
            for (name, entry) in entries {
                out.push_str(entry.action.verb());
                out.push(' ');
                out.push_str(kind);
                out.push(' ');
                out.push_str(name);
                if !entry.detail.is_empty() {
                    out.push_str(" (");
                    out.push_str(&entry.detail);
                    out.push(')');
                }
                out.push('\n');
            }
        }
        out
    }

    fn entries(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.volumes
            .values()
            .chain(self.networks.values())
            .chain(self.services.values())
            .chain(self.files.values())
            .chain(self.containers.values())
    }
}

/// Per-action counts over a whole plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Resources to create
    pub create: usize,
    /// Resources to update
    pub update: usize,
    /// Resources to delete
    pub delete: usize,
    /// Resources to reconcile
    pub reconcile: usize,
    /// Converged resources
    pub noop: usize,
}

impl PlanSummary {
    /// Total number of changing resources (everything except noops).
    #[must_use]
    pub fn changes(&self) -> usize {
        self.create + self.update + self.delete + self.reconcile
    }
}

/// Cached observations for one stack.
#[derive(Debug, Clone, Default)]
pub struct StackCacheEntry {
    /// Detected service states in planned order
    pub services: Vec<ServiceInfo>,
    /// Resolved inline environment, secrets included
    pub inline_env: Vec<String>,
    /// Whether any service needs a compose up
    pub needs_apply: bool,
}

/// Cached observations for one fileset.
#[derive(Debug, Clone, Default)]
pub struct FilesetCacheEntry {
    /// Local content-addressed snapshot
    pub local_index: Index,
    /// Remote snapshot as read from the volume (empty when absent)
    pub remote_index: Index,
    /// Work needed to converge remote to local
    pub diff: IndexDiff,
}

/// Cached observations for one context.
#[derive(Debug, Clone, Default)]
pub struct ContextCache {
    /// Managed volumes present at plan time
    pub existing_volumes: Vec<String>,
    /// Managed networks present at plan time
    pub existing_networks: Vec<String>,
    /// Per-stack caches keyed by stack key
    pub stacks: BTreeMap<String, StackCacheEntry>,
    /// Per-fileset caches keyed by fileset name
    pub filesets: BTreeMap<String, FilesetCacheEntry>,
}

/// Observations carried from plan to apply, per context.
///
/// Created during planning, consumed by one apply, discarded afterwards.
/// Not safe for concurrent mutation once planning completes.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Per-context caches keyed by context name
    pub contexts: BTreeMap<String, ContextCache>,
}

/// A reconciliation plan together with its execution cache.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Planned resources
    pub resources: ResourcePlan,
    /// Observations reusable by apply
    pub execution: ExecutionContext,
}

impl Plan {
    /// Per-action counts.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in self.resources.entries() {
            match entry.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Delete => summary.delete += 1,
                Action::Reconcile => summary.reconcile += 1,
                Action::Noop => summary.noop += 1,
            }
        }
        summary
    }
}

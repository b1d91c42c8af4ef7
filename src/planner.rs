//! Per-context plan assembly.
//!
//! Existing volumes and networks are listed concurrently, then stacks and
//! filesets are examined in parallel. Parallel results come back in input
//! order (slot-indexed, never completion-ordered), so the same inputs always
//! produce the same plan.

use futures::future::join_all;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::client::{ComposeInvocation, DaemonClient};
use crate::config::Config;
use crate::detector::{self, ServiceState};
use crate::error::Result;
use crate::fileset::read_remote_index;
use crate::index::{build_local_index, diff_indexes, Index};
use crate::plan::{
    Action, ContextCache, FilesetCacheEntry, ResourceEntry, ResourcePlan, StackCacheEntry,
};
use crate::secrets;

/// Detail string used for stacks whose services could not be enumerated.
pub const PLANNED_TBD: &str = "planned (TBD)";

/// Build the plan slice and execution cache for one context.
pub async fn plan_context(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
) -> Result<(ResourcePlan, ContextCache)> {
    let mut plan = ResourcePlan::default();
    let mut cache = ContextCache::default();

    let (existing_volumes, existing_networks) =
        futures::try_join!(client.list_volumes(), client.list_networks())?;
    cache.existing_volumes = existing_volumes.clone();
    cache.existing_networks = existing_networks.clone();

    plan_volumes(&mut plan, cfg, context, &existing_volumes);
    plan_networks(&mut plan, cfg, context, &existing_networks);

    let (stack_results, fileset_results) = tokio::join!(
        examine_stacks(client, cfg, context),
        examine_filesets(client, cfg, context, &existing_volumes),
    );

    let mut desired_services: BTreeSet<String> = BTreeSet::new();
    let mut unknown_projects: BTreeSet<String> = BTreeSet::new();
    for outcome in stack_results {
        let outcome = outcome?;
        match outcome {
            StackOutcome::Detected { key, entry } => {
                if entry.services.is_empty() {
                    plan.services
                        .insert(key.clone(), ResourceEntry::new(Action::Noop, PLANNED_TBD));
                } else {
                    for info in &entry.services {
                        desired_services.insert(info.name.clone());
                        let (action, detail) = match info.state {
                            ServiceState::Missing => (Action::Create, "missing"),
                            ServiceState::Drifted => (Action::Update, "config drift"),
                            ServiceState::IdentifierMismatch => {
                                (Action::Reconcile, "identifier mismatch")
                            }
                            ServiceState::Running => (Action::Noop, "up-to-date"),
                        };
                        plan.services.insert(
                            format!("{key}/{}", info.name),
                            ResourceEntry::new(action, detail),
                        );
                    }
                }
                cache.stacks.insert(key, entry);
            }
            StackOutcome::Undetectable { key, project } => {
                // No cache entry: the applier re-detects and propagates
                // whatever the daemon reports then. The project's containers
                // are excluded from orphan classification below.
                plan.services
                    .insert(key, ResourceEntry::new(Action::Noop, PLANNED_TBD));
                unknown_projects.insert(project);
            }
        }
    }

    plan_orphans(&mut plan, client, context, &desired_services, &unknown_projects).await;

    for outcome in fileset_results {
        let (name, entry) = outcome?;
        if entry.diff.is_empty() {
            plan.files.insert(
                format!("{context}/{name}"),
                ResourceEntry::new(Action::Noop, "no file changes"),
            );
        } else {
            for file in &entry.diff.to_create {
                plan.files.insert(
                    format!("{context}/{name}/{}", file.path),
                    ResourceEntry::new(Action::Create, ""),
                );
            }
            for file in &entry.diff.to_update {
                plan.files.insert(
                    format!("{context}/{name}/{}", file.path),
                    ResourceEntry::new(Action::Update, "content changed"),
                );
            }
            for path in &entry.diff.to_delete {
                plan.files.insert(
                    format!("{context}/{name}/{path}"),
                    ResourceEntry::new(Action::Delete, "removed locally"),
                );
            }
        }
        cache.filesets.insert(name, entry);
    }

    Ok((plan, cache))
}

fn plan_volumes(plan: &mut ResourcePlan, cfg: &Config, context: &str, existing: &[String]) {
    let desired = cfg.desired_volumes_for_context(context);
    for name in &desired {
        let entry = if existing.contains(name) {
            ResourceEntry::new(Action::Noop, "exists")
        } else {
            ResourceEntry::new(Action::Create, "")
        };
        plan.volumes.insert(format!("{context}/{name}"), entry);
    }
    for name in existing {
        if !desired.contains(name) {
            plan.volumes.insert(
                format!("{context}/{name}"),
                ResourceEntry::new(Action::Delete, "unmanaged by manifest"),
            );
        }
    }
}

fn plan_networks(plan: &mut ResourcePlan, cfg: &Config, context: &str, existing: &[String]) {
    let desired: Vec<&String> = cfg
        .contexts
        .get(context)
        .map(|c| c.networks.iter().collect())
        .unwrap_or_default();
    for name in &desired {
        let entry = if existing.contains(name) {
            ResourceEntry::new(Action::Noop, "exists")
        } else {
            ResourceEntry::new(Action::Noop, "compose-managed")
        };
        plan.networks.insert(format!("{context}/{name}"), entry);
    }
    for name in existing {
        if !desired.iter().any(|d| *d == name) {
            plan.networks.insert(
                format!("{context}/{name}"),
                ResourceEntry::new(Action::Delete, "unmanaged by manifest"),
            );
        }
    }
}

enum StackOutcome {
    Detected {
        key: String,
        entry: StackCacheEntry,
    },
    Undetectable {
        key: String,
        project: String,
    },
}

/// Examine every stack of the context in parallel, results in input order.
async fn examine_stacks(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
) -> Vec<Result<StackOutcome>> {
    let keys = cfg.stacks_for_context(context);
    join_all(keys.into_iter().map(|key| async move {
        let stack = &cfg.stacks[key];
        let env = secrets::inline_env(
            &stack.env_inline,
            &stack.sops_secrets,
            cfg.sops.as_ref(),
            &stack.root,
        )
        .await?;
        let invocation = ComposeInvocation::for_stack(key, stack, env.clone());

        match detector::detect_with_invocation(client, key, &invocation, &cfg.identifier).await {
            Ok(services) => {
                let needs_apply = detector::needs_apply(&services);
                Ok(StackOutcome::Detected {
                    key: key.to_string(),
                    entry: StackCacheEntry {
                        services,
                        inline_env: env,
                        needs_apply,
                    },
                })
            }
            Err(e) => {
                warn!("stack {key}: detection failed, deferring to apply: {e}");
                Ok(StackOutcome::Undetectable {
                    key: key.to_string(),
                    project: invocation.project_name.clone(),
                })
            }
        }
    }))
    .await
}

/// Examine every fileset of the context in parallel, results in input order.
///
/// The remote index is only read when the target volume already exists;
/// reading through the daemon would implicitly create the volume.
async fn examine_filesets(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
    existing_volumes: &[String],
) -> Vec<Result<(String, FilesetCacheEntry)>> {
    let names = cfg.filesets_for_context(context);
    join_all(names.into_iter().map(|name| async move {
        let fileset = &cfg.filesets[name];
        let local_index =
            build_local_index(&fileset.source_abs, &fileset.target_path, &fileset.exclude)
                .await?;
        let remote_index = if existing_volumes.contains(&fileset.target_volume) {
            read_remote_index(client, fileset).await
        } else {
            debug!(
                "fileset {name}: volume {} absent, treating remote as empty",
                fileset.target_volume
            );
            Index::empty(&fileset.target_path)
        };
        let diff = diff_indexes(&local_index, &remote_index);
        Ok((
            name.to_string(),
            FilesetCacheEntry {
                local_index,
                remote_index,
                diff,
            },
        ))
    }))
    .await
}

/// Mark managed compose containers whose service is not desired anywhere.
///
/// Containers of a project whose stack failed detection are left
/// unclassified: its service set is unknown, which must not read as "this
/// stack has no services".
async fn plan_orphans(
    plan: &mut ResourcePlan,
    client: &dyn DaemonClient,
    context: &str,
    desired_services: &BTreeSet<String>,
    unknown_projects: &BTreeSet<String>,
) {
    let containers = match client.list_compose_containers_all().await {
        Ok(containers) => containers,
        Err(e) => {
            warn!("context {context}: listing compose containers failed: {e}");
            return;
        }
    };
    for container in containers {
        if unknown_projects.contains(&container.project) {
            debug!(
                "context {context}: not classifying {}, services of project {} are unknown",
                container.name, container.project
            );
            continue;
        }
        if !desired_services.contains(&container.service) {
            plan.containers.insert(
                format!("{context}/{}/{}", container.project, container.name),
                ResourceEntry::new(Action::Delete, "orphan"),
            );
        }
    }
}

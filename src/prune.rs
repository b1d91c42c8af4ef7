//! Removal of managed-but-undesired resources (prune) and of every managed
//! resource (destroy).
//!
//! Prune compares the labeled resources of a context against the manifest's
//! desired set. Destroy never consults the desired set: everything carrying
//! the management label goes, containers first, then networks, then
//! volumes, so nothing is removed while still in use.

use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::client::DaemonClient;
use crate::config::Config;
use crate::detector;
use crate::error::{Error, Result};
use crate::plan::ContextCache;

/// Collects errors according to the strict flag: strict returns the first
/// error immediately, non-strict stores them and reports success.
struct ErrorSink {
    strict: bool,
    collected: Vec<(String, Error)>,
}

impl ErrorSink {
    fn new(strict: bool) -> Self {
        Self {
            strict,
            collected: Vec::new(),
        }
    }

    fn record(&mut self, operation: String, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            if self.strict {
                return Err(e);
            }
            self.collected.push((operation, e));
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        if !self.collected.is_empty() {
            warn!(
                "prune finished with {} suppressed error(s): {}",
                self.collected.len(),
                Error::aggregate(self.collected)
            );
        }
        Ok(())
    }
}

/// Remove the context's managed resources that the manifest no longer wants.
pub async fn prune_context(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
    cache: Option<&ContextCache>,
    strict: bool,
) -> Result<()> {
    let (desired_services, unknown_projects) =
        collect_desired_services(client, cfg, context, cache, strict).await?;
    let mut sink = ErrorSink::new(strict);

    let containers = list_or_empty(
        strict,
        context,
        "containers",
        client.list_compose_containers_all().await,
    )?;
    for container in containers {
        if desired_services.contains(&container.service) {
            continue;
        }
        if unknown_projects.contains(&container.project) {
            debug!(
                "prune {context}: leaving {} alone, services of project {} are unknown",
                container.name, container.project
            );
            continue;
        }
        info!("pruning container {} (service {})", container.name, container.service);
        let result = client.remove_container(&container.name, true).await;
        sink.record(format!("remove container {}", container.name), result)?;
    }

    let desired_volumes = cfg.desired_volumes_for_context(context);
    let volumes = list_or_empty(strict, context, "volumes", client.list_volumes().await)?;
    for volume in volumes {
        if desired_volumes.contains(&volume) {
            continue;
        }
        info!("pruning volume {volume}");
        let result = client.remove_volume(&volume).await;
        sink.record(format!("remove volume {volume}"), result)?;
    }

    let desired_networks: BTreeSet<&str> = cfg
        .contexts
        .get(context)
        .map(|c| c.networks.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let networks = list_or_empty(strict, context, "networks", client.list_networks().await)?;
    for network in networks {
        if desired_networks.contains(network.as_str()) {
            continue;
        }
        info!("pruning network {network}");
        let result = client.remove_network(&network).await;
        sink.record(format!("remove network {network}"), result)?;
    }

    sink.finish()
}

/// Listing failures follow the strict flag too: strict propagates, non-strict
/// warns and skips the whole category (an empty list prunes nothing).
fn list_or_empty<T>(
    strict: bool,
    context: &str,
    what: &str,
    result: Result<Vec<T>>,
) -> Result<Vec<T>> {
    match result {
        Ok(items) => Ok(items),
        Err(e) if strict => Err(e),
        Err(e) => {
            warn!("prune {context}: listing {what} failed, skipping: {e}");
            Ok(Vec::new())
        }
    }
}

/// The union of planned service names across the context's stacks, plus the
/// project names of stacks whose services could not be determined.
///
/// Reuses the execution cache when one is available; otherwise runs the
/// detector per stack. A stack that fails detection under non-strict prune
/// contributes no desired services, but its project is reported as unknown so
/// the caller leaves that project's containers untouched; "unknown" must not
/// read as "this stack has no services".
async fn collect_desired_services(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
    cache: Option<&ContextCache>,
    strict: bool,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut desired = BTreeSet::new();
    let mut unknown_projects = BTreeSet::new();
    for key in cfg.stacks_for_context(context) {
        if let Some(entry) = cache.and_then(|c| c.stacks.get(key)) {
            desired.extend(entry.services.iter().map(|s| s.name.clone()));
            continue;
        }
        let stack = &cfg.stacks[key];
        match detector::detect_all_services_state(
            client,
            key,
            stack,
            &cfg.identifier,
            cfg.sops.as_ref(),
        )
        .await
        {
            Ok(services) => desired.extend(services.into_iter().map(|s| s.name)),
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(
                    "prune {context}: detecting services of {key} failed, leaving its containers untouched: {e}"
                );
                unknown_projects.insert(stack.project_name(key).to_string());
            }
        }
    }
    Ok((desired, unknown_projects))
}

/// Remove every managed resource of the context, desired or not.
///
/// Tolerant to daemon reachability problems: a failed listing reads as
/// empty, each removal is best-effort, and an empty daemon is a successful
/// no-op.
pub async fn destroy_context(client: &dyn DaemonClient, context: &str) -> Result<()> {
    let containers = client.list_compose_containers_all().await.unwrap_or_else(|e| {
        warn!("destroy {context}: listing containers failed: {e}");
        Vec::new()
    });
    for container in containers {
        info!("destroying container {}", container.name);
        if let Err(e) = client.remove_container(&container.name, true).await {
            warn!("destroy {context}: removing container {} failed: {e}", container.name);
        }
    }

    let networks = client.list_networks().await.unwrap_or_else(|e| {
        warn!("destroy {context}: listing networks failed: {e}");
        Vec::new()
    });
    for network in networks {
        info!("destroying network {network}");
        if let Err(e) = client.remove_network(&network).await {
            warn!("destroy {context}: removing network {network} failed: {e}");
        }
    }

    let volumes = client.list_volumes().await.unwrap_or_else(|e| {
        warn!("destroy {context}: listing volumes failed: {e}");
        Vec::new()
    });
    for volume in volumes {
        info!("destroying volume {volume}");
        if let Err(e) = client.remove_volume(&volume).await {
            warn!("destroy {context}: removing volume {volume} failed: {e}");
        }
    }
    Ok(())
}

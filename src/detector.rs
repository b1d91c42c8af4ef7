//! Service state detection.
//!
//! For one stack, resolves the planned service set, the desired config hash
//! of every service, and the observed containers' labels, then classifies
//! each service. The two batch calls (config hashes for all services, label
//! inspect for all running containers) replace per-service daemon
//! invocations and are the main performance lever of planning.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::client::{ComposeInvocation, DaemonClient, PsEntry};
use crate::config::{Stack, SopsConfig, COMPOSE_HASH_LABEL, IDENTIFIER_LABEL};
use crate::error::Result;
use crate::secrets;

/// Classification of one planned service against the observed daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No container observed for the service
    Missing,
    /// Container observed, labels consistent, hashes match
    Running,
    /// Container observed but its config hash differs from the desired one
    Drifted,
    /// Container observed but its management label does not match ours
    IdentifierMismatch,
}

/// Everything the planner needs to know about one service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name
    pub name: String,
    /// Fully-qualified stack key
    pub stack_name: String,
    /// Detected state
    pub state: ServiceState,
    /// Desired config hash; empty when the batch hash call failed
    pub desired_hash: String,
    /// Observed config hash; empty when the service is not running
    pub running_hash: String,
    /// Observed container name, when one exists
    pub container: Option<String>,
}

/// True when any service needs a compose up to converge.
#[must_use]
pub fn needs_apply(services: &[ServiceInfo]) -> bool {
    services.iter().any(|s| s.state != ServiceState::Running)
}

/// Ordered list of service names the compose configuration plans.
///
/// Asks for the parsed service list first and falls back to a full config
/// parse when the daemon CLI does not support the short form.
pub async fn planned_services(
    client: &dyn DaemonClient,
    invocation: &ComposeInvocation,
) -> Result<Vec<String>> {
    match client.compose_config_services(invocation).await {
        Ok(mut services) => {
            services.sort();
            Ok(services)
        }
        Err(e) => {
            debug!("config --services failed, falling back to full parse: {e}");
            let doc = client.compose_config_full(invocation).await?;
            Ok(doc.services.keys().cloned().collect())
        }
    }
}

/// Observed containers of the stack's project, keyed by service name.
///
/// Daemon errors are downgraded to "no running services": during planning a
/// transiently unreachable project reads as empty, never as a failure.
pub async fn running_services(
    client: &dyn DaemonClient,
    invocation: &ComposeInvocation,
    project: &str,
) -> BTreeMap<String, PsEntry> {
    match client.compose_ps(invocation, project).await {
        Ok(entries) => entries
            .into_iter()
            .map(|e| (e.service.clone(), e))
            .collect(),
        Err(e) => {
            debug!("compose ps for {project} failed, treating as no running services: {e}");
            BTreeMap::new()
        }
    }
}

/// Detect the state of every planned service of one stack.
///
/// Secret decryption failures propagate; daemon failures on the observation
/// side degrade to the most conservative classification (`Missing`).
pub async fn detect_all_services_state(
    client: &dyn DaemonClient,
    stack_key: &str,
    stack: &Stack,
    identifier: &str,
    sops: Option<&SopsConfig>,
) -> Result<Vec<ServiceInfo>> {
    let env = secrets::inline_env(
        &stack.env_inline,
        &stack.sops_secrets,
        sops,
        &stack.root,
    )
    .await?;
    let invocation = ComposeInvocation::for_stack(stack_key, stack, env);
    detect_with_invocation(client, stack_key, &invocation, identifier).await
}

/// Variant of [`detect_all_services_state`] for callers that already resolved
/// the inline environment.
pub async fn detect_with_invocation(
    client: &dyn DaemonClient,
    stack_key: &str,
    invocation: &ComposeInvocation,
    identifier: &str,
) -> Result<Vec<ServiceInfo>> {
    let planned = planned_services(client, invocation).await?;
    let running = running_services(client, invocation, &invocation.project_name).await;

    let desired_hashes = match client
        .compose_config_hashes(invocation, &planned, identifier)
        .await
    {
        Ok(hashes) => hashes,
        Err(e) => {
            warn!("config hash batch for {stack_key} failed: {e}");
            std::collections::HashMap::new()
        }
    };

    let container_names: Vec<String> = running.values().map(|e| e.name.clone()).collect();
    let observed_labels = if container_names.is_empty() {
        std::collections::HashMap::new()
    } else {
        match client
            .inspect_multiple_container_labels(
                &container_names,
                &[COMPOSE_HASH_LABEL, IDENTIFIER_LABEL],
            )
            .await
        {
            Ok(labels) => labels,
            Err(e) => {
                warn!("label inspect batch for {stack_key} failed: {e}");
                std::collections::HashMap::new()
            }
        }
    };

    let mut infos = Vec::with_capacity(planned.len());
    for service in planned {
        let desired_hash = desired_hashes.get(&service).cloned().unwrap_or_default();
        let info = match running.get(&service) {
            None => ServiceInfo {
                name: service,
                stack_name: stack_key.to_string(),
                state: ServiceState::Missing,
                desired_hash,
                running_hash: String::new(),
                container: None,
            },
            Some(entry) => {
                let labels = observed_labels.get(&entry.name);
                let running_hash = labels
                    .and_then(|l| l.get(COMPOSE_HASH_LABEL))
                    .cloned()
                    .unwrap_or_default();
                let observed_identifier = labels
                    .and_then(|l| l.get(IDENTIFIER_LABEL))
                    .cloned()
                    .unwrap_or_default();

                let state = if !identifier.is_empty() && observed_identifier != identifier {
                    ServiceState::IdentifierMismatch
                } else if !desired_hash.is_empty() && running_hash != desired_hash {
                    ServiceState::Drifted
                } else {
                    ServiceState::Running
                };

                ServiceInfo {
                    name: service,
                    stack_name: stack_key.to_string(),
                    state,
                    desired_hash,
                    running_hash,
                    container: Some(entry.name.clone()),
                }
            }
        };
        infos.push(info);
    }
    Ok(infos)
}

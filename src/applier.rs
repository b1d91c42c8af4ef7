//! Convergence: drive one context from observed state to desired state.
//!
//! Order within a context is fixed: volumes, then filesets, then stacks,
//! then the restart queue. The queue drains only after compose up ran for
//! every stack of the context, so a service restarted for a fileset change
//! is never immediately recreated by a later stack apply.

use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ComposeInvocation, DaemonClient};
use crate::config::{Config, IDENTIFIER_LABEL};
use crate::detector;
use crate::error::{Error, Result};
use crate::fileset::{sync_fileset, RestartQueue};
use crate::plan::{ContextCache, StackCacheEntry};
use crate::resources::{ensure_networks_for_context, ensure_volumes_exist_for_context};
use crate::secrets;

/// Apply one context, reusing plan-time observations where available.
pub async fn apply_context(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
    cache: Option<&ContextCache>,
    cancel: &CancellationToken,
) -> Result<()> {
    let labels: BTreeMap<String, String> =
        BTreeMap::from([(IDENTIFIER_LABEL.to_string(), cfg.identifier.clone())]);

    check_cancel(cancel, context)?;
    ensure_volumes_exist_for_context(client, cfg, context, &labels).await?;
    ensure_networks_for_context(context);

    let mut restart_queue = RestartQueue::new();
    for name in cfg.filesets_for_context(context) {
        check_cancel(cancel, context)?;
        let fileset = &cfg.filesets[name];
        let cached = cache.and_then(|c| c.filesets.get(name));
        sync_fileset(client, name, fileset, cached, &mut restart_queue).await?;
    }

    for key in cfg.stacks_for_context(context) {
        check_cancel(cancel, context)?;
        apply_stack(client, cfg, key, cache.and_then(|c| c.stacks.get(key))).await?;
    }

    check_cancel(cancel, context)?;
    drain_restart_queue(client, context, &mut restart_queue).await?;
    Ok(())
}

/// Converge one stack: compose up when needed, then best-effort label fix-up.
async fn apply_stack(
    client: &dyn DaemonClient,
    cfg: &Config,
    stack_key: &str,
    cached: Option<&StackCacheEntry>,
) -> Result<()> {
    let stack = &cfg.stacks[stack_key];

    // Fresh detection here, unlike planning, propagates daemon errors.
    let (needs_apply, env) = match cached {
        Some(entry) => (entry.needs_apply, entry.inline_env.clone()),
        None => {
            let env = secrets::inline_env(
                &stack.env_inline,
                &stack.sops_secrets,
                cfg.sops.as_ref(),
                &stack.root,
            )
            .await?;
            let invocation = ComposeInvocation::for_stack(stack_key, stack, env.clone());
            let services = detector::detect_with_invocation(
                client,
                stack_key,
                &invocation,
                &cfg.identifier,
            )
            .await?;
            (detector::needs_apply(&services), env)
        }
    };

    if !needs_apply {
        debug!("stack {stack_key}: converged, skipping compose up");
        return Ok(());
    }

    let invocation = ComposeInvocation::for_stack(stack_key, stack, env);
    let project = invocation.project_name.clone();
    info!("stack {stack_key}: compose up");
    client.compose_up(&invocation, &project).await?;

    fix_identifier_labels(client, cfg, stack_key, &invocation, &project).await;
    Ok(())
}

/// Stamp the management label on containers that lost or never had it.
///
/// Per-container failures are swallowed; one warning per stack names the
/// containers that could not be updated.
async fn fix_identifier_labels(
    client: &dyn DaemonClient,
    cfg: &Config,
    stack_key: &str,
    invocation: &ComposeInvocation,
    project: &str,
) {
    let entries = match client.compose_ps(invocation, project).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("stack {stack_key}: label fix-up skipped, compose ps failed: {e}");
            return;
        }
    };
    if entries.is_empty() {
        return;
    }

    let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
    let observed = client
        .inspect_multiple_container_labels(&names, &[IDENTIFIER_LABEL])
        .await
        .unwrap_or_default();

    let desired: BTreeMap<String, String> =
        BTreeMap::from([(IDENTIFIER_LABEL.to_string(), cfg.identifier.clone())]);
    let mut failed: Vec<String> = Vec::new();
    for name in names {
        let current = observed
            .get(&name)
            .and_then(|labels| labels.get(IDENTIFIER_LABEL));
        if current.map(String::as_str) == Some(cfg.identifier.as_str()) {
            continue;
        }
        if client.update_container_labels(&name, &desired).await.is_err() {
            failed.push(name);
        }
    }
    if !failed.is_empty() {
        warn!(
            "stack {stack_key}: could not refresh identifier label on: {}",
            failed.join(", ")
        );
    }
}

/// Restart every queued service. A service with no matching container is a
/// warning, never a failure; an actual restart failure propagates.
async fn drain_restart_queue(
    client: &dyn DaemonClient,
    context: &str,
    queue: &mut RestartQueue,
) -> Result<()> {
    if queue.is_empty() {
        return Ok(());
    }
    let containers = client.list_compose_containers_all().await?;
    for service in queue.drain() {
        let matching: Vec<&str> = containers
            .iter()
            .filter(|c| c.service == service)
            .map(|c| c.name.as_str())
            .collect();
        if matching.is_empty() {
            warn!("context {context}: no container found for restart target {service}");
            continue;
        }
        for name in matching {
            info!("restarting {name} for service {service}");
            client.restart_container(name).await?;
        }
    }
    Ok(())
}

fn check_cancel(cancel: &CancellationToken, context: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::external(
            "applier",
            format!("context {context} cancelled"),
        ));
    }
    Ok(())
}

//! Top-level resource management: volumes and networks.
//!
//! Volumes are created directly, carrying the management labels. Networks
//! are created by the compose invocation itself; the network step here is a
//! no-op kept so the apply pipeline stays total, and prune/destroy still
//! remove labeled networks.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::client::DaemonClient;
use crate::config::Config;
use crate::error::{Error, Result};

/// Ensure every desired volume of a context exists, carrying `labels`.
///
/// Lists existing volumes once, creates each missing one, and returns the
/// post-state set. A failed create is terminal for the context.
pub async fn ensure_volumes_exist_for_context(
    client: &dyn DaemonClient,
    cfg: &Config,
    context: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let existing = client.list_volumes().await?;
    let desired = cfg.desired_volumes_for_context(context);

    let mut post_state: Vec<String> = existing.clone();
    for name in &desired {
        if existing.contains(name) {
            continue;
        }
        info!("creating volume {name} in context {context}");
        client.create_volume(name, labels).await.map_err(|e| {
            Error::external(
                "resources",
                format!("creating volume {name} in context {context}: {e}"),
            )
        })?;
        post_state.push(name.clone());
    }
    post_state.sort();
    post_state.dedup();
    Ok(post_state)
}

/// Network convergence step.
///
/// Networks are declared in compose files and materialized by `compose up`;
/// nothing to do here beyond keeping the pipeline shape.
pub fn ensure_networks_for_context(context: &str) {
    debug!("networks in context {context} are compose-managed, nothing to ensure");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, Fileset};
    use std::path::PathBuf;

    #[test]
    fn test_desired_volumes_come_from_filesets_and_context() {
        let mut cfg = Config {
            identifier: "demo".to_string(),
            ..Config::default()
        };
        cfg.contexts.insert(
            "default".to_string(),
            ContextConfig {
                volumes: vec!["logs".to_string()],
                networks: vec![],
            },
        );
        cfg.filesets.insert(
            "site".to_string(),
            Fileset {
                context: "default".to_string(),
                source_abs: PathBuf::from("/srv/site"),
                target_volume: "data".to_string(),
                target_path: "/srv".to_string(),
                ..Fileset::default()
            },
        );
        assert_eq!(
            cfg.desired_volumes_for_context("default"),
            vec!["data".to_string(), "logs".to_string()]
        );
        assert!(cfg.desired_volumes_for_context("other").is_empty());
    }
}

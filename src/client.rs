//! The daemon client contract.
//!
//! The engine depends on this interface, never on a concrete daemon. Every
//! list operation is scoped by the management label so that the engine only
//! sees resources it owns. [`crate::cli::CliClient`] implements the contract
//! over the external `docker` CLI; tests drive the engine with scripted
//! in-memory implementations.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::config::Stack;
use crate::error::Result;

/// A compose-managed container as reported by a label-scoped `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeContainer {
    /// Compose project the container belongs to
    pub project: String,
    /// Compose service name
    pub service: String,
    /// Container name
    pub name: String,
}

/// One row of `compose ps` for a single project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PsEntry {
    /// Container name
    #[serde(rename = "Name")]
    pub name: String,
    /// Compose service name
    #[serde(rename = "Service")]
    pub service: String,
}

/// Captured output of a script run inside a helper container.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// Options for direct network creation.
#[derive(Debug, Clone, Default)]
pub struct NetworkOpts {
    /// Network driver
    pub driver: Option<String>,
    /// Driver options
    pub options: BTreeMap<String, String>,
}

/// Parsed `compose config --format json` output, reduced to the service map.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeConfigDoc {
    /// Service definitions keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, serde_json::Value>,
}

/// Everything needed to address one compose project on the CLI.
#[derive(Debug, Clone, Default)]
pub struct ComposeInvocation {
    /// Project directory (the stack root)
    pub project_directory: PathBuf,
    /// Compose file paths (`--file`), relative to the project directory
    pub files: Vec<PathBuf>,
    /// Profiles to enable (`--profile`)
    pub profiles: Vec<String>,
    /// Environment file (`--env-file`)
    pub env_file: Option<PathBuf>,
    /// Project name (`--project-name`)
    pub project_name: String,
    /// Inline `KEY=VALUE` environment for the compose process
    pub env: Vec<String>,
}

impl ComposeInvocation {
    /// Build the invocation for a stack, with the already-resolved inline env.
    #[must_use]
    pub fn for_stack(stack_key: &str, stack: &Stack, env: Vec<String>) -> Self {
        Self {
            project_directory: stack.root.clone(),
            files: stack.files.clone(),
            profiles: stack.profiles.clone(),
            env_file: stack.env_file.clone(),
            project_name: stack.project_name(stack_key).to_string(),
            env,
        }
    }

    /// Global compose arguments shared by every subcommand.
    #[must_use]
    pub fn global_args(&self) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        args.push("--project-directory".to_string());
        args.push(self.project_directory.display().to_string());
        for file in &self.files {
            args.push("--file".to_string());
            args.push(file.display().to_string());
        }
        for profile in &self.profiles {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        if let Some(ref env_file) = self.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }
        args.push("--project-name".to_string());
        args.push(self.project_name.clone());
        args
    }

    /// The inline env as a process environment map.
    #[must_use]
    pub fn env_map(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Operations the engine needs from a Docker-compatible daemon.
///
/// All `list_*` operations return only resources carrying the management
/// label. Implementations are expected to honor the caller's cancellation
/// and deadline; the engine imposes no timeouts of its own.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    // Volumes

    /// Names of managed volumes.
    async fn list_volumes(&self) -> Result<Vec<String>>;

    /// Create a volume carrying the given labels.
    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Remove a volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    // Volume contents

    /// Read a file relative to `target_path` inside a volume.
    async fn read_file_from_volume(
        &self,
        volume: &str,
        target_path: &str,
        rel_file: &str,
    ) -> Result<String>;

    /// Write a file relative to `target_path` inside a volume.
    async fn write_file_to_volume(
        &self,
        volume: &str,
        target_path: &str,
        rel_file: &str,
        content: &str,
    ) -> Result<()>;

    /// Extract a tar archive into `target_path` inside a volume.
    async fn extract_tar_to_volume(
        &self,
        volume: &str,
        target_path: &str,
        archive: Vec<u8>,
    ) -> Result<()>;

    /// Recursively remove paths relative to `target_path` inside a volume.
    async fn remove_paths_from_volume(
        &self,
        volume: &str,
        target_path: &str,
        rel_paths: &[String],
    ) -> Result<()>;

    /// Run a shell script in a helper container with the volume mounted at
    /// `target_path`.
    async fn run_volume_script(
        &self,
        volume: &str,
        target_path: &str,
        script: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ScriptOutput>;

    // Networks

    /// Names of managed networks.
    async fn list_networks(&self) -> Result<Vec<String>>;

    /// Create a network carrying the given labels.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        opts: &NetworkOpts,
    ) -> Result<()>;

    /// Remove a network.
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Inspect a network; returns the raw inspect document.
    async fn inspect_network(&self, name: &str) -> Result<serde_json::Value>;

    // Containers

    /// All managed compose containers across projects, running or not.
    async fn list_compose_containers_all(&self) -> Result<Vec<ComposeContainer>>;

    /// Names of containers mounting the given volume.
    async fn list_containers_using_volume(&self, volume: &str) -> Result<Vec<String>>;

    /// Restart one container.
    async fn restart_container(&self, name: &str) -> Result<()>;

    /// Stop a set of containers.
    async fn stop_containers(&self, names: &[String]) -> Result<()>;

    /// Start a set of containers.
    async fn start_containers(&self, names: &[String]) -> Result<()>;

    /// Remove one container.
    async fn remove_container(&self, name: &str, force: bool) -> Result<()>;

    /// Best-effort label update on an existing container.
    async fn update_container_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Read selected labels from one container.
    async fn inspect_container_labels(
        &self,
        name: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, String>>;

    /// Read selected labels from many containers in one daemon call.
    async fn inspect_multiple_container_labels(
        &self,
        names: &[String],
        keys: &[&str],
    ) -> Result<HashMap<String, HashMap<String, String>>>;

    // Compose

    /// Service names from the parsed compose configuration.
    async fn compose_config_services(&self, invocation: &ComposeInvocation)
        -> Result<Vec<String>>;

    /// Full parsed compose configuration.
    async fn compose_config_full(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<ComposeConfigDoc>;

    /// Desired config hash for one service.
    async fn compose_config_hash(
        &self,
        invocation: &ComposeInvocation,
        service: &str,
        identifier: &str,
    ) -> Result<String>;

    /// Desired config hashes for many services in one daemon call.
    async fn compose_config_hashes(
        &self,
        invocation: &ComposeInvocation,
        services: &[String],
        identifier: &str,
    ) -> Result<HashMap<String, String>>;

    /// Containers of one compose project.
    async fn compose_ps(
        &self,
        invocation: &ComposeInvocation,
        project: &str,
    ) -> Result<Vec<PsEntry>>;

    /// Converge one compose project.
    async fn compose_up(&self, invocation: &ComposeInvocation, project: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_invocation_global_args() {
        let stack = Stack {
            root: PathBuf::from("/srv/web"),
            files: vec![PathBuf::from("docker-compose.yml")],
            profiles: vec!["prod".to_string()],
            env_file: Some(PathBuf::from(".env")),
            ..Stack::default()
        };
        let invocation = ComposeInvocation::for_stack("default/web", &stack, vec![]);
        let args = invocation.global_args();
        assert_eq!(args[0], "compose");
        assert!(args.windows(2).any(|w| w == ["--project-directory", "/srv/web"]));
        assert!(args.windows(2).any(|w| w == ["--file", "docker-compose.yml"]));
        assert!(args.windows(2).any(|w| w == ["--profile", "prod"]));
        assert!(args.windows(2).any(|w| w == ["--env-file", ".env"]));
        assert!(args.windows(2).any(|w| w == ["--project-name", "web"]));
    }

    #[test]
    fn test_env_map_skips_malformed_entries() {
        let invocation = ComposeInvocation {
            env: vec![
                "KEY=value".to_string(),
                "malformed".to_string(),
                "OTHER=a=b".to_string(),
            ],
            ..ComposeInvocation::default()
        };
        let map = invocation.env_map();
        assert_eq!(map.get("KEY").map(String::as_str), Some("value"));
        assert_eq!(map.get("OTHER").map(String::as_str), Some("a=b"));
        assert_eq!(map.len(), 2);
    }
}

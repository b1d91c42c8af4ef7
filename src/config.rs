//! Manifest-shaped configuration consumed by the engine.
//!
//! Parsing and validation of the manifest file itself happens outside this
//! crate; the engine receives a ready [`Config`] value and holds a shared
//! immutable reference to it for the duration of a plan/apply cycle. The
//! types here derive `Deserialize` so any front end can feed the engine
//! directly from JSON or YAML.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Label applied to every resource the engine creates.
pub const IDENTIFIER_LABEL: &str = "io.dockform.identifier";

/// Label written by compose holding the config hash of a running container.
pub const COMPOSE_HASH_LABEL: &str = "com.docker.compose.config-hash";

/// Label written by compose holding the service name of a container.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Label written by compose holding the project name of a container.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Top-level engine input.
///
/// Maps are ordered (`BTreeMap`) so that every iteration in the engine is
/// deterministic without re-sorting at each call site.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Management domain tag; labels every resource the engine creates
    pub identifier: String,
    /// Daemon endpoints by context name
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextConfig>,
    /// Compose projects by fully-qualified key `"<context>/<name>"`
    #[serde(default)]
    pub stacks: BTreeMap<String, Stack>,
    /// Content-addressed directory syncs by unique name
    #[serde(default)]
    pub filesets: BTreeMap<String, Fileset>,
    /// Secret-decryption configuration
    #[serde(default)]
    pub sops: Option<SopsConfig>,
}

impl Config {
    /// Validate the §3 invariants that are only checkable at runtime.
    ///
    /// Called once at engine entry; failures are [`ErrorKind::InvalidInput`]
    /// and happen before any daemon call.
    ///
    /// [`ErrorKind::InvalidInput`]: crate::error::ErrorKind::InvalidInput
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::invalid_input("config", "identifier must not be empty"));
        }
        for (key, stack) in &self.stacks {
            let (context, name) = split_stack_key(key)?;
            if name.is_empty() {
                return Err(Error::invalid_input(
                    "config",
                    format!("stack key {key:?} has an empty name segment"),
                ));
            }
            if !self.contexts.contains_key(context) {
                return Err(Error::invalid_input(
                    "config",
                    format!("stack {key:?} references unknown context {context:?}"),
                ));
            }
            if !stack.root.is_absolute() {
                return Err(Error::invalid_input(
                    "config",
                    format!("stack {key:?}: root must be an absolute path"),
                ));
            }
        }
        for (name, fileset) in &self.filesets {
            fileset.validate(name)?;
            if !self.contexts.contains_key(&fileset.context) {
                return Err(Error::invalid_input(
                    "config",
                    format!("fileset {name:?} references unknown context {:?}", fileset.context),
                ));
            }
        }
        Ok(())
    }

    /// Fileset names targeting the given context, in sorted order.
    #[must_use]
    pub fn filesets_for_context(&self, context: &str) -> Vec<&str> {
        self.filesets
            .iter()
            .filter(|(_, f)| f.context == context)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Stack keys belonging to the given context, in sorted order.
    #[must_use]
    pub fn stacks_for_context(&self, context: &str) -> Vec<&str> {
        self.stacks
            .keys()
            .filter(|k| split_stack_key(k).map(|(c, _)| c == context).unwrap_or(false))
            .map(String::as_str)
            .collect()
    }

    /// Volume names the given context should have: fileset targets plus the
    /// explicit volumes in the context config, deduplicated and sorted.
    #[must_use]
    pub fn desired_volumes_for_context(&self, context: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .filesets
            .values()
            .filter(|f| f.context == context)
            .map(|f| f.target_volume.clone())
            .collect();
        if let Some(ctx) = self.contexts.get(context) {
            names.extend(ctx.volumes.iter().cloned());
        }
        names.sort();
        names.dedup();
        names
    }
}

/// Split a fully-qualified stack key into `(context, name)`.
pub fn split_stack_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/').ok_or_else(|| {
        Error::invalid_input(
            "config",
            format!("stack key {key:?} is not of the form \"<context>/<name>\""),
        )
    })
}

/// Per-context resource declarations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Top-level named volumes to ensure
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Top-level networks (created by compose; listed for prune scoping)
    #[serde(default)]
    pub networks: Vec<String>,
}

/// A compose project managed as a unit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    /// Absolute local directory containing the compose sources
    pub root: PathBuf,
    /// Compose file paths, relative to `root` unless absolute
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Compose profiles to enable
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Environment file passed to compose
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    /// Inline `KEY=VALUE` environment entries
    #[serde(default)]
    pub env_inline: Vec<String>,
    /// Encrypted env files decrypted into the inline environment
    #[serde(default)]
    pub sops_secrets: Vec<PathBuf>,
    /// Explicit compose project name override
    #[serde(default)]
    pub project: Option<String>,
}

impl Stack {
    /// Effective compose project name: the explicit override when set,
    /// otherwise the name segment of the stack key.
    #[must_use]
    pub fn project_name<'a>(&'a self, stack_key: &'a str) -> &'a str {
        if let Some(ref project) = self.project {
            return project;
        }
        split_stack_key(stack_key).map_or(stack_key, |(_, name)| name)
    }
}

/// How files synchronized into a volume interact with running services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Sync while services run; restart them after all stacks converge
    #[default]
    Hot,
    /// Stop matching services, sync, then start them again
    Cold,
}

/// Which services to restart after a fileset sync.
///
/// Exactly one of the two selection modes is used; both empty means no
/// restarts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartServices {
    /// Explicit ordered list of service names
    #[serde(default)]
    pub services: Vec<String>,
    /// Restart every service whose containers mount the target volume
    #[serde(default)]
    pub attached: bool,
}

/// Ownership adjustments applied inside the volume after a sync.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ownership {
    /// Owner: numeric uid or symbolic name resolved in the helper image
    #[serde(default)]
    pub user: Option<String>,
    /// Group: numeric gid or symbolic name resolved in the helper image
    #[serde(default)]
    pub group: Option<String>,
    /// Mode applied to files, octal string such as `"0644"`
    #[serde(default)]
    pub file_mode: Option<String>,
    /// Mode applied to directories, octal string such as `"0755"`
    #[serde(default)]
    pub dir_mode: Option<String>,
    /// Only touch paths written by the sync, never recurse
    #[serde(default)]
    pub preserve_existing: bool,
}

impl Ownership {
    /// True when any of user/group/modes is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.user.is_some()
            || self.group.is_some()
            || self.file_mode.is_some()
            || self.dir_mode.is_some()
    }
}

/// A local directory synchronized into a named volume at a subpath.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fileset {
    /// Context owning the target volume
    pub context: String,
    /// Absolute local source directory
    pub source_abs: PathBuf,
    /// Managed volume receiving the files
    pub target_volume: String,
    /// Absolute path inside the volume
    pub target_path: String,
    /// Glob patterns excluded from the local walk
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Restart selection applied after a successful sync
    #[serde(default)]
    pub restart_services: RestartServices,
    /// Hot or cold sync semantics
    #[serde(default)]
    pub apply_mode: ApplyMode,
    /// Optional ownership adjustments
    #[serde(default)]
    pub ownership: Option<Ownership>,
}

impl Fileset {
    /// Validate this fileset's invariants.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.source_abs.as_os_str().is_empty() {
            return Err(Error::invalid_input(
                "config",
                format!("fileset {name:?}: sourceAbs must not be empty"),
            ));
        }
        if !self.source_abs.is_absolute() {
            return Err(Error::invalid_input(
                "config",
                format!("fileset {name:?}: sourceAbs must be an absolute path"),
            ));
        }
        if self.target_volume.is_empty() {
            return Err(Error::invalid_input(
                "config",
                format!("fileset {name:?}: targetVolume must not be empty"),
            ));
        }
        check_safe_target_path(&self.target_path).map_err(|e| {
            Error::invalid_input("config", format!("fileset {name:?}: {e}"))
        })?;
        if self.restart_services.attached && !self.restart_services.services.is_empty() {
            return Err(Error::invalid_input(
                "config",
                format!("fileset {name:?}: restartServices is either attached or an explicit list, not both"),
            ));
        }
        Ok(())
    }
}

/// Reject target paths that would escape or clobber the volume root.
///
/// `/`, `.`, the empty string, relative paths, and any path containing a
/// `..` component after normalization are refused.
pub fn check_safe_target_path(target_path: &str) -> std::result::Result<(), String> {
    if target_path.is_empty() || target_path == "/" || target_path == "." {
        return Err(format!("unsafe target path {target_path:?}"));
    }
    let path = Path::new(target_path);
    if !path.is_absolute() {
        return Err(format!("target path {target_path:?} must be absolute"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("target path {target_path:?} must not contain \"..\""));
    }
    Ok(())
}

/// Configuration for the external secret-decryption collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SopsConfig {
    /// Path to an age key file
    #[serde(default)]
    pub age_key_file: Option<PathBuf>,
    /// Directory holding a PGP keyring
    #[serde(default)]
    pub pgp_keyring_dir: Option<PathBuf>,
    /// Use the running gpg agent
    #[serde(default)]
    pub pgp_use_agent: bool,
    /// Pinentry mode passed to gpg
    #[serde(default)]
    pub pgp_pinentry_mode: Option<String>,
    /// Passphrase handed to gpg via the environment; never logged
    #[serde(default)]
    pub pgp_passphrase: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        let mut contexts = BTreeMap::new();
        contexts.insert("default".to_string(), ContextConfig::default());
        Config {
            identifier: "demo".to_string(),
            contexts,
            ..Config::default()
        }
    }

    #[test]
    fn test_validate_requires_identifier() {
        let mut cfg = minimal_config();
        cfg.identifier = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_empty_context_map() {
        // the manifest validator owns the non-empty invariant; the engine
        // treats no contexts as nothing to do
        let cfg = Config {
            identifier: "demo".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_stack_key_split() {
        assert_eq!(split_stack_key("default/web").unwrap(), ("default", "web"));
        assert!(split_stack_key("web").is_err());
    }

    #[test]
    fn test_project_name_defaults_to_key_segment() {
        let stack = Stack::default();
        assert_eq!(stack.project_name("default/web"), "web");

        let named = Stack {
            project: Some("custom".to_string()),
            ..Stack::default()
        };
        assert_eq!(named.project_name("default/web"), "custom");
    }

    #[test]
    fn test_unsafe_target_paths() {
        assert!(check_safe_target_path("/").is_err());
        assert!(check_safe_target_path(".").is_err());
        assert!(check_safe_target_path("").is_err());
        assert!(check_safe_target_path("srv/site").is_err());
        assert!(check_safe_target_path("/srv/../etc").is_err());
        assert!(check_safe_target_path("/srv/site").is_ok());
    }

    #[test]
    fn test_fileset_restart_modes_exclusive() {
        let fileset = Fileset {
            context: "default".to_string(),
            source_abs: PathBuf::from("/srv/site"),
            target_volume: "data".to_string(),
            target_path: "/srv".to_string(),
            restart_services: RestartServices {
                services: vec!["web".to_string()],
                attached: true,
            },
            ..Fileset::default()
        };
        assert!(fileset.validate("site").is_err());
    }

    #[test]
    fn test_desired_volumes_union() {
        let mut cfg = minimal_config();
        cfg.contexts.get_mut("default").unwrap().volumes = vec!["extra".to_string()];
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
        assert_eq!(cfg.desired_volumes_for_context("default"), vec!["data", "extra"]);
    }

    #[test]
    fn test_config_deserializes_from_json() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "identifier": "demo",
                "contexts": {"default": {"volumes": ["data"]}},
                "stacks": {"default/web": {"root": "/srv/web", "files": ["docker-compose.yml"]}},
                "filesets": {
                    "site": {
                        "context": "default",
                        "sourceAbs": "/srv/site",
                        "targetVolume": "data",
                        "targetPath": "/srv",
                        "applyMode": "cold",
                        "restartServices": {"attached": true}
                    }
                }
            }"#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.filesets["site"].apply_mode, ApplyMode::Cold);
        assert!(cfg.filesets["site"].restart_services.attached);
    }
}

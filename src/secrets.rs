//! Secret decryption through the external `sops` binary.
//!
//! Decrypted values live only in the inline env slice attached to a stack;
//! they are never logged and never written to disk by the engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::SopsConfig;
use crate::error::{Error, Result};
use crate::exec::{ExecutionConfig, ProcessExecutor};

/// Decrypt one dotenv-formatted secret file into `KEY=VALUE` lines.
///
/// `path` is resolved relative to `base_dir` when it is not absolute.
/// Comment and blank lines in the decrypted output are dropped.
pub async fn decrypt_env_file(
    sops: Option<&SopsConfig>,
    base_dir: &Path,
    path: &Path,
) -> Result<Vec<String>> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };

    let binary = which::which("sops")
        .map_err(|_| Error::external("secrets", "sops binary not found in PATH"))?;
    let executor = ProcessExecutor::new(binary);

    let args = vec![
        "--decrypt".to_string(),
        "--output-type".to_string(),
        "dotenv".to_string(),
        resolved.display().to_string(),
    ];
    let config = ExecutionConfig {
        environment: sops.map(decryption_env).unwrap_or_default(),
        ..ExecutionConfig::default()
    };

    debug!("decrypting {}", resolved.display());
    let output = executor.execute(&args, Some(config)).await.map_err(|e| {
        Error::external(
            "secrets",
            format!("decrypting {}: {e}", resolved.display()),
        )
    })?;

    Ok(parse_dotenv(&output.stdout))
}

/// Environment handed to the decryption process.
fn decryption_env(sops: &SopsConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(ref key_file) = sops.age_key_file {
        env.insert(
            "SOPS_AGE_KEY_FILE".to_string(),
            key_file.display().to_string(),
        );
    }
    if let Some(ref keyring) = sops.pgp_keyring_dir {
        env.insert("GNUPGHOME".to_string(), keyring.display().to_string());
    }
    if !sops.pgp_use_agent {
        env.insert("GPG_AGENT_INFO".to_string(), String::new());
    }
    if let Some(ref mode) = sops.pgp_pinentry_mode {
        env.insert("PINENTRY_MODE".to_string(), mode.clone());
    }
    if let Some(ref passphrase) = sops.pgp_passphrase {
        env.insert("SOPS_GPG_PASSPHRASE".to_string(), passphrase.clone());
    }
    env
}

fn parse_dotenv(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && l.contains('='))
        .map(ToString::to_string)
        .collect()
}

/// Resolve a stack's full inline environment: manifest entries first, then
/// decrypted secret files in manifest order.
pub async fn inline_env(
    env_inline: &[String],
    sops_secrets: &[PathBuf],
    sops: Option<&SopsConfig>,
    stack_root: &Path,
) -> Result<Vec<String>> {
    let mut env: Vec<String> = env_inline.to_vec();
    for secret in sops_secrets {
        let decrypted = decrypt_env_file(sops, stack_root, secret).await?;
        env.extend(decrypted);
    }
    Ok(env)
}

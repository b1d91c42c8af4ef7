//! Ownership and mode adjustments applied inside a volume after a sync.
//!
//! The adjustments run as a generated shell script in a helper container
//! with the volume mounted at the fileset's target path. Symbolic user and
//! group names are resolved at runtime against the helper image's name
//! service; an unknown name degrades to a warning and the chown is skipped.
//! Every path in the generated script is quoted.

use std::collections::BTreeSet;

use crate::cli::shell_quote;
use crate::config::{check_safe_target_path, Ownership};
use crate::error::{Error, Result};

/// Build the shell script applying `ownership` under `target_path`.
///
/// `written_paths` holds the relative paths the sync created or updated; it
/// is only consulted in preserve-existing mode. Returns `None` when the
/// ownership block configures nothing.
pub fn build_ownership_script(
    target_path: &str,
    ownership: &Ownership,
    written_paths: &[&str],
) -> Result<Option<String>> {
    check_safe_target_path(target_path)
        .map_err(|e| Error::invalid_input("ownership", e))?;

    if !ownership.is_configured() {
        return Ok(None);
    }
    if let Some(ref mode) = ownership.file_mode {
        validate_mode("fileMode", mode)?;
    }
    if let Some(ref mode) = ownership.dir_mode {
        validate_mode("dirMode", mode)?;
    }

    let mut script = String::from("set -e\n");
    script.push_str(&resolution_preamble(ownership));

    if ownership.preserve_existing {
        script.push_str(&preserve_existing_body(target_path, ownership, written_paths));
    } else {
        script.push_str(&recursive_body(target_path, ownership));
    }
    Ok(Some(script))
}

fn validate_mode(field: &str, mode: &str) -> Result<()> {
    let ok = matches!(mode.len(), 3 | 4) && mode.bytes().all(|b| (b'0'..=b'7').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_input(
            "ownership",
            format!("{field} {mode:?} is not an octal mode"),
        ))
    }
}

/// Emit the uid/gid resolution prologue.
///
/// Numeric values pass through; symbolic names go through the helper image's
/// name service. An unresolved name leaves the variable empty, which the
/// chown lines treat as "skip with a warning".
fn resolution_preamble(ownership: &Ownership) -> String {
    let mut out = String::new();
    out.push_str("own=''\n");
    if let Some(ref user) = ownership.user {
        let quoted = shell_quote(user);
        out.push_str(&format!(
            "case {quoted} in\n  ''|*[!0-9]*) uid=\"$(id -u {quoted} 2>/dev/null || true)\" ;;\n  *) uid={quoted} ;;\nesac\n"
        ));
        out.push_str(&format!(
            "if [ -z \"$uid\" ]; then echo \"warning: unknown user {user}\" >&2; fi\n",
            user = user.replace('"', "")
        ));
        out.push_str("own=\"$uid\"\n");
    }
    if let Some(ref group) = ownership.group {
        let quoted = shell_quote(group);
        out.push_str(&format!(
            "case {quoted} in\n  ''|*[!0-9]*) gid=\"$(getent group {quoted} 2>/dev/null | cut -d: -f3 || true)\" ;;\n  *) gid={quoted} ;;\nesac\n"
        ));
        out.push_str(&format!(
            "if [ -z \"$gid\" ]; then echo \"warning: unknown group {group}\" >&2; fi\n",
            group = group.replace('"', "")
        ));
        out.push_str("if [ -n \"$gid\" ]; then own=\"$own:$gid\"; fi\n");
    }
    out
}

fn recursive_body(target_path: &str, ownership: &Ownership) -> String {
    let root = shell_quote(target_path);
    let mut out = String::new();
    if let Some(ref mode) = ownership.dir_mode {
        out.push_str(&format!("find {root} -type d -exec chmod {mode} {{}} +\n"));
    }
    if let Some(ref mode) = ownership.file_mode {
        out.push_str(&format!("find {root} -type f -exec chmod {mode} {{}} +\n"));
    }
    if ownership.user.is_some() || ownership.group.is_some() {
        out.push_str(&format!(
            "if [ -n \"$own\" ]; then chown -R \"$own\" {root}; fi\n"
        ));
    }
    out
}

/// Touch only the written files and their ancestor directories, never the
/// rest of the tree.
fn preserve_existing_body(
    target_path: &str,
    ownership: &Ownership,
    written_paths: &[&str],
) -> String {
    let mut files: Vec<String> = written_paths
        .iter()
        .map(|p| format!("{target_path}/{p}"))
        .collect();
    files.sort();
    files.dedup();

    let mut dirs: BTreeSet<String> = BTreeSet::new();
    for rel in written_paths {
        let mut current = *rel;
        while let Some((parent, _)) = current.rsplit_once('/') {
            dirs.insert(format!("{target_path}/{parent}"));
            current = parent;
        }
    }

    let mut out = String::new();
    if let Some(ref mode) = ownership.dir_mode {
        for dir in &dirs {
            out.push_str(&format!("chmod {mode} {}\n", shell_quote(dir)));
        }
    }
    if let Some(ref mode) = ownership.file_mode {
        for file in &files {
            out.push_str(&format!("chmod {mode} {}\n", shell_quote(file)));
        }
    }
    if ownership.user.is_some() || ownership.group.is_some() {
        for path in dirs.iter().chain(files.iter()) {
            out.push_str(&format!(
                "if [ -n \"$own\" ]; then chown \"$own\" {}; fi\n",
                shell_quote(path)
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ownership() -> Ownership {
        Ownership {
            user: Some("1000".to_string()),
            group: Some("www-data".to_string()),
            file_mode: Some("0644".to_string()),
            dir_mode: Some("0755".to_string()),
            preserve_existing: false,
        }
    }

    #[test]
    fn test_refuses_unsafe_target_paths() {
        for path in ["/", ".", "", "/srv/../etc", "relative"] {
            let err = build_ownership_script(path, &ownership(), &[]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "path {path:?}");
        }
    }

    #[test]
    fn test_unconfigured_ownership_is_none() {
        let script = build_ownership_script("/srv", &Ownership::default(), &[]).unwrap();
        assert!(script.is_none());
    }

    #[test]
    fn test_recursive_mode_uses_find_and_chown_r() {
        let script = build_ownership_script("/srv", &ownership(), &[])
            .unwrap()
            .unwrap();
        assert!(script.contains("find '/srv' -type d -exec chmod 0755"));
        assert!(script.contains("find '/srv' -type f -exec chmod 0644"));
        assert!(script.contains("chown -R \"$own\" '/srv'"));
    }

    #[test]
    fn test_preserve_existing_touches_only_written_paths() {
        let own = Ownership {
            preserve_existing: true,
            ..ownership()
        };
        let script = build_ownership_script("/srv", &own, &["sub/a.txt", "b.txt"])
            .unwrap()
            .unwrap();
        assert!(script.contains("chmod 0644 '/srv/sub/a.txt'"));
        assert!(script.contains("chmod 0644 '/srv/b.txt'"));
        assert!(script.contains("chmod 0755 '/srv/sub'"));
        assert!(!script.contains("chown -R"));
        assert!(!script.contains("find "));
        // ancestor stops below the target root
        assert!(!script.contains("chmod 0755 '/srv'\n"));
    }

    #[test]
    fn test_symbolic_names_resolve_at_runtime() {
        let own = Ownership {
            user: Some("caddy".to_string()),
            ..Ownership::default()
        };
        let script = build_ownership_script("/srv", &own, &[]).unwrap().unwrap();
        assert!(script.contains("id -u 'caddy'"));
        assert!(script.contains("warning: unknown user caddy"));
    }

    #[test]
    fn test_special_characters_are_quoted() {
        let own = Ownership {
            user: Some("we'ird".to_string()),
            ..Ownership::default()
        };
        let script = build_ownership_script("/srv", &own, &[]).unwrap().unwrap();
        assert!(script.contains(r"'we'\''ird'"));
    }

    #[test]
    fn test_bad_mode_rejected() {
        let own = Ownership {
            file_mode: Some("rw-r--r--".to_string()),
            ..Ownership::default()
        };
        let err = build_ownership_script("/srv", &own, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}

//! Fileset synchronization: drive a volume's contents to match a local
//! directory.
//!
//! The transfer is diff-based: only created and updated files travel, as one
//! streamed tar archive extracted inside the volume; removed files are
//! deleted explicitly; the remote index file is written last so that a crash
//! mid-sync leaves the remote view stale but consistent (the next run plans
//! more work than needed, never less).
//!
//! Cold mode stops the matching service containers before the first write
//! and guarantees exactly one start attempt for them before returning,
//! success or failure.

use std::collections::BTreeSet;
use std::io::Cursor;
use tracing::{debug, info, warn};

use crate::client::DaemonClient;
use crate::config::{ApplyMode, Fileset, RestartServices};
use crate::error::{Error, Result};
use crate::index::{
    build_local_index, diff_indexes, parse_index, serialize_index, Index, IndexDiff,
    INDEX_FILE_NAME,
};
use crate::ownership::build_ownership_script;
use crate::plan::FilesetCacheEntry;

/// Per-context queue of services to restart after all stacks converge.
///
/// Order-preserving and deduplicating. Written during hot-mode syncs and
/// drained once by the applier; the two phases never run concurrently.
#[derive(Debug, Default)]
pub struct RestartQueue {
    order: Vec<String>,
    seen: BTreeSet<String>,
}

impl RestartQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a service unless already present.
    pub fn push(&mut self, service: impl Into<String>) {
        let service = service.into();
        if self.seen.insert(service.clone()) {
            self.order.push(service);
        }
    }

    /// Drain the queue in insertion order.
    pub fn drain(&mut self) -> Vec<String> {
        self.seen.clear();
        std::mem::take(&mut self.order)
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What a single fileset sync did.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Containers stopped (and started again) by cold mode
    pub stopped: Vec<String>,
    /// Whether any file changed
    pub changed: bool,
}

/// Resolve the service names a sync should restart.
///
/// The explicit list needs no daemon: it is deduplicated preserving order,
/// dropping empties. The attached mode enumerates containers mounting the
/// target volume and intersects them with the labeled compose containers.
pub async fn resolve_target_services(
    client: Option<&dyn DaemonClient>,
    fileset: &Fileset,
) -> Result<Vec<String>> {
    let RestartServices { services, attached } = &fileset.restart_services;

    if !attached {
        let mut seen = BTreeSet::new();
        return Ok(services
            .iter()
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect());
    }

    let client = client.ok_or_else(|| {
        Error::precondition(
            "fileset",
            "attached restart targets require a daemon client",
        )
    })?;
    let mounted = client
        .list_containers_using_volume(&fileset.target_volume)
        .await
        .map_err(|e| {
            Error::external(
                "fileset",
                format!("listing containers using {}: {e}", fileset.target_volume),
            )
        })?;
    let labeled = client.list_compose_containers_all().await.map_err(|e| {
        Error::external("fileset", format!("listing compose containers: {e}"))
    })?;

    let mounted: BTreeSet<&str> = mounted.iter().map(String::as_str).collect();
    let services: BTreeSet<String> = labeled
        .iter()
        .filter(|c| mounted.contains(c.name.as_str()))
        .map(|c| c.service.clone())
        .collect();
    Ok(services.into_iter().collect())
}

/// Read the remote index from the volume; absent or unparseable reads as
/// empty. Callers must not invoke this when the volume does not exist yet.
pub async fn read_remote_index(client: &dyn DaemonClient, fileset: &Fileset) -> Index {
    match client
        .read_file_from_volume(&fileset.target_volume, &fileset.target_path, INDEX_FILE_NAME)
        .await
    {
        Ok(content) => parse_index(&content, &fileset.target_path),
        Err(e) => {
            debug!(
                "no readable index in {}:{}, treating as empty: {e}",
                fileset.target_volume, fileset.target_path
            );
            Index::empty(&fileset.target_path)
        }
    }
}

/// Build the tar archive carrying the diff's created and updated files.
///
/// Entry paths are relative; extraction happens under the target path.
pub fn build_archive(fileset: &Fileset, diff: &IndexDiff) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Cursor::new(Vec::new()));
    let mut entries: Vec<&str> = diff.written_paths();
    entries.sort_unstable();
    for rel in entries {
        let source = fileset.source_abs.join(rel);
        builder
            .append_path_with_name(&source, rel)
            .map_err(|e| {
                Error::internal(
                    "fileset",
                    format!("archiving {}: {e}", source.display()),
                )
            })?;
    }
    let cursor = builder
        .into_inner()
        .map_err(|e| Error::internal("fileset", format!("finalizing archive: {e}")))?;
    Ok(cursor.into_inner())
}

/// Synchronize one fileset into its target volume.
///
/// `cache` carries the plan-time indexes and diff when available; otherwise
/// they are recomputed here. Hot-mode restart targets land in
/// `restart_queue`; cold mode handles its own stop/start cycle.
pub async fn sync_fileset(
    client: &dyn DaemonClient,
    name: &str,
    fileset: &Fileset,
    cache: Option<&FilesetCacheEntry>,
    restart_queue: &mut RestartQueue,
) -> Result<SyncOutcome> {
    if fileset.source_abs.as_os_str().is_empty() {
        return Err(Error::invalid_input(
            "fileset",
            format!("fileset {name:?}: sourceAbs must not be empty"),
        ));
    }

    let (local, remote, diff) = match cache {
        Some(entry) => (
            entry.local_index.clone(),
            entry.remote_index.clone(),
            entry.diff.clone(),
        ),
        None => {
            let local =
                build_local_index(&fileset.source_abs, &fileset.target_path, &fileset.exclude)
                    .await?;
            let remote = read_remote_index(client, fileset).await;
            let diff = diff_indexes(&local, &remote);
            (local, remote, diff)
        }
    };

    if local.tree_hash == remote.tree_hash {
        debug!("fileset {name}: contents unchanged, skipping");
        return Ok(SyncOutcome::default());
    }

    let targets = resolve_target_services(Some(client), fileset).await?;

    match fileset.apply_mode {
        ApplyMode::Cold => sync_cold(client, name, fileset, &local, &diff, &targets).await,
        ApplyMode::Hot => {
            transfer(client, name, fileset, &local, &diff).await?;
            for service in &targets {
                restart_queue.push(service.clone());
            }
            Ok(SyncOutcome {
                stopped: Vec::new(),
                changed: true,
            })
        }
    }
}

/// Cold path: stop matching containers, transfer, start them again.
///
/// Whatever happens after the stop, exactly one start attempt is made for
/// the stopped containers before this function returns.
async fn sync_cold(
    client: &dyn DaemonClient,
    name: &str,
    fileset: &Fileset,
    local: &Index,
    diff: &IndexDiff,
    targets: &[String],
) -> Result<SyncOutcome> {
    let stopped = containers_for_services(client, targets).await?;
    if !stopped.is_empty() {
        info!("fileset {name}: stopping {} container(s) for cold sync", stopped.len());
        client.stop_containers(&stopped).await?;
    }

    let transfer_result = transfer(client, name, fileset, local, diff).await;
    let start_result = if stopped.is_empty() {
        Ok(())
    } else {
        client.start_containers(&stopped).await
    };

    match (transfer_result, start_result) {
        (Ok(()), Ok(())) => Ok(SyncOutcome {
            stopped,
            changed: true,
        }),
        (Ok(()), Err(start_err)) => Err(start_err),
        (Err(sync_err), Ok(())) => Err(sync_err),
        (Err(sync_err), Err(start_err)) => Err(Error::aggregate(vec![
            ("sync files".to_string(), sync_err),
            ("restart stopped containers".to_string(), start_err),
        ])),
    }
}

/// Container names backing the given compose services.
async fn containers_for_services(
    client: &dyn DaemonClient,
    services: &[String],
) -> Result<Vec<String>> {
    if services.is_empty() {
        return Ok(Vec::new());
    }
    let all = client.list_compose_containers_all().await?;
    let wanted: BTreeSet<&str> = services.iter().map(String::as_str).collect();
    let mut names: Vec<String> = all
        .into_iter()
        .filter(|c| wanted.contains(c.service.as_str()))
        .map(|c| c.name)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Steps 7..10 of the sync pipeline: extract, delete, write index, apply
/// ownership. The index write comes after the content changes so a failure
/// earlier leaves the previous index (and thus a superset of the work) in
/// place.
async fn transfer(
    client: &dyn DaemonClient,
    name: &str,
    fileset: &Fileset,
    local: &Index,
    diff: &IndexDiff,
) -> Result<()> {
    if !diff.to_create.is_empty() || !diff.to_update.is_empty() {
        let archive = build_archive(fileset, diff)?;
        client
            .extract_tar_to_volume(&fileset.target_volume, &fileset.target_path, archive)
            .await?;
    }

    if !diff.to_delete.is_empty() {
        client
            .remove_paths_from_volume(
                &fileset.target_volume,
                &fileset.target_path,
                &diff.to_delete,
            )
            .await?;
    }

    let serialized = serialize_index(local)?;
    client
        .write_file_to_volume(
            &fileset.target_volume,
            &fileset.target_path,
            INDEX_FILE_NAME,
            &serialized,
        )
        .await?;

    if let Some(ref ownership) = fileset.ownership {
        if let Some(script) =
            build_ownership_script(&fileset.target_path, ownership, &diff.written_paths())?
        {
            let output = client
                .run_volume_script(
                    &fileset.target_volume,
                    &fileset.target_path,
                    &script,
                    &std::collections::BTreeMap::new(),
                )
                .await?;
            if !output.stderr.is_empty() {
                warn!("fileset {name}: ownership script: {}", output.stderr.trim());
            }
        }
    }
    Ok(())
}

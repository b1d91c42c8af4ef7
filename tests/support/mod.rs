//! In-memory daemon used by the integration tests.
//!
//! Holds volumes, volume contents, networks, and compose containers behind a
//! mutex, records every mutating call for ordering assertions, and supports
//! failure injection for the recovery paths.

// shared by several test binaries; not every binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dockform::client::{
    ComposeConfigDoc, ComposeContainer, ComposeInvocation, DaemonClient, NetworkOpts, PsEntry,
    ScriptOutput,
};
use dockform::error::{Error, Result};

/// One container in the mock daemon.
#[derive(Debug, Clone)]
pub struct ContainerRec {
    pub name: String,
    pub project: String,
    pub service: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    pub mounts: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DaemonState {
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
    pub volume_files: BTreeMap<String, BTreeMap<String, String>>,
    pub networks: BTreeSet<String>,
    pub containers: Vec<ContainerRec>,
    pub compose_services: BTreeMap<String, Vec<String>>,
    pub config_hashes: BTreeMap<(String, String), String>,
}

/// Scripted in-memory daemon.
#[derive(Debug, Default)]
pub struct MockDaemon {
    pub state: Mutex<DaemonState>,
    pub calls: Mutex<Vec<String>>,
    pub fail_extract: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_compose_config: AtomicBool,
    pub fail_list_volumes: AtomicBool,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn set_compose_services(&self, project: &str, services: &[&str]) {
        self.state.lock().unwrap().compose_services.insert(
            project.to_string(),
            services.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn set_config_hash(&self, project: &str, service: &str, hash: &str) {
        self.state
            .lock()
            .unwrap()
            .config_hashes
            .insert((project.to_string(), service.to_string()), hash.to_string());
    }

    pub fn add_volume(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(name.to_string(), BTreeMap::new());
        state.volume_files.entry(name.to_string()).or_default();
    }

    pub fn add_container(&self, rec: ContainerRec) {
        self.state.lock().unwrap().containers.push(rec);
    }

    pub fn volume_file(&self, volume: &str, full_path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .volume_files
            .get(volume)
            .and_then(|files| files.get(full_path))
            .cloned()
    }

    pub fn container(&self, name: &str) -> Option<ContainerRec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}

#[async_trait]
impl DaemonClient for MockDaemon {
    async fn list_volumes(&self) -> Result<Vec<String>> {
        self.record("volume.ls".to_string());
        if self.fail_list_volumes.load(Ordering::SeqCst) {
            return Err(Error::external("mock", "volume listing failed"));
        }
        Ok(self.state.lock().unwrap().volumes.keys().cloned().collect())
    }

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.record(format!("volume.create {name}"));
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(name.to_string(), labels.clone());
        state.volume_files.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record(format!("volume.rm {name}"));
        let mut state = self.state.lock().unwrap();
        state.volumes.remove(name);
        state.volume_files.remove(name);
        Ok(())
    }

    async fn read_file_from_volume(
        &self,
        volume: &str,
        target_path: &str,
        rel_file: &str,
    ) -> Result<String> {
        self.record(format!("file.read {volume} {target_path}/{rel_file}"));
        let state = self.state.lock().unwrap();
        let files = state
            .volume_files
            .get(volume)
            .ok_or_else(|| Error::external("mock", format!("no volume {volume}")))?;
        files
            .get(&format!("{target_path}/{rel_file}"))
            .cloned()
            .ok_or_else(|| Error::not_found("mock", format!("no file {rel_file}")))
    }

    async fn write_file_to_volume(
        &self,
        volume: &str,
        target_path: &str,
        rel_file: &str,
        content: &str,
    ) -> Result<()> {
        self.record(format!("file.write {volume} {target_path}/{rel_file}"));
        let mut state = self.state.lock().unwrap();
        let files = state
            .volume_files
            .get_mut(volume)
            .ok_or_else(|| Error::external("mock", format!("no volume {volume}")))?;
        files.insert(format!("{target_path}/{rel_file}"), content.to_string());
        Ok(())
    }

    async fn extract_tar_to_volume(
        &self,
        volume: &str,
        target_path: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        if self.fail_extract.load(Ordering::SeqCst) {
            self.record(format!("tar.extract {volume} FAILED"));
            return Err(Error::external("mock", "tar extraction failed"));
        }
        let mut entries = Vec::new();
        let mut tar = tar::Archive::new(Cursor::new(archive));
        for entry in tar.entries().map_err(|e| Error::external("mock", e.to_string()))? {
            let mut entry = entry.map_err(|e| Error::external("mock", e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| Error::external("mock", e.to_string()))?
                .to_string_lossy()
                .to_string();
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| Error::external("mock", e.to_string()))?;
            entries.push((path, content));
        }
        self.record(format!(
            "tar.extract {volume} [{}]",
            entries
                .iter()
                .map(|(p, _)| p.as_str())
                .collect::<Vec<_>>()
                .join(",")
        ));
        let mut state = self.state.lock().unwrap();
        let files = state
            .volume_files
            .get_mut(volume)
            .ok_or_else(|| Error::external("mock", format!("no volume {volume}")))?;
        for (path, content) in entries {
            files.insert(format!("{target_path}/{path}"), content);
        }
        Ok(())
    }

    async fn remove_paths_from_volume(
        &self,
        volume: &str,
        target_path: &str,
        rel_paths: &[String],
    ) -> Result<()> {
        self.record(format!(
            "paths.remove {volume} [{}]",
            rel_paths.join(",")
        ));
        let mut state = self.state.lock().unwrap();
        if let Some(files) = state.volume_files.get_mut(volume) {
            for rel in rel_paths {
                let full = format!("{target_path}/{rel}");
                files.retain(|path, _| path != &full && !path.starts_with(&format!("{full}/")));
            }
        }
        Ok(())
    }

    async fn run_volume_script(
        &self,
        volume: &str,
        _target_path: &str,
        _script: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<ScriptOutput> {
        self.record(format!("script.run {volume}"));
        Ok(ScriptOutput::default())
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.record("network.ls".to_string());
        Ok(self.state.lock().unwrap().networks.iter().cloned().collect())
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
        _opts: &NetworkOpts,
    ) -> Result<()> {
        self.record(format!("network.create {name}"));
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record(format!("network.rm {name}"));
        self.state.lock().unwrap().networks.remove(name);
        Ok(())
    }

    async fn inspect_network(&self, name: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "Name": name }))
    }

    async fn list_compose_containers_all(&self) -> Result<Vec<ComposeContainer>> {
        self.record("container.ls".to_string());
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|c| ComposeContainer {
                project: c.project.clone(),
                service: c.service.clone(),
                name: c.name.clone(),
            })
            .collect())
    }

    async fn list_containers_using_volume(&self, volume: &str) -> Result<Vec<String>> {
        self.record(format!("container.ls-volume {volume}"));
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|c| c.mounts.iter().any(|m| m == volume))
            .map(|c| c.name.clone())
            .collect())
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.record(format!("container.restart {name}"));
        Ok(())
    }

    async fn stop_containers(&self, names: &[String]) -> Result<()> {
        self.record(format!("container.stop [{}]", names.join(",")));
        let mut state = self.state.lock().unwrap();
        for container in &mut state.containers {
            if names.contains(&container.name) {
                container.running = false;
            }
        }
        Ok(())
    }

    async fn start_containers(&self, names: &[String]) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            self.record(format!("container.start [{}] FAILED", names.join(",")));
            return Err(Error::external("mock", "start failed"));
        }
        self.record(format!("container.start [{}]", names.join(",")));
        let mut state = self.state.lock().unwrap();
        for container in &mut state.containers {
            if names.contains(&container.name) {
                container.running = true;
            }
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<()> {
        self.record(format!("container.rm {name}"));
        self.state
            .lock()
            .unwrap()
            .containers
            .retain(|c| c.name != name);
        Ok(())
    }

    async fn update_container_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record(format!("labels.update {name}"));
        let mut state = self.state.lock().unwrap();
        for container in &mut state.containers {
            if container.name == name {
                container.labels.extend(labels.clone());
            }
        }
        Ok(())
    }

    async fn inspect_container_labels(
        &self,
        name: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, String>> {
        let all = self
            .inspect_multiple_container_labels(&[name.to_string()], keys)
            .await?;
        Ok(all.into_iter().next().map(|(_, v)| v).unwrap_or_default())
    }

    async fn inspect_multiple_container_labels(
        &self,
        names: &[String],
        keys: &[&str],
    ) -> Result<HashMap<String, HashMap<String, String>>> {
        self.record(format!("labels.inspect [{}]", names.join(",")));
        let state = self.state.lock().unwrap();
        let mut result = HashMap::new();
        for container in &state.containers {
            if !names.contains(&container.name) {
                continue;
            }
            let selected: HashMap<String, String> = container
                .labels
                .iter()
                .filter(|(k, _)| keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            result.insert(container.name.clone(), selected);
        }
        Ok(result)
    }

    async fn compose_config_services(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<Vec<String>> {
        self.record(format!("compose.services {}", invocation.project_name));
        if self.fail_compose_config.load(Ordering::SeqCst) {
            return Err(Error::external("mock", "compose config failed"));
        }
        let state = self.state.lock().unwrap();
        let mut services = state
            .compose_services
            .get(&invocation.project_name)
            .cloned()
            .unwrap_or_default();
        services.sort();
        Ok(services)
    }

    async fn compose_config_full(
        &self,
        invocation: &ComposeInvocation,
    ) -> Result<ComposeConfigDoc> {
        let services = self.compose_config_services(invocation).await?;
        Ok(ComposeConfigDoc {
            services: services
                .into_iter()
                .map(|s| (s, serde_json::json!({})))
                .collect(),
        })
    }

    async fn compose_config_hash(
        &self,
        invocation: &ComposeInvocation,
        service: &str,
        identifier: &str,
    ) -> Result<String> {
        let hashes = self
            .compose_config_hashes(invocation, &[service.to_string()], identifier)
            .await?;
        hashes
            .get(service)
            .cloned()
            .ok_or_else(|| Error::not_found("mock", format!("no hash for {service}")))
    }

    async fn compose_config_hashes(
        &self,
        invocation: &ComposeInvocation,
        services: &[String],
        _identifier: &str,
    ) -> Result<HashMap<String, String>> {
        self.record(format!("compose.hashes {}", invocation.project_name));
        let state = self.state.lock().unwrap();
        Ok(services
            .iter()
            .filter_map(|s| {
                state
                    .config_hashes
                    .get(&(invocation.project_name.clone(), s.clone()))
                    .map(|h| (s.clone(), h.clone()))
            })
            .collect())
    }

    async fn compose_ps(
        &self,
        _invocation: &ComposeInvocation,
        project: &str,
    ) -> Result<Vec<PsEntry>> {
        self.record(format!("compose.ps {project}"));
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|c| c.project == project)
            .map(|c| PsEntry {
                name: c.name.clone(),
                service: c.service.clone(),
            })
            .collect())
    }

    async fn compose_up(&self, _invocation: &ComposeInvocation, project: &str) -> Result<()> {
        self.record(format!("compose.up {project}"));
        let mut state = self.state.lock().unwrap();
        let services = state
            .compose_services
            .get(project)
            .cloned()
            .unwrap_or_default();
        for service in services {
            let hash = state
                .config_hashes
                .get(&(project.to_string(), service.clone()))
                .cloned()
                .unwrap_or_default();
            let name = format!("{project}-{service}-1");
            match state.containers.iter().position(|c| c.name == name) {
                Some(i) => {
                    let container = &mut state.containers[i];
                    container.running = true;
                    container
                        .labels
                        .insert("com.docker.compose.config-hash".to_string(), hash);
                }
                None => state.containers.push(ContainerRec {
                    name,
                    project: project.to_string(),
                    service,
                    labels: BTreeMap::from([(
                        "com.docker.compose.config-hash".to_string(),
                        hash,
                    )]),
                    running: true,
                    mounts: Vec::new(),
                }),
            }
        }
        Ok(())
    }
}

//! Pod Unmounter (component I): drains helper pods marked for termination
//! and garbage-collects orphaned source mounts, both on helper-pod events
//! and on a periodic sweep (spec §4.I).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::error::Result;
use crate::locks::LockTable;
use crate::mount;
use crate::paths::HelperPodHostPaths;
use crate::watcher::HelperPodWatcher;

/// Annotation the controller sets on a helper pod to request teardown.
const NEEDS_UNMOUNT_ANNOTATION: &str = "s3.csi.aws.com/needs-unmount";
const PERIODIC_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct PodUnmounter {
    config: Config,
    watcher: Arc<HelperPodWatcher>,
    locks: Arc<LockTable>,
    sweeping: tokio::sync::Mutex<()>,
}

impl PodUnmounter {
    pub fn new(config: Config, watcher: Arc<HelperPodWatcher>, locks: Arc<LockTable>) -> Self {
        PodUnmounter { config, watcher, locks, sweeping: tokio::sync::Mutex::new(()) }
    }

    /// Runs the event-driven handler and the periodic reaper until `stop` fires.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let event_task = {
            let this = self.clone();
            let mut stop = stop.clone();
            let mut events = this.watcher.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return;
                            }
                        }
                        event = events.recv() => {
                            match event {
                                Ok(pod) => this.handle_pod_event(&pod).await,
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                            }
                        }
                    }
                }
            })
        };

        let sweep_task = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PERIODIC_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        biased;
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return;
                            }
                        }
                        _ = interval.tick() => {
                            this.periodic_sweep().await;
                        }
                    }
                }
            })
        };

        let _ = tokio::join!(event_task, sweep_task);
    }

    #[instrument(level = "debug", skip(self, pod), fields(pod = ?pod.metadata.name))]
    async fn handle_pod_event(&self, pod: &Pod) {
        if !is_local(pod, &self.config.node_name) || !needs_unmount(pod) {
            return;
        }
        let Some(name) = pod.metadata.name.clone() else { return };
        let Some(uid) = pod.metadata.uid.clone() else { return };
        if let Err(e) = self.unmount_helper_pod(&name, &uid).await {
            warn!(helper_pod = %name, error = %e, "event-driven unmount of helper pod failed");
        }
    }

    /// Unmount flow for one helper pod (spec §4.I): acquire its lock, ask
    /// the helper process to exit cleanly, unmount and remove its source,
    /// then remove every credential artifact this helper pod ever
    /// received. `Cleanup` is scoped per `(pod, volume)` prefix and the
    /// whole directory is going away with the helper pod, so this removes
    /// the directory outright rather than guessing a prefix.
    #[instrument(level = "info", skip(self), fields(helper_pod = %name))]
    async fn unmount_helper_pod(&self, name: &str, uid: &str) -> Result<()> {
        let _guard = self.locks.lock(name).await;

        let host_paths = HelperPodHostPaths::new(&self.config, uid);
        std::fs::write(host_paths.mount_exit(), b"").ok();

        let source = crate::paths::source_mount_path(&self.config, name);
        if let Err(e) = mount::unmount(&source) {
            warn!(helper_pod = %name, error = %e, "unmount of source mount failed, removing directory anyway");
        }
        let _ = std::fs::remove_dir(&source);

        match std::fs::remove_dir_all(host_paths.credentials_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::error::MountError::from(e).with_helper_pod(name)),
        }
    }

    /// Enumerates the source-mount root; for each entry with no
    /// corresponding live helper pod, unmounts and removes it. For entries
    /// whose helper pod carries the teardown annotation, runs the per-pod
    /// unmount flow. Serialized by a try-lock so overlapping ticks skip
    /// rather than queue (spec §4.I).
    async fn periodic_sweep(&self) {
        let Ok(_guard) = self.sweeping.try_lock() else {
            return;
        };

        let root = self.config.source_mount_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "listing source mount root failed");
                return;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().to_string();

            match self.watcher.get(&name) {
                None => {
                    if let Err(e) = self.remove_orphaned_source(&entry.path()) {
                        warn!(helper_pod = %name, error = %e, "removing orphaned source mount failed");
                    }
                }
                Some(pod) if needs_unmount(&pod) => {
                    let Some(uid) = pod.metadata.uid.clone() else { continue };
                    if let Err(e) = self.unmount_helper_pod(&name, &uid).await {
                        warn!(helper_pod = %name, error = %e, "periodic unmount of helper pod failed");
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn remove_orphaned_source(&self, source: &Path) -> Result<()> {
        if let Err(e) = mount::unmount(source) {
            warn!(source = %source.display(), error = %e, "unmount of orphaned source failed, removing directory anyway");
        }
        std::fs::remove_dir(source).or_else(|e| if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) })?;
        Ok(())
    }
}

fn is_local(pod: &Pod, node_name: &str) -> bool {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
}

fn needs_unmount(pod: &Pod) -> bool {
    pod.metadata.annotations.as_ref().and_then(|a| a.get(NEEDS_UNMOUNT_ANNOTATION)).map(String::as_str) == Some("true")
}

#[cfg(test)]
mod test {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn annotated_pod(node_name: Option<&str>, needs_unmount_value: Option<&str>) -> Pod {
        use k8s_openapi::api::core::v1::PodSpec;
        use std::collections::BTreeMap;
        Pod {
            metadata: ObjectMeta {
                annotations: needs_unmount_value
                    .map(|v| BTreeMap::from([(NEEDS_UNMOUNT_ANNOTATION.to_string(), v.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec { node_name: node_name.map(String::from), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn needs_unmount_requires_exact_true_annotation_value() {
        assert!(needs_unmount(&annotated_pod(Some("node-1"), Some("true"))));
        assert!(!needs_unmount(&annotated_pod(Some("node-1"), Some("false"))));
        assert!(!needs_unmount(&annotated_pod(Some("node-1"), None)));
    }

    #[test]
    fn is_local_matches_spec_node_name() {
        assert!(is_local(&annotated_pod(Some("node-1"), Some("true")), "node-1"));
        assert!(!is_local(&annotated_pod(Some("node-2"), Some("true")), "node-1"));
    }
}

//! Helper-pod watcher (component E): a shared informer over helper pods on
//! the local node, exposing a lister cache plus a one-shot `Wait` for a
//! named pod to reach `Running`.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::{broadcast, watch};
use tracing::{instrument, warn};

use crate::error::{MountError, Result};

/// Broadcast channel capacity for fanned-out pod events. Sized generously;
/// a slow `AddEventHandler` subscriber only misses old events, it never
/// blocks the informer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared informer over helper pods scoped to `(namespace, spec.nodeName)`.
pub struct HelperPodWatcher {
    store: Store<Pod>,
    writer: Mutex<Option<reflector::store::Writer<Pod>>>,
    events: broadcast::Sender<Arc<Pod>>,
    namespace: String,
}

impl HelperPodWatcher {
    pub fn new(namespace: &str) -> Self {
        let (store, writer) = reflector::store::<Pod>();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        HelperPodWatcher { store, writer: Mutex::new(Some(writer)), events, namespace: namespace.to_string() }
    }

    /// Launches the informer and blocks until its cache syncs. Returns a
    /// cache-desync error if `stop` fires before the first sync completes.
    /// Must be called at most once per watcher.
    #[instrument(level = "info", skip(self, client, stop), fields(namespace = %self.namespace))]
    pub async fn start(&self, client: Client, node_name: &str, mut stop: watch::Receiver<bool>) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .expect("writer mutex poisoned")
            .take()
            .ok_or_else(|| MountError::internal("watcher.start", "start called more than once"))?;

        let api: Api<Pod> = Api::namespaced(client, &self.namespace);
        let config = WatcherConfig::default().fields(&format!("spec.nodeName={node_name}"));
        let events = self.events.clone();
        let mut stream = reflector::reflector(writer, watcher::watcher(api, config)).default_backoff().applied_objects().boxed();

        let store_ready = self.store.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(pod)) => {
                                let _ = events.send(Arc::new(pod));
                            }
                            Some(Err(e)) => warn!(error = %e, "helper pod watch stream error"),
                            None => return,
                        }
                    }
                }
            }
        });

        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return Err(MountError::internal("watcher.start", "stop signalled before helper pod cache synced"));
                }
                Ok(())
            }
            _ = store_ready.wait_until_ready() => Ok(()),
        }
    }

    pub fn store(&self) -> &Store<Pod> {
        &self.store
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pod>> {
        self.store.get(&ObjectRef::new(name).within(&self.namespace))
    }

    pub fn list(&self) -> Vec<Arc<Pod>> {
        self.store.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Pod>> {
        self.events.subscribe()
    }

    /// Checks the cache first; if the pod isn't already `Running`, blocks
    /// until a matching event arrives or `deadline` elapses (spec §4.E).
    #[instrument(level = "debug", skip(self), fields(pod = %name))]
    pub async fn wait_running(&self, name: &str, deadline: std::time::Duration) -> Result<Arc<Pod>> {
        if let Some(pod) = self.get(name) {
            if is_running(&pod) {
                return Ok(pod);
            }
        }

        let seen_at_all = self.get(name).is_some();
        let mut rx = self.subscribe();
        let result = tokio::time::timeout(deadline, async {
            loop {
                match rx.recv().await {
                    Ok(pod) if pod.metadata.name.as_deref() == Some(name) => {
                        if is_running(&pod) {
                            return Some(pod);
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match result {
            Ok(Some(pod)) => Ok(pod),
            Ok(None) | Err(_) => {
                if seen_at_all || self.get(name).is_some() {
                    Err(MountError::not_ready("watcher.wait", format!("helper pod {name} observed but never reached Running")))
                } else {
                    Err(MountError::not_found("watcher.wait", format!("helper pod {name} was never observed")))
                }
            }
        }
    }
}

/// Readiness predicate (spec §4.E): pod phase equals `Running`. Container
/// readiness conditions are intentionally not consulted.
fn is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

#[cfg(test)]
mod test {
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(name: &str, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            status: Some(PodStatus { phase: phase.map(String::from), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn is_running_requires_exact_running_phase() {
        assert!(is_running(&pod("mp-1", Some("Running"))));
        assert!(!is_running(&pod("mp-1", Some("Pending"))));
        assert!(!is_running(&pod("mp-1", None)));
    }
}

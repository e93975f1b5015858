use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event as K8sEvent, Pod};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::model::PodCorrelation;
use crate::normalize::{normalize_image_ref, parse_pulled_message, parse_pulling_message};

/// Fixed backoff between watch-loop restarts (§5).
const WATCH_RESTART_BACKOFF: Duration = Duration::from_secs(5);
/// How often the `pullingByNode` sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Entries older than this are dropped by the sweep even without a paired
/// "pulled" event.
const PULLING_STALE_TTL: Duration = Duration::from_secs(10 * 60);

struct CorrelatorState {
    /// key = `{node}:{canonical image}` → correlation entries, insertion order.
    pods_by_image: HashMap<String, Vec<PodCorrelation>>,
    /// node → image ref (as reported, not normalized) → event time.
    pulling_by_node: HashMap<String, HashMap<String, Instant>>,
}

/// Maintains, per (node, canonical image), the set of waiting pods and the
/// set of images currently being pulled on each node (C3). Guarded by a
/// single reader/writer lock; aggregator callers take only the read side.
#[derive(Clone)]
pub struct WorkloadCorrelator {
    state: Arc<tokio::sync::RwLock<CorrelatorState>>,
}

impl Default for WorkloadCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadCorrelator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(tokio::sync::RwLock::new(CorrelatorState {
                pods_by_image: HashMap::new(),
                pulling_by_node: HashMap::new(),
            })),
        }
    }

    /// Spawn the pod watcher, event watcher, and stale-entry sweep as
    /// independent supervised tasks. Each restarts itself on failure.
    pub fn spawn(&self, client: Client, namespaces: Vec<String>) {
        let pods = self.clone();
        let pod_namespaces = namespaces.clone();
        tokio::spawn(async move { pods.run_pod_watch(client.clone(), pod_namespaces).await });

        let events = self.clone();
        let event_namespaces = namespaces;
        tokio::spawn(async move { events.run_event_watch(client, event_namespaces).await });

        let sweep = self.clone();
        tokio::spawn(async move { sweep.run_sweep().await });
    }

    async fn run_pod_watch(&self, client: Client, namespaces: Vec<String>) {
        loop {
            let result = self.watch_pods_once(client.clone(), &namespaces).await;
            if let Err(err) = result {
                warn!(error = %err, "pod watch failed, restarting after backoff");
            }
            tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
        }
    }

    async fn watch_pods_once(
        &self,
        client: Client,
        namespaces: &[String],
    ) -> Result<(), kube::Error> {
        let apis: Vec<Api<Pod>> = if namespaces.is_empty() {
            vec![Api::all(client)]
        } else {
            namespaces
                .iter()
                .map(|ns| Api::namespaced(client.clone(), ns))
                .collect()
        };

        let mut streams: Vec<_> = apis
            .into_iter()
            .map(|api| Box::pin(watcher::watcher(api, watcher::Config::default())))
            .collect();

        // Drain all namespace watches concurrently; any stream error bubbles
        // up and triggers the outer restart-with-backoff loop.
        loop {
            for stream in streams.iter_mut() {
                match stream.next().await {
                    Some(Ok(Event::Apply(pod))) | Some(Ok(Event::InitApply(pod))) => {
                        self.update_pod(&pod).await;
                    }
                    Some(Ok(Event::Delete(pod))) => {
                        self.remove_pod_obj(&pod).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(kube::Error::Service(Box::new(e))),
                    None => return Ok(()),
                }
            }
        }
    }

    async fn run_event_watch(&self, client: Client, namespaces: Vec<String>) {
        loop {
            let result = self.watch_events_once(client.clone(), &namespaces).await;
            if let Err(err) = result {
                warn!(error = %err, "event watch failed, restarting after backoff");
            }
            tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
        }
    }

    async fn watch_events_once(
        &self,
        client: Client,
        namespaces: &[String],
    ) -> Result<(), kube::Error> {
        let apis: Vec<Api<K8sEvent>> = if namespaces.is_empty() {
            vec![Api::all(client)]
        } else {
            namespaces
                .iter()
                .map(|ns| Api::namespaced(client.clone(), ns))
                .collect()
        };

        let mut streams: Vec<_> = apis
            .into_iter()
            .map(|api| Box::pin(watcher::watcher(api, watcher::Config::default())))
            .collect();

        loop {
            for stream in streams.iter_mut() {
                match stream.next().await {
                    Some(Ok(Event::Apply(event))) | Some(Ok(Event::InitApply(event))) => {
                        self.handle_event(&event).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(kube::Error::Service(Box::new(e))),
                    None => return Ok(()),
                }
            }
        }
    }

    async fn run_sweep(&self) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // first tick is immediate — skip it
        loop {
            interval.tick().await;
            self.sweep_stale_pulling(Instant::now(), PULLING_STALE_TTL)
                .await;
        }
    }

    async fn update_pod(&self, pod: &Pod) {
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            return;
        };
        let Some(meta_name) = pod.metadata.name.clone() else {
            return;
        };
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".into());

        let mut entries = Vec::new();
        if let Some(status) = &pod.status {
            for statuses in [&status.init_container_statuses, &status.container_statuses]
                .into_iter()
                .flatten()
            {
                for cs in statuses {
                    let waiting = cs
                        .state
                        .as_ref()
                        .and_then(|s| s.waiting.as_ref())
                        .and_then(|w| w.reason.as_deref());
                    if waiting == Some("ContainerCreating") {
                        entries.push(PodCorrelation {
                            namespace: namespace.clone(),
                            pod: meta_name.clone(),
                            container: cs.name.clone(),
                            image: cs.image.clone(),
                        });
                    }
                }
            }
        }

        let mut state = self.state.write().await;
        remove_pod_entries(&mut state.pods_by_image, &namespace, &meta_name);
        for entry in entries {
            let canonical = normalize_image_ref(&entry.image);
            let key = format!("{node_name}:{canonical}");
            state.pods_by_image.entry(key).or_default().push(entry);
        }
    }

    async fn remove_pod_obj(&self, pod: &Pod) {
        let Some(meta_name) = pod.metadata.name.clone() else {
            return;
        };
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".into());
        let mut state = self.state.write().await;
        remove_pod_entries(&mut state.pods_by_image, &namespace, &meta_name);
    }

    async fn handle_event(&self, event: &K8sEvent) {
        let involved_kind = event.involved_object.kind.as_deref();
        if involved_kind != Some("Pod") {
            return;
        }
        let Some(node) = event.source.as_ref().and_then(|s| s.host.clone()) else {
            return;
        };
        let reason = event.reason.as_deref();
        let message = event.message.as_deref().unwrap_or("");

        match reason {
            Some("Pulling") => {
                if let Some(image_ref) = parse_pulling_message(message) {
                    self.add_pulling_image(&node, image_ref).await;
                }
            }
            Some("Pulled") => {
                if let Some(image_ref) = parse_pulled_message(message) {
                    self.remove_pulling_image(&node, &image_ref).await;
                }
            }
            _ => {}
        }
    }

    async fn add_pulling_image(&self, node: &str, image_ref: String) {
        let mut state = self.state.write().await;
        state
            .pulling_by_node
            .entry(node.to_string())
            .or_default()
            .insert(image_ref, Instant::now());
    }

    async fn remove_pulling_image(&self, node: &str, image_ref: &str) {
        let mut state = self.state.write().await;
        if let Some(map) = state.pulling_by_node.get_mut(node) {
            map.remove(image_ref);
        }
    }

    async fn sweep_stale_pulling(&self, now: Instant, ttl: Duration) {
        let mut state = self.state.write().await;
        let mut evicted = 0usize;
        for map in state.pulling_by_node.values_mut() {
            let before = map.len();
            map.retain(|_, at| now.saturating_duration_since(*at) < ttl);
            evicted += before - map.len();
        }
        state.pulling_by_node.retain(|_, map| !map.is_empty());
        if evicted > 0 {
            debug!(evicted, "swept stale pulling-by-node entries");
        }
    }

    /// Normalized lookup: pods currently waiting on `image_ref` on `node`.
    pub async fn pods_for_image(&self, node: &str, image_ref: &str) -> Vec<PodCorrelation> {
        let canonical = normalize_image_ref(image_ref);
        let key = format!("{node}:{canonical}");
        let state = self.state.read().await;
        state.pods_by_image.get(&key).cloned().unwrap_or_default()
    }

    /// Image refs the runtime reports as actively being pulled on `node`.
    pub async fn pulling_images_for_node(&self, node: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .pulling_by_node
            .get(node)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Images with at least one pod waiting on them, on `node`.
    pub async fn waiting_images_for_node(&self, node: &str) -> Vec<String> {
        let prefix = format!("{node}:");
        let state = self.state.read().await;
        state
            .pods_by_image
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }
}

fn remove_pod_entries(
    pods_by_image: &mut HashMap<String, Vec<PodCorrelation>>,
    namespace: &str,
    pod_name: &str,
) {
    for entries in pods_by_image.values_mut() {
        entries.retain(|e| !(e.namespace == namespace && e.pod == pod_name));
    }
    pods_by_image.retain(|_, v| !v.is_empty());
}

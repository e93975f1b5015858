use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::LiveViewError;
use crate::model::PullEvent;

/// Maximum number of simultaneously connected SSE viewers.
pub const MAX_VIEWERS: usize = 256;
/// Per-viewer bounded queue depth. A slow viewer drops frames rather than
/// blocking the broadcaster (§4.6).
pub const VIEWER_QUEUE_DEPTH: usize = 64;

struct Viewer {
    tx: mpsc::Sender<PullEvent>,
}

/// Tracks connected live-view subscribers and fans out pull events to them.
/// Guarded by its own mutex, distinct from the aggregator's lock; `broadcast`
/// is only ever called after the aggregator lock has been released.
#[derive(Clone)]
pub struct ViewerRegistry {
    viewers: Arc<tokio::sync::Mutex<HashMap<Uuid, Viewer>>>,
    count: Arc<AtomicUsize>,
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self {
            viewers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Register a new viewer, returning its receiver for the SSE stream and a
    /// guard that deregisters it on drop. Rejects the connection once
    /// `MAX_VIEWERS` is reached.
    pub async fn register(&self) -> Result<(Uuid, mpsc::Receiver<PullEvent>, ViewerGuard), LiveViewError> {
        if self.count.load(Ordering::Relaxed) >= MAX_VIEWERS {
            return Err(LiveViewError::AtCapacity);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE_DEPTH);
        {
            let mut viewers = self.viewers.lock().await;
            viewers.insert(id, Viewer { tx });
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        debug!(viewer = %id, total = self.viewer_count(), "viewer connected");

        let guard = ViewerGuard {
            id,
            registry: self.clone(),
        };
        Ok((id, rx, guard))
    }

    async fn deregister(&self, id: Uuid) {
        let mut viewers = self.viewers.lock().await;
        if viewers.remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Send one event to every connected viewer. Never awaits on a full
    /// queue — a viewer that cannot keep up simply misses the frame.
    pub async fn broadcast(&self, event: &PullEvent) {
        let viewers = self.viewers.lock().await;
        for viewer in viewers.values() {
            if viewer.tx.try_send(event.clone()).is_err() {
                // Either full (slow viewer, drop) or closed (reaper will
                // deregister it shortly); either way, never block here.
            }
        }
    }
}

/// Deregisters a viewer from its registry when the SSE connection ends.
pub struct ViewerGuard {
    id: Uuid,
    registry: ViewerRegistry,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let id = self.id;
        tokio::spawn(async move {
            registry.deregister(id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PullEventType, PullRecord};

    fn sample_event() -> PullEvent {
        PullEvent::progress(PullRecord {
            id: "r1".into(),
            node: "n1".into(),
            image_ref: "nginx:latest".into(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            total_bytes: 10,
            downloaded_bytes: 5,
            percent: 50.0,
            bytes_per_sec: 1.0,
            eta_seconds: None,
            layer_count: 1,
            layers_done: 0,
            total_known: true,
            layers: vec![],
            pods: vec![],
        })
    }

    #[tokio::test]
    async fn registered_viewer_receives_broadcast() {
        let registry = ViewerRegistry::new();
        let (_, mut rx, _guard) = registry.register().await.unwrap();
        registry.broadcast(&sample_event()).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, PullEventType::Progress);
    }

    #[tokio::test]
    async fn full_queue_drops_rather_than_blocks() {
        let registry = ViewerRegistry::new();
        let (_, mut rx, _guard) = registry.register().await.unwrap();
        for _ in 0..(VIEWER_QUEUE_DEPTH + 10) {
            registry.broadcast(&sample_event()).await;
        }
        // Should not hang; queue caps at VIEWER_QUEUE_DEPTH.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= VIEWER_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn registry_rejects_past_capacity() {
        let registry = ViewerRegistry::new();
        let mut guards = Vec::new();
        for _ in 0..MAX_VIEWERS {
            guards.push(registry.register().await.unwrap());
        }
        assert!(registry.register().await.is_err());
    }

    #[tokio::test]
    async fn dropping_guard_deregisters_viewer() {
        let registry = ViewerRegistry::new();
        let (_, _rx, guard) = registry.register().await.unwrap();
        assert_eq!(registry.viewer_count(), 1);
        drop(guard);
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(registry.viewer_count(), 0);
    }
}

//! Fan-out of visualization payloads to connected viewers.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Identifies one registered viewer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

/// Payloads a viewer may have queued before it counts as stalled.
pub const VIEWER_QUEUE_DEPTH: usize = 16;

/// Outgoing half of a viewer connection. The socket writer drains the
/// matching receiver; a closed or full queue means the viewer is gone.
pub type ViewerSink = mpsc::Sender<String>;

#[derive(Default)]
struct HubState {
    viewers: Vec<(ViewerId, ViewerSink)>,
    last_visualization: Option<String>,
}

/// Connected viewers plus the most recent payload, replayed to late joiners.
#[derive(Default)]
pub struct ViewerHub {
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

impl ViewerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer and sync it with the latest visualization, if any.
    pub async fn connect(&self, sink: ViewerSink) -> ViewerId {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().await;
        if let Some(last) = &state.last_visualization {
            if let Err(e) = sink.try_send(last.clone()) {
                debug!(?id, "Viewer not registered, replay failed: {}", e);
                return id;
            }
        }
        state.viewers.push((id, sink));
        info!(?id, viewers = state.viewers.len(), "Viewer connected");
        id
    }

    /// Unregister a viewer. Unknown ids are ignored.
    pub async fn disconnect(&self, id: ViewerId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.viewers.len();
        state.viewers.retain(|(viewer, _)| *viewer != id);
        let removed = state.viewers.len() != before;
        if removed {
            info!(?id, viewers = state.viewers.len(), "Viewer disconnected");
        }
        removed
    }

    /// Send `payload` to every viewer in registration order and remember it.
    ///
    /// Never waits on a viewer. Viewers whose queue is closed or full are
    /// dropped; the rest still receive the payload. Returns the number of
    /// viewers reached.
    pub async fn broadcast(&self, payload: String) -> usize {
        let mut state = self.state.lock().await;
        state.viewers.retain(|(id, sink)| match sink.try_send(payload.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(?id, "Dropping viewer after failed send: {}", e);
                false
            }
        });
        let reached = state.viewers.len();
        state.last_visualization = Some(payload);
        debug!(reached, "Broadcast visualization");
        reached
    }

    /// Drop every viewer sink so their sockets close.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        let closed = state.viewers.len();
        state.viewers.clear();
        if closed > 0 {
            info!(closed, "Closed viewer connections");
        }
    }

    pub async fn viewers(&self) -> Vec<ViewerId> {
        self.state.lock().await.viewers.iter().map(|(id, _)| *id).collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.viewers.len()
    }

    pub async fn last_visualization(&self) -> Option<String> {
        self.state.lock().await.last_visualization.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn channel() -> (ViewerSink, mpsc::Receiver<String>) {
        mpsc::channel(VIEWER_QUEUE_DEPTH)
    }

    #[tokio::test]
    async fn membership_tracks_connects_minus_disconnects_in_order() {
        let hub = ViewerHub::new();
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let (c, _rc) = channel();
        let ia = hub.connect(a).await;
        let ib = hub.connect(b).await;
        let ic = hub.connect(c).await;

        assert!(hub.disconnect(ib).await);
        assert_eq!(hub.viewers().await, vec![ia, ic]);

        let (d, _rd) = channel();
        let id = hub.connect(d).await;
        assert_eq!(hub.viewers().await, vec![ia, ic, id]);
    }

    #[tokio::test]
    async fn disconnect_twice_is_a_no_op() {
        let hub = ViewerHub::new();
        let (a, _ra) = channel();
        let ia = hub.connect(a).await;
        assert!(hub.disconnect(ia).await);
        assert!(!hub.disconnect(ia).await);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn new_viewer_gets_nothing_before_first_broadcast() {
        let hub = ViewerHub::new();
        let (a, mut ra) = channel();
        hub.connect(a).await;
        assert_eq!(ra.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn late_joiner_gets_only_the_last_payload() {
        let hub = ViewerHub::new();
        hub.broadcast("first".into()).await;
        hub.broadcast("second".into()).await;

        let (late, mut rl) = channel();
        hub.connect(late).await;
        assert_eq!(rl.try_recv().unwrap(), "second");
        assert_eq!(rl.try_recv(), Err(TryRecvError::Empty));

        hub.broadcast("third".into()).await;
        assert_eq!(rl.try_recv().unwrap(), "third");
    }

    #[tokio::test]
    async fn failed_viewer_is_dropped_without_affecting_others() {
        let hub = ViewerHub::new();
        let (a, mut ra) = channel();
        let (b, rb) = channel();
        let (c, mut rc) = channel();
        let ia = hub.connect(a).await;
        hub.connect(b).await;
        let ic = hub.connect(c).await;
        drop(rb);

        assert_eq!(hub.broadcast("spec".into()).await, 2);
        assert_eq!(ra.try_recv().unwrap(), "spec");
        assert_eq!(rc.try_recv().unwrap(), "spec");
        assert_eq!(hub.viewers().await, vec![ia, ic]);
        assert_eq!(hub.last_visualization().await.as_deref(), Some("spec"));
    }

    #[tokio::test]
    async fn stalled_viewer_is_dropped_once_its_queue_fills() {
        let hub = ViewerHub::new();
        let (stalled, _held) = channel();
        let (live, mut rl) = channel();
        hub.connect(stalled).await;
        let il = hub.connect(live).await;

        for n in 0..=VIEWER_QUEUE_DEPTH {
            hub.broadcast(format!("spec {n}")).await;
            assert_eq!(rl.try_recv().unwrap(), format!("spec {n}"));
        }
        assert_eq!(hub.viewers().await, vec![il]);
    }

    #[tokio::test]
    async fn replay_into_a_full_queue_does_not_register() {
        let hub = ViewerHub::new();
        hub.broadcast("spec".into()).await;

        let (tx, _rx) = mpsc::channel(1);
        tx.try_send("backlog".to_string()).unwrap();
        hub.connect(tx).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn close_all_ends_viewer_channels() {
        let hub = ViewerHub::new();
        let (a, mut ra) = channel();
        hub.connect(a).await;
        hub.close_all().await;
        assert_eq!(hub.connection_count().await, 0);
        assert_eq!(ra.recv().await, None);
    }
}

//! Viewer web server lifecycle: port acquisition, serving and shutdown.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::ServerError;
use crate::http_server;
use crate::hub::ViewerHub;
use crate::ports::{PortCoordinator, LOCALHOST};
use crate::state::AppState;

/// Upper bound on waiting for in-flight requests during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Idle,
    Starting,
    /// This process owns the port and serves viewers.
    Serving { port: u16 },
    /// A sibling instance owns the port; visualizations reach its server.
    Shared { port: u16 },
    Stopping,
}

/// Result of a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Serving { port: u16 },
    Shared { port: u16 },
}

struct Running {
    port: u16,
    shutdown_tx: oneshot::Sender<()>,
    serve_task: JoinHandle<io::Result<()>>,
    refresh_task: JoinHandle<()>,
}

struct Lifecycle {
    status: ServerStatus,
    running: Option<Running>,
}

/// Owns the viewer web server for this process.
pub struct ServerController {
    coordinator: PortCoordinator,
    hub: Arc<ViewerHub>,
    lock_duration: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl ServerController {
    pub fn new(coordinator: PortCoordinator, hub: Arc<ViewerHub>, lock_duration: Duration) -> Self {
        Self {
            coordinator,
            hub,
            lock_duration,
            lifecycle: Mutex::new(Lifecycle {
                status: ServerStatus::Idle,
                running: None,
            }),
        }
    }

    pub fn hub(&self) -> &Arc<ViewerHub> {
        &self.hub
    }

    pub async fn status(&self) -> ServerStatus {
        self.lifecycle.lock().await.status
    }

    /// Start serving on `port` unless a sibling instance already does.
    ///
    /// A sibling on the same port is not an error: the controller enters
    /// shared mode and the caller carries on. A foreign service on the port,
    /// or a failed bind, is returned as an error.
    pub async fn start(&self, port: u16) -> Result<StartOutcome, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.status {
            ServerStatus::Serving { port } => return Ok(StartOutcome::Serving { port }),
            ServerStatus::Shared { port } => return Ok(StartOutcome::Shared { port }),
            _ => {}
        }
        lifecycle.status = ServerStatus::Starting;

        match self.coordinator.acquire(port) {
            Ok(()) => {}
            Err(e @ ServerError::DuplicateInstanceOnSamePort { .. }) => {
                warn!("Skipping start of viewer web server on port {}: {}", port, e);
                info!(
                    "Some agent hosts launch every tool server twice. The duplicate instance keeps \
                     running and shares the viewer web server started by the first instance."
                );
                lifecycle.status = ServerStatus::Shared { port };
                return Ok(StartOutcome::Shared { port });
            }
            Err(e) => {
                lifecycle.status = ServerStatus::Idle;
                return Err(e);
            }
        }

        let listener = match TcpListener::bind((LOCALHOST, port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.coordinator.release(port);
                lifecycle.status = ServerStatus::Idle;
                return Err(ServerError::Bind { port, source });
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = http_server::router(AppState::new(self.hub.clone(), port));
        info!("Starting viewer web server on http://{}:{}", LOCALHOST, port);
        let serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        let refresh_task = spawn_lock_refresh(self.coordinator.clone(), port, self.lock_duration);

        lifecycle.running = Some(Running {
            port,
            shutdown_tx,
            serve_task,
            refresh_task,
        });
        lifecycle.status = ServerStatus::Serving { port };
        Ok(StartOutcome::Serving { port })
    }

    /// Stop serving and give the port back. Safe to call in any state and
    /// any number of times.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = lifecycle.running.take();
        lifecycle.status = ServerStatus::Stopping;

        if let Some(running) = running {
            info!(port = running.port, "Shutting down viewer web server");
            self.hub.close_all().await;
            let _ = running.shutdown_tx.send(());

            let mut serve_task = running.serve_task;
            match timeout(DRAIN_TIMEOUT, &mut serve_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Viewer web server exited with error: {}", e),
                Ok(Err(e)) => warn!("Viewer web server task failed: {}", e),
                Err(_) => {
                    warn!("Viewer web server did not drain in time, aborting");
                    serve_task.abort();
                }
            }

            running.refresh_task.abort();
            self.coordinator.release(running.port);
        }

        lifecycle.status = ServerStatus::Idle;
        info!("Viewer web server shutdown complete");
    }
}

/// Keep the port lock from expiring while the server runs.
fn spawn_lock_refresh(coordinator: PortCoordinator, port: u16, lock_duration: Duration) -> JoinHandle<()> {
    let period = (lock_duration / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the lock was just written.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let coordinator = coordinator.clone();
            let result = tokio::task::spawn_blocking(move || coordinator.refresh(port)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(port, "Failed to refresh port lock: {}", e),
                Err(e) => warn!(port, "Port lock refresh task failed: {}", e),
            }
        }
    })
}

//! Port ownership across independent launches of the viewer.
//!
//! Each running viewer web server records `port -> locked_until` in a shared
//! state file. A port counts as owned by a sibling only while its entry is
//! unexpired *and* something is actually bound to the port; everything else is
//! pruned on load, so a crashed instance stops blocking the port once either
//! condition lapses.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ServerError, StoreError};
use crate::lock_store::{epoch_secs, JsonStateFile};

pub const LOCALHOST: &str = "127.0.0.1";

/// How long a port stays locked after acquisition (10 minutes).
pub const PORT_LOCK_SECS: u64 = 600;

/// On-disk layout of the port lock file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortLocks {
    #[serde(default)]
    pub locked_ports: BTreeMap<u16, f64>,
}

/// Decides whether this process may own a port.
#[derive(Debug, Clone)]
pub struct PortCoordinator {
    store: JsonStateFile<PortLocks>,
    lock_duration: Duration,
}

impl PortCoordinator {
    pub fn new(path: impl Into<PathBuf>, lock_duration: Duration) -> Self {
        Self {
            store: JsonStateFile::new(path),
            lock_duration,
        }
    }

    /// Live lock entries: unexpired and still bound. Corrupt files load empty.
    pub fn load(&self) -> BTreeMap<u16, f64> {
        prune(self.store.load(), epoch_secs())
    }

    fn load_strict(&self) -> Result<BTreeMap<u16, f64>, StoreError> {
        Ok(prune(self.store.load_strict()?, epoch_secs()))
    }

    /// Persist a set of lock entries as-is.
    pub fn save(&self, locked_ports: BTreeMap<u16, f64>) -> Result<(), StoreError> {
        self.store.save(&PortLocks { locked_ports })
    }

    pub fn is_already_running_on_same_port(&self, port: u16) -> bool {
        self.load().contains_key(&port)
    }

    /// Claim `port` for this process.
    ///
    /// Fails with `DuplicateInstanceOnSamePort` when a sibling owns the port or
    /// when the lock file cannot be updated, and with
    /// `PortInUseByAnotherService` when the port is bound without a lock entry.
    pub fn acquire(&self, port: u16) -> Result<(), ServerError> {
        if self.is_already_running_on_same_port(port) {
            return Err(ServerError::DuplicateInstanceOnSamePort { port: Some(port) });
        }
        if is_port_in_use(port) {
            return Err(ServerError::PortInUseByAnotherService { port });
        }

        // We cannot tell which port a concurrent writer is after; assume ours.
        self.lock(port).map_err(|e| {
            warn!(port, "Failed to lock port: {}", e);
            ServerError::DuplicateInstanceOnSamePort { port: None }
        })?;
        info!(port, secs = self.lock_duration.as_secs(), "Locked port");
        Ok(())
    }

    /// Push the expiry of an already held lock forward.
    pub fn refresh(&self, port: u16) -> Result<(), StoreError> {
        self.lock(port)?;
        debug!(port, "Refreshed port lock");
        Ok(())
    }

    /// Write a fresh expiry for `port`. A corrupt file is overwritten; only
    /// I/O failures are returned.
    fn lock(&self, port: u16) -> Result<(), StoreError> {
        let mut locked = match self.load_strict() {
            Ok(locked) => locked,
            Err(StoreError::Json(e)) => {
                warn!(port, "Port lock file contains invalid JSON, starting fresh: {}", e);
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        locked.insert(port, epoch_secs() + self.lock_duration.as_secs_f64());
        self.save(locked)
    }

    /// Drop the lock entry for `port`. Failures are logged, never raised; a
    /// leftover entry prunes itself once it expires or the port is freed.
    pub fn release(&self, port: u16) {
        let mut locked = self.load();
        locked.remove(&port);
        let result = if locked.is_empty() {
            self.store.remove()
        } else {
            self.save(locked)
        };
        match result {
            Ok(()) => info!(port, "Released port lock"),
            Err(e) => warn!(port, "Failed to release port lock: {}", e),
        }
    }
}

fn prune(state: PortLocks, now: f64) -> BTreeMap<u16, f64> {
    state
        .locked_ports
        .into_iter()
        .filter(|&(port, locked_until)| {
            if now >= locked_until {
                debug!(port, "Dropping expired port lock");
                return false;
            }
            if !is_port_in_use(port) {
                debug!(port, "Dropping port lock for idle port");
                return false;
            }
            true
        })
        .collect()
}

/// Whether anything on this machine is bound to `port` on the loopback address.
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind((LOCALHOST, port)).is_err()
}

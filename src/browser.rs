//! Throttled opening of the viewer page in the user's web browser.
//!
//! After a launch, automatic opening stays disabled for a while. The deadline
//! is persisted so that a process restarted in quick succession does not pop
//! up yet another browser tab; an in-process timer re-enables opening when the
//! deadline passes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::lock_store::{epoch_secs, JsonStateFile};
use crate::ports::LOCALHOST;

/// How long automatic opening stays disabled after a launch (5 minutes).
pub const REOPEN_SECS: u64 = 300;

/// Side effect of opening a URL.
pub trait Launcher: Send + Sync {
    fn launch(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs with the platform's default browser.
pub struct SystemBrowser;

impl Launcher for SystemBrowser {
    fn launch(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// On-disk layout of the browser throttle file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    #[serde(default)]
    pub reopen_disabled_until: f64,
}

#[derive(Default)]
struct Slot {
    disabled: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    store: JsonStateFile<ThrottleState>,
    reopen: Duration,
    launcher: Box<dyn Launcher>,
    slot: Mutex<Slot>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.slot.get_mut().ok().and_then(|slot| slot.timer.take()) {
            timer.abort();
        }
    }
}

/// Rate limiter for automatic browser launches. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct BrowserThrottle {
    inner: Arc<Inner>,
}

impl BrowserThrottle {
    pub fn new(path: impl Into<PathBuf>, reopen: Duration, launcher: Box<dyn Launcher>) -> Self {
        let throttle = Self {
            inner: Arc::new(Inner {
                store: JsonStateFile::new(path),
                reopen,
                launcher,
                slot: Mutex::new(Slot::default()),
            }),
        };

        // Inherit a throttle window left behind by a previous run.
        let disabled_until = throttle.inner.store.load().reopen_disabled_until;
        let remaining = disabled_until - epoch_secs();
        if remaining > 0.0 {
            let mut slot = throttle.inner.lock_slot();
            slot.disabled = true;
            arm(&throttle.inner, &mut slot, Duration::from_secs_f64(remaining));
        }
        throttle
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock_slot().disabled
    }

    /// Open the viewer at `port` unless a recent launch disabled opening.
    /// Returns whether a launch was attempted.
    pub fn open(&self, port: u16) -> bool {
        let mut slot = self.inner.lock_slot();
        if slot.disabled {
            return false;
        }

        let url = format!("http://{LOCALHOST}:{port}");
        info!("Opening viewer app running at {} in default web browser", url);
        if let Err(e) = self.inner.launcher.launch(&url) {
            warn!("Failed to open web browser: {}", e);
        }

        info!(
            "Disabling automatic opening of web browser for the next {}s",
            self.inner.reopen.as_secs()
        );
        slot.disabled = true;
        arm(&self.inner, &mut slot, self.inner.reopen);
        self.inner.save(epoch_secs() + self.inner.reopen.as_secs_f64());
        true
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, reopen_disabled_until: f64) {
        if let Err(e) = self.store.save(&ThrottleState { reopen_disabled_until }) {
            warn!("Failed to save web browser throttle state: {}", e);
        }
    }

    fn enable(&self, generation: u64) {
        let mut slot = self.lock_slot();
        // A newer timer owns the slot now.
        if slot.generation != generation {
            return;
        }
        info!("Re-enabling automatic opening of web browser");
        slot.disabled = false;
        slot.timer = None;
        self.save(0.0);
    }
}

/// Replace any pending re-enable timer with one firing after `delay`.
fn arm(inner: &Arc<Inner>, slot: &mut Slot, delay: Duration) {
    if let Some(previous) = slot.timer.take() {
        previous.abort();
    }
    slot.generation += 1;
    let generation = slot.generation;
    let weak: Weak<Inner> = Arc::downgrade(inner);
    slot.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = weak.upgrade() {
            inner.enable(generation);
        }
    }));
}

//! Shared application state handed to the HTTP handlers.

use std::sync::Arc;

use crate::hub::ViewerHub;

/// Handles every request handler needs: the viewer hub and the bound port.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ViewerHub>,
    /// Port the viewer web server is bound to, substituted into the viewer page.
    pub port: u16,
}

impl AppState {
    pub fn new(hub: Arc<ViewerHub>, port: u16) -> Self {
        Self { hub, port }
    }
}

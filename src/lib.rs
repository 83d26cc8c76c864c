//! Vegaview - live Vega-Lite viewer for agent-produced visualizations.
//!
//! A single loopback web server per port pushes visualization specs to every
//! open viewer page over WebSockets. Independent launches of the program
//! coordinate port ownership through a small state file so that a second
//! instance on the same port shares the first one's server instead of failing.

pub mod browser;
pub mod config;
pub mod error;
pub mod http_server;
pub mod hub;
pub mod lock_store;
pub mod ports;
pub mod server;
pub mod state;
pub mod tools;

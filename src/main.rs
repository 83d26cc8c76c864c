//! Vegaview - Vega-Lite viewer server driven by agent tool calls.
//!
//! Usage:
//!   vegaview [--port 8000] [--lazy-view] [--silent | --debug]
//!
//! Tool requests are read as JSON lines from stdin and answered on stdout;
//! logs go to stderr.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{debug, error, info, warn, Level};

use vegaview::browser::{BrowserThrottle, SystemBrowser};
use vegaview::config::{default_state_dir, is_truthy, Settings, DEFAULT_PORT};
use vegaview::hub::ViewerHub;
use vegaview::ports::{PortCoordinator, LOCALHOST};
use vegaview::server::ServerController;
use vegaview::tools::{serve_lines, ToolSession};

#[derive(Parser, Debug)]
#[command(name = "vegaview")]
#[command(about = "Vega-Lite viewer server for agent tool calls")]
struct Args {
    /// Port to run the viewer web server on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Open viewer app in browser lazily upon first visualization
    #[arg(long)]
    lazy_view: bool,

    /// Show only error messages
    #[arg(long, conflicts_with = "debug")]
    silent: bool,

    /// Enable debug logging (also set by VEGAVIEW_DEBUG)
    #[arg(long)]
    debug: bool,

    /// Directory holding the port lock and browser throttle files
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

impl Args {
    fn log_level(&self) -> Level {
        let debug = self.debug
            || std::env::var("VEGAVIEW_DEBUG")
                .map(|v| is_truthy(&v))
                .unwrap_or(false);
        if self.silent {
            Level::ERROR
        } else if debug {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // stdout carries tool responses, so logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(args.log_level())
        .init();

    let settings = Settings::new(
        args.port,
        args.state_dir.clone().unwrap_or_else(default_state_dir),
    );
    debug!(?settings, "Resolved settings");

    let code = run(settings, args.lazy_view).await;
    info!("Vegaview shutdown complete");
    exit(code);
}

async fn run(settings: Settings, lazy_view: bool) -> i32 {
    let port = settings.port;
    let browser = BrowserThrottle::new(
        settings.browser_state_file(),
        settings.reopen_after,
        Box::new(SystemBrowser),
    );
    if !lazy_view {
        info!("Opening viewer in browser at http://{}:{}", LOCALHOST, port);
        browser.open(port);
    }

    let server = ServerController::new(
        PortCoordinator::new(settings.port_lock_file(), settings.lock_duration),
        Arc::new(ViewerHub::new()),
        settings.lock_duration,
    );
    match server.start(port).await {
        Ok(_) => {}
        Err(e) if e.is_fatal() => {
            error!("Failed to start viewer web server on port {}: {}", port, e);
            return 1;
        }
        Err(e) => warn!("Continuing without a viewer web server of our own: {}", e),
    }

    let mut session = ToolSession::new(port, browser);
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let mut code = 0;
    tokio::select! {
        result = serve_lines(&mut session, stdin, stdout) => {
            if let Err(e) = result {
                error!("Internal error in tool transport: {:?}", e);
                code = 1;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            debug!("Interrupted");
        }
    }

    server.shutdown().await;
    code
}

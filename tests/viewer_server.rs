use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use vegaview::browser::{BrowserThrottle, Launcher};
use vegaview::error::ServerError;
use vegaview::hub::ViewerHub;
use vegaview::ports::{PortCoordinator, LOCALHOST, PORT_LOCK_SECS};
use vegaview::server::{ServerController, ServerStatus, StartOutcome};
use vegaview::tools::ToolSession;

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn free_port() -> u16 {
    TcpListener::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn controller(state_dir: &Path) -> ServerController {
    let lock = Duration::from_secs(PORT_LOCK_SECS);
    ServerController::new(
        PortCoordinator::new(state_dir.join("ports.json"), lock),
        Arc::new(ViewerHub::new()),
        lock,
    )
}

async fn open_viewer(port: u16) -> Viewer {
    let (ws, _) = connect_async(format!("ws://{LOCALHOST}:{port}/ws"))
        .await
        .unwrap();
    ws
}

async fn wait_for_viewers(server: &ServerController, count: usize) {
    for _ in 0..200 {
        if server.hub().connection_count().await == count {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} registered viewers");
}

async fn next_text(ws: &mut Viewer) -> String {
    match timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

fn url(port: u16, path: &str) -> String {
    format!("http://{LOCALHOST}:{port}{path}")
}

#[tokio::test]
async fn second_instance_on_same_port_runs_in_shared_mode() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let first = controller(dir.path());
    assert_eq!(first.start(port).await.unwrap(), StartOutcome::Serving { port });

    let sibling = PortCoordinator::new(dir.path().join("ports.json"), Duration::from_secs(PORT_LOCK_SECS));
    assert!(matches!(
        sibling.acquire(port),
        Err(ServerError::DuplicateInstanceOnSamePort { port: Some(p) }) if p == port
    ));

    let second = controller(dir.path());
    assert_eq!(second.start(port).await.unwrap(), StartOutcome::Shared { port });
    assert_eq!(second.status().await, ServerStatus::Shared { port });

    // Shutting down the shared instance must not release the owner's lock.
    second.shutdown().await;
    assert!(sibling.is_already_running_on_same_port(port));

    first.shutdown().await;
    assert!(!sibling.is_already_running_on_same_port(port));
}

#[tokio::test]
async fn foreign_service_on_port_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let foreign = TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = foreign.local_addr().unwrap().port();

    let server = controller(dir.path());
    let err = server.start(port).await.unwrap_err();
    assert!(matches!(err, ServerError::PortInUseByAnotherService { port: p } if p == port));
}

#[tokio::test]
async fn live_data_reaches_all_viewers_and_replays_to_late_joiners() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = controller(dir.path());
    server.start(port).await.unwrap();

    let mut a = open_viewer(port).await;
    let mut b = open_viewer(port).await;
    wait_for_viewers(&server, 2).await;

    let spec = json!({"mark": "bar", "data": {"values": [{"a": 1}]}});
    let response = reqwest::Client::new()
        .post(url(port, "/live-data"))
        .json(&json!({ "spec": spec }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");

    let expected = serde_json::to_string(&spec).unwrap();
    assert_eq!(next_text(&mut a).await, expected);
    assert_eq!(next_text(&mut b).await, expected);

    let mut late = open_viewer(port).await;
    assert_eq!(next_text(&mut late).await, expected);

    server.shutdown().await;
}

#[tokio::test]
async fn string_specs_are_broadcast_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = controller(dir.path());
    server.start(port).await.unwrap();

    let mut viewer = open_viewer(port).await;
    wait_for_viewers(&server, 1).await;

    let raw = "{ \"mark\": \"line\" }";
    reqwest::Client::new()
        .post(url(port, "/live-data"))
        .json(&json!({ "spec": raw }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    assert_eq!(next_text(&mut viewer).await, raw);

    server.shutdown().await;
}

#[tokio::test]
async fn sample_data_is_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = controller(dir.path());
    server.start(port).await.unwrap();

    let mut viewer = open_viewer(port).await;
    wait_for_viewers(&server, 1).await;

    let body: Value = reqwest::get(url(port, "/sample-data"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "success");

    let spec: Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(spec["mark"], "bar");

    server.shutdown().await;
}

#[tokio::test]
async fn viewer_page_and_favicon() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = controller(dir.path());
    server.start(port).await.unwrap();

    let html = reqwest::get(url(port, "/")).await.unwrap().text().await.unwrap();
    assert!(html.contains(&format!("{LOCALHOST}:{port}/ws")));
    assert!(!html.contains("{{port}}"));

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let favicon = client.get(url(port, "/favicon.ico")).send().await.unwrap();
    assert_eq!(favicon.status().as_u16(), 301);
    assert_eq!(
        favicon.headers()["location"].to_str().unwrap(),
        "https://vega.github.io/favicon.ico"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_open_viewers() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = controller(dir.path());
    server.start(port).await.unwrap();

    let mut viewer = open_viewer(port).await;
    wait_for_viewers(&server, 1).await;

    timeout(Duration::from_secs(10), server.shutdown())
        .await
        .expect("shutdown should not hang on open viewers");

    match timeout(Duration::from_secs(5), viewer.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("viewer should be closed, got {other:?}"),
    }
}

struct NoBrowser;

impl Launcher for NoBrowser {
    fn launch(&self, _url: &str) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn visualize_tool_pushes_dataset_to_viewers() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = controller(dir.path());
    server.start(port).await.unwrap();

    let mut viewer = open_viewer(port).await;
    wait_for_viewers(&server, 1).await;

    let browser = BrowserThrottle::new(
        dir.path().join("browser.json"),
        Duration::from_secs(300),
        Box::new(NoBrowser),
    );
    let mut session = ToolSession::new(port, browser);
    session
        .upload_data("sales", json!([{"month": "Jan", "total": 3}]))
        .unwrap();
    let message = session
        .visualize_data("sales", json!({"mark": "line"}))
        .await
        .unwrap();
    assert!(message.contains(&port.to_string()));

    let spec: Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(
        spec,
        json!({"mark": "line", "data": {"values": [{"month": "Jan", "total": 3}]}})
    );

    server.shutdown().await;
}

#[tokio::test]
async fn visualize_tool_reports_unreachable_viewer_server() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let browser = BrowserThrottle::new(
        dir.path().join("browser.json"),
        Duration::from_secs(300),
        Box::new(NoBrowser),
    );
    let mut session = ToolSession::new(port, browser);
    session.upload_data("d", json!([{"x": 1}])).unwrap();

    let err = session
        .visualize_data("d", json!({"mark": "point"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to send the visualization"));
}

//! Agent-facing dataset tools and their line-delimited JSON transport.
//!
//! Requests arrive one per line as
//! `{"id": .., "tool": "upload_data" | "visualize_data", "arguments": {..}}`
//! and each produces exactly one response line carrying the same `id`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::browser::BrowserThrottle;
use crate::error::ToolError;
use crate::ports::LOCALHOST;

type Record = Map<String, Value>;

/// One agent session: its uploaded datasets and the way to reach the viewer.
pub struct ToolSession {
    port: u16,
    browser: BrowserThrottle,
    client: reqwest::Client,
    datasets: BTreeMap<String, Vec<Record>>,
}

impl ToolSession {
    pub fn new(port: u16, browser: BrowserThrottle) -> Self {
        Self {
            port,
            browser,
            client: reqwest::Client::new(),
            datasets: BTreeMap::new(),
        }
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    /// Register `data` under `name`, replacing any earlier dataset of that name.
    pub fn upload_data(&mut self, name: &str, data: Value) -> Result<String, ToolError> {
        require_name(name)?;
        let Value::Array(items) = data else {
            return Err(ToolError::InvalidArgument(
                "Data must be a list of records/objects".into(),
            ));
        };
        if items.is_empty() {
            return Err(ToolError::InvalidArgument("Dataset cannot be empty".into()));
        }

        let mut records = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(record) => records.push(record),
                other => {
                    return Err(ToolError::InvalidArgument(format!(
                        "Data item at index {i} must be an object, got {}",
                        json_type(&other)
                    )))
                }
            }
        }

        let count = records.len();
        info!(name, count, "Dataset registered");
        self.datasets.insert(name.to_string(), records);
        Ok(format!(
            "Your dataset has been successfully uploaded and registered as '{name}' with {count} records"
        ))
    }

    /// Merge dataset `name` into the Vega-Lite `spec` and push it to the viewer.
    pub async fn visualize_data(&self, name: &str, spec: Value) -> Result<String, ToolError> {
        let spec = self.prepare(name, spec)?;
        let url = format!("http://{LOCALHOST}:{}/live-data", self.port);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "spec": spec }))
            .send()
            .await
            .map_err(|source| ToolError::Delivery {
                name: name.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Rejected {
                name: name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(format!(
            "The visualization of the '{name}' dataset has been successfully created and sent to the viewer app running in your web browser (see http://{LOCALHOST}:{}).",
            self.port
        ))
    }

    /// Validate the request, open the viewer and build the final spec.
    fn prepare(&self, name: &str, spec: Value) -> Result<Value, ToolError> {
        require_name(name)?;
        let is_empty = match &spec {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Object(m) => m.is_empty(),
            _ => false,
        };
        if is_empty {
            return Err(ToolError::InvalidArgument(
                "Vega-Lite specification cannot be empty".into(),
            ));
        }
        if !matches!(spec, Value::Object(_) | Value::String(_)) {
            return Err(ToolError::InvalidArgument(
                "Vega-Lite specification must be an object or a JSON string".into(),
            ));
        }

        info!(name, "Visualizing dataset");
        self.browser.open(self.port);

        if self.datasets.is_empty() {
            return Err(ToolError::NoDatasets);
        }
        let records = self
            .datasets
            .get(name)
            .ok_or_else(|| ToolError::DatasetNotFound {
                name: name.to_string(),
                available: self.dataset_names(),
            })?;

        let spec = match spec {
            Value::String(s) => serde_json::from_str(&s).map_err(ToolError::InvalidSpecJson)?,
            other => other,
        };
        let Value::Object(mut spec) = spec else {
            return Err(ToolError::InvalidArgument(
                "Vega-Lite specification must be a JSON object".into(),
            ));
        };

        debug!(name, records = records.len(), "Embedding dataset into specification");
        spec.insert("data".into(), json!({ "values": records }));
        Ok(Value::Object(spec))
    }

    async fn dispatch(&mut self, request: ToolRequest) -> Result<String, ToolError> {
        match request.tool.as_str() {
            "upload_data" => {
                let args: UploadDataArgs = parse_arguments(request.arguments)?;
                self.upload_data(&args.name, args.data)
            }
            "visualize_data" => {
                let args: VisualizeDataArgs = parse_arguments(request.arguments)?;
                self.visualize_data(&args.name, args.spec).await
            }
            other => Err(ToolError::InvalidArgument(format!("unknown tool '{other}'"))),
        }
    }
}

fn require_name(name: &str) -> Result<(), ToolError> {
    if name.trim().is_empty() {
        return Err(ToolError::InvalidArgument(
            "Dataset name must be a non-empty string".into(),
        ));
    }
    Ok(())
}

fn parse_arguments<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments)
        .map_err(|e| ToolError::InvalidArgument(format!("invalid tool arguments: {e}")))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct UploadDataArgs {
    name: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct VisualizeDataArgs {
    name: String,
    spec: Value,
}

#[derive(Debug, Serialize)]
struct ToolResponse {
    id: Value,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ToolResponse {
    fn from_result(id: Value, result: Result<String, ToolError>) -> Self {
        match result {
            Ok(message) => Self {
                id,
                ok: true,
                result: Some(message),
                error: None,
            },
            Err(e) => Self {
                id,
                ok: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn malformed(e: serde_json::Error) -> Self {
        Self {
            id: Value::Null,
            ok: false,
            result: None,
            error: Some(format!("invalid tool request: {e}")),
        }
    }
}

/// Serve tool requests from `input` until it reaches EOF.
pub async fn serve_lines<R, W>(session: &mut ToolSession, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ToolRequest>(line) {
            Ok(mut request) => {
                let id = std::mem::take(&mut request.id);
                let result = session.dispatch(request).await;
                if let Err(e) = &result {
                    warn!("Tool call failed: {}", e);
                }
                ToolResponse::from_result(id, result)
            }
            Err(e) => ToolResponse::malformed(e),
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }
    Ok(())
}

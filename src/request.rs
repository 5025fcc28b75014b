//! Request, work item and response types shared by every stage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{CoreError, ErrorInfo};

/// Highest (most urgent) priority level.
pub const PRIORITY_HIGHEST: u8 = 1;
/// Lowest (least urgent) priority level.
pub const PRIORITY_LOWEST: u8 = 10;
/// Priority assigned when the caller does not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Clamp an arbitrary priority into the supported range.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST)
}

/// Request method. Only idempotent methods are eligible for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// GET, HEAD and OPTIONS never change server state.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(CoreError::Validation(format!("unsupported method: {other:?}"))),
        }
    }
}

/// A request as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Check method, URL and priority. Returns the parsed method.
    pub fn validate(&self) -> Result<Method, CoreError> {
        if self.method.trim().is_empty() {
            return Err(CoreError::Validation("missing method".into()));
        }
        let method = self.method.parse::<Method>()?;
        if self.url.trim().is_empty() {
            return Err(CoreError::Validation("missing url".into()));
        }
        if let Some(priority) = self.priority {
            let range = u32::from(PRIORITY_HIGHEST)..=u32::from(PRIORITY_LOWEST);
            if !range.contains(&priority) {
                return Err(CoreError::Validation(format!(
                    "priority {priority} outside {PRIORITY_HIGHEST}..={PRIORITY_LOWEST}"
                )));
            }
        }
        if let Some(weight) = self.weight {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(CoreError::Validation(format!("invalid weight {weight}")));
            }
        }
        Ok(method)
    }

    /// Validate and convert into a work item with the given id.
    pub fn into_work_item(self, id: String) -> Result<WorkItem, CoreError> {
        let method = self.validate()?;
        let priority = self
            .priority
            .map(|p| clamp_priority(p as u8))
            .unwrap_or(DEFAULT_PRIORITY);
        Ok(WorkItem {
            id,
            method,
            url: self.url,
            headers: self.headers,
            body: self.body,
            arrived_at: Instant::now(),
            client_id: self.client_id,
            priority,
            weight: self.weight.unwrap_or(1.0),
            retry_count: 0,
            max_retries: 0,
            request_type: self.request_type,
            payload: None,
        })
    }
}

/// Generate an identifier for a request submitted without one.
pub fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// The unit of work that is deduplicated, scheduled and executed.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub arrived_at: Instant,
    pub client_id: Option<String>,
    /// Lower is more urgent.
    pub priority: u8,
    pub weight: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub request_type: Option<String>,
    /// Opaque data for the executor.
    pub payload: Option<serde_json::Value>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, method: Method, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            arrived_at: Instant::now(),
            client_id: None,
            priority: DEFAULT_PRIORITY,
            weight: 1.0,
            retry_count: 0,
            max_retries: 0,
            request_type: None,
            payload: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_arrival(mut self, arrived_at: Instant) -> Self {
        self.arrived_at = arrived_at;
        self
    }

    /// Time since the item arrived.
    pub fn wait_time(&self) -> Duration {
        self.arrived_at.elapsed()
    }
}

/// What an executor returns for a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ExecutionOutput {
    /// 200 OK with the given body.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: BTreeMap::new(),
            data: Some(data),
        }
    }

    pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        self.status = status;
        self.status_text = status_text.into();
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One response per original request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchedResponse {
    pub id: String,
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deduplicated: bool,
}

impl BatchedResponse {
    pub fn from_output(id: impl Into<String>, output: ExecutionOutput, elapsed: Duration) -> Self {
        Self {
            id: id.into(),
            status: output.status,
            status_text: output.status_text,
            headers: output.headers,
            data: output.data,
            error: None,
            processing_time_ms: elapsed.as_millis() as u64,
            cached: false,
            deduplicated: false,
        }
    }

    pub fn from_error(id: impl Into<String>, err: &CoreError, elapsed: Duration) -> Self {
        let status = err.status();
        Self {
            id: id.into(),
            status,
            status_text: status_text(status).to_string(),
            headers: BTreeMap::new(),
            data: None,
            error: Some(err.to_error_info()),
            processing_time_ms: elapsed.as_millis() as u64,
            cached: false,
            deduplicated: false,
        }
    }

    /// Copy of this response addressed to another request id.
    pub fn for_request(&self, id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..self.clone()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response envelope wrapping every Incus API reply:
/// `{type, status, status_code, metadata, error, error_code}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Sync,
    Async,
    Error,
}

/// A background operation inside Incus, reachable at `/1.0/operations/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncusOperation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub may_cancel: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl IncusOperation {
    /// Incus status codes: 100-199 in flight, 200 success, 400+ failure.
    pub fn is_terminal(&self) -> bool {
        self.status_code >= 200
    }

    pub fn succeeded(&self) -> bool {
        self.status_code == 200 || self.status == "Success"
    }

    /// Failure text, preferring the explicit error over the status word.
    pub fn failure(&self) -> String {
        if self.err.is_empty() {
            self.status.clone()
        } else {
            self.err.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn container_status(&self) -> ContainerStatus {
        ContainerStatus::parse(&self.status)
    }

    /// Human-readable image description, as recorded by the image server.
    pub fn image_description(&self) -> String {
        self.config
            .get("image.description")
            .or_else(|| self.config.get("image.os"))
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn created_iso8601(&self) -> String {
        self.created_at.map(|t| t.to_rfc3339()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Starting,
    Stopping,
    Error,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => ContainerStatus::Running,
            "stopped" => ContainerStatus::Stopped,
            "starting" => ContainerStatus::Starting,
            "stopping" => ContainerStatus::Stopping,
            "error" => ContainerStatus::Error,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "Running",
            ContainerStatus::Stopped => "Stopped",
            ContainerStatus::Starting => "Starting",
            ContainerStatus::Stopping => "Stopping",
            ContainerStatus::Error => "Error",
            ContainerStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source block of an instance creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub protocol: String,
    pub server: String,
    pub alias: String,
}

/// Body of `POST /1.0/instances`.
#[derive(Debug, Clone, Serialize)]
pub struct InstancesPost {
    pub name: String,
    pub source: InstanceSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<HashMap<String, HashMap<String, String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

/// Body of `PUT /1.0/instances/{name}` (read-merge-write updates).
#[derive(Debug, Clone, Serialize)]
pub struct InstancePut {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<HashMap<String, HashMap<String, String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    pub ephemeral: bool,
    pub stateful: bool,
}

impl InstancePut {
    /// Start from the current instance so unrelated fields survive the PUT.
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            architecture: Some(instance.architecture.clone()),
            config: Some(instance.config.clone()),
            description: Some(instance.description.clone()),
            devices: Some(instance.devices.clone()),
            profiles: Some(instance.profiles.clone()),
            ephemeral: instance.ephemeral,
            stateful: instance.stateful,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Start => "start",
            StateAction::Stop => "stop",
            StateAction::Restart => "restart",
            StateAction::Freeze => "freeze",
            StateAction::Unfreeze => "unfreeze",
        }
    }
}

/// Body of `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: String,
    pub timeout: i64,
    pub force: bool,
    pub stateful: bool,
}

impl InstanceStatePut {
    pub fn new(action: StateAction, force: bool, timeout: i64) -> Self {
        Self {
            action: action.as_str().to_string(),
            timeout,
            force,
            stateful: false,
        }
    }
}

/// Subset of `GET /1.0` used for the availability probe.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub api_status: String,
    #[serde(default)]
    pub auth: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_envelope_decodes_with_metadata() {
        let raw = r#"{
            "type": "sync",
            "status": "Success",
            "status_code": 200,
            "metadata": {"name": "box", "status": "Running"}
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, ResponseType::Sync);
        assert_eq!(envelope.status_code, 200);

        let instance: Instance = serde_json::from_value(envelope.metadata).unwrap();
        assert_eq!(instance.name, "box");
        assert_eq!(instance.container_status(), ContainerStatus::Running);
    }

    #[test]
    fn async_envelope_carries_operation() {
        let raw = r#"{
            "type": "async",
            "status": "Operation created",
            "status_code": 100,
            "operation": "/1.0/operations/abc-123",
            "metadata": {"id": "abc-123", "status": "Running", "status_code": 103}
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, ResponseType::Async);

        let op: IncusOperation = serde_json::from_value(envelope.metadata).unwrap();
        assert_eq!(op.id, "abc-123");
        assert!(!op.is_terminal());
        assert!(!op.succeeded());
    }

    #[test]
    fn error_envelope_decodes_without_metadata() {
        let raw = r#"{"type": "error", "error": "Instance not found", "error_code": 404}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, ResponseType::Error);
        assert_eq!(envelope.error_code, 404);
        assert_eq!(envelope.error, "Instance not found");
    }

    #[test]
    fn operation_terminal_states() {
        let mut op = IncusOperation {
            status: "Success".into(),
            status_code: 200,
            ..Default::default()
        };
        assert!(op.is_terminal());
        assert!(op.succeeded());

        op.status = "Failure".into();
        op.status_code = 400;
        op.err = "boom".into();
        assert!(op.is_terminal());
        assert!(!op.succeeded());
        assert_eq!(op.failure(), "boom");
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(ContainerStatus::parse("RUNNING"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("stopped"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Unknown);
    }

    #[test]
    fn image_description_prefers_description_key() {
        let raw = r#"{
            "name": "box",
            "config": {"image.os": "ubuntu", "image.description": "Ubuntu noble amd64"}
        }"#;
        let instance: Instance = serde_json::from_str(raw).unwrap();
        assert_eq!(instance.image_description(), "Ubuntu noble amd64");
    }
}

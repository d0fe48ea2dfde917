use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{KapsuleError, Result};

use super::models::{
    Envelope, IncusOperation, Instance, InstancePut, InstanceStatePut, InstancesPost,
    ResponseType, Server, StateAction,
};
use super::DEFAULT_SOCKET;

/// Callback invoked with human-readable progress text while waiting on a
/// backend operation (e.g. image download percentage).
pub type ProgressCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Handle for an asynchronous backend operation.
#[derive(Debug, Clone)]
pub struct BackendOp {
    pub id: String,
    pub operation: IncusOperation,
}

/// Result of a non-interactive exec inside an instance.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stderr: String,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff_delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1_u128 << shift;
        let base = self.backoff_base.as_millis();
        let delay_ms = base.saturating_mul(factor).min(self.backoff_max.as_millis());
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }
}

#[derive(Debug)]
enum TransportError {
    Connect(std::io::Error),
    Http(hyper::Error),
    Request(hyper::http::Error),
}

impl TransportError {
    /// Mid-request socket hiccups are worth retrying; a refused or missing
    /// socket means the daemon is down and retrying cannot help.
    fn is_transient(&self) -> bool {
        match self {
            TransportError::Connect(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::Interrupted
            ),
            TransportError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            TransportError::Request(_) => false,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "connect: {e}"),
            TransportError::Http(e) => write!(f, "http: {e}"),
            TransportError::Request(e) => write!(f, "request: {e}"),
        }
    }
}

/// How long each server-side wait chunk lasts while polling an operation,
/// so progress metadata can be sampled between chunks.
const WAIT_CHUNK: Duration = Duration::from_secs(2);

/// Typed async client for the Incus REST API over its Unix socket.
///
/// Every request opens a fresh HTTP/1 connection over the socket, so the
/// client is freely shareable across concurrent tasks.
pub struct IncusClient {
    socket_path: PathBuf,
    retry: RetryPolicy,
}

impl Default for IncusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IncusClient {
    pub fn new() -> Self {
        Self::with_socket(DEFAULT_SOCKET)
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            retry: RetryPolicy::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        headers: &[(&'static str, String)],
        body: Bytes,
    ) -> std::result::Result<(u16, Bytes), TransportError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(TransportError::Connect)?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(TransportError::Http)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Incus connection task ended: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "incus");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(TransportError::Request)?;

        let response = sender
            .send_request(request)
            .await
            .map_err(TransportError::Http)?;
        let status = response.status().as_u16();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(TransportError::Http)?
            .to_bytes();

        Ok((status, bytes))
    }

    /// Send a request, retrying transient socket errors with exponential
    /// backoff before giving up with BackendUnavailable.
    async fn raw(
        &self,
        method: Method,
        path: &str,
        headers: &[(&'static str, String)],
        body: Bytes,
    ) -> Result<(u16, Bytes)> {
        let mut attempt = 1_u32;
        loop {
            match self
                .dispatch(method.clone(), path, headers, body.clone())
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_transient() || attempt >= self.retry.max_attempts {
                        return Err(KapsuleError::BackendUnavailable(e.to_string()));
                    }
                    let delay = self.retry.backoff_delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying Incus request after transient failure: {}",
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope> {
        let (headers, bytes) = match body {
            Some(value) => {
                let encoded = serde_json::to_vec(&value)
                    .map_err(|e| KapsuleError::Internal(e.into()))?;
                (
                    vec![("content-type", "application/json".to_string())],
                    Bytes::from(encoded),
                )
            }
            None => (vec![], Bytes::new()),
        };

        let (status, bytes) = self.raw(method, path, &headers, bytes).await?;
        parse_envelope(status, &bytes)
    }

    async fn request_sync<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let envelope = self.request_json(method, path, body).await?;
        let metadata = if envelope.metadata.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            envelope.metadata
        };
        serde_json::from_value(metadata).map_err(|e| KapsuleError::Internal(e.into()))
    }

    async fn request_async(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<BackendOp> {
        let envelope = self.request_json(method, path, body).await?;
        backend_op_from(envelope)
    }

    // -------------------------------------------------------------------------
    // Server
    // -------------------------------------------------------------------------

    pub async fn server_info(&self) -> Result<Server> {
        self.request_sync(Method::GET, "/1.0", None).await
    }

    pub async fn is_available(&self) -> bool {
        self.server_info().await.is_ok()
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.request_sync(Method::GET, "/1.0/instances?recursion=1", None)
            .await
    }

    pub async fn get_instance(&self, name: &str) -> Result<Instance> {
        self.request_sync(Method::GET, &format!("/1.0/instances/{name}"), None)
            .await
    }

    pub async fn instance_exists(&self, name: &str) -> Result<bool> {
        match self.get_instance(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_instance(&self, instance: InstancesPost) -> Result<BackendOp> {
        let body = serde_json::to_value(&instance)
            .map_err(|e| KapsuleError::Internal(e.into()))?;
        self.request_async(Method::POST, "/1.0/instances", Some(body))
            .await
    }

    pub async fn update_instance_state(
        &self,
        name: &str,
        action: StateAction,
        force: bool,
        timeout: i64,
    ) -> Result<BackendOp> {
        let state = InstanceStatePut::new(action, force, timeout);
        let body = serde_json::to_value(&state).map_err(|e| KapsuleError::Internal(e.into()))?;
        self.request_async(
            Method::PUT,
            &format!("/1.0/instances/{name}/state"),
            Some(body),
        )
        .await
    }

    pub async fn delete_instance(&self, name: &str) -> Result<BackendOp> {
        self.request_async(Method::DELETE, &format!("/1.0/instances/{name}"), None)
            .await
    }

    /// PUT the full instance; Incus answers these with a background
    /// operation, which is waited to completion here.
    pub async fn update_instance(&self, name: &str, put: InstancePut) -> Result<()> {
        let body = serde_json::to_value(&put).map_err(|e| KapsuleError::Internal(e.into()))?;
        let envelope = self
            .request_json(Method::PUT, &format!("/1.0/instances/{name}"), Some(body))
            .await?;

        match envelope.kind {
            ResponseType::Sync => Ok(()),
            ResponseType::Async => {
                let op = backend_op_from(envelope)?;
                let done = self
                    .wait_operation(&op.id, Duration::from_secs(60), None)
                    .await?;
                if done.succeeded() {
                    Ok(())
                } else {
                    Err(KapsuleError::Backend {
                        code: done.status_code,
                        message: done.failure(),
                    })
                }
            }
            // parse_envelope already converted error envelopes
            ResponseType::Error => unreachable!("error envelopes are rejected during parsing"),
        }
    }

    /// Merge config keys into an instance, preserving everything else.
    pub async fn patch_instance_config(
        &self,
        name: &str,
        config: HashMap<String, String>,
    ) -> Result<()> {
        let instance = self.get_instance(name).await?;
        let mut put = InstancePut::from_instance(&instance);
        let merged = put.config.get_or_insert_with(HashMap::new);
        merged.extend(config);
        self.update_instance(name, put).await
    }

    /// Add or replace a device on an instance, preserving everything else.
    pub async fn add_instance_device(
        &self,
        name: &str,
        device_name: &str,
        device: HashMap<String, String>,
    ) -> Result<()> {
        let instance = self.get_instance(name).await?;
        let mut put = InstancePut::from_instance(&instance);
        put.devices
            .get_or_insert_with(HashMap::new)
            .insert(device_name.to_string(), device);
        self.update_instance(name, put).await
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Wait for a backend operation to reach terminal status.
    ///
    /// Idempotent: waiting on an already-finished operation returns its
    /// recorded state. Progress metadata sampled between wait chunks is
    /// forwarded through `progress`.
    pub async fn wait_operation(
        &self,
        op_id: &str,
        timeout: Duration,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<IncusOperation> {
        let deadline = Instant::now() + timeout;
        let mut last_reported = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KapsuleError::Timeout(timeout));
            }

            let chunk = remaining.min(WAIT_CHUNK).as_secs().max(1);
            let path = format!("/1.0/operations/{op_id}/wait?timeout={chunk}");
            let op: IncusOperation = self.request_sync(Method::GET, &path, None).await?;

            if let Some(callback) = progress {
                if let Some(text) = progress_text(&op.metadata) {
                    if text != last_reported {
                        callback(&text);
                        last_reported = text;
                    }
                }
            }

            if op.is_terminal() {
                return Ok(op);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exec
    // -------------------------------------------------------------------------

    /// Run a command inside an instance. Interactive execs attach through a
    /// websocket; the daemon's own provisioning runs detached with output
    /// recorded.
    pub async fn exec(
        &self,
        name: &str,
        command: &[&str],
        env: &HashMap<String, String>,
        uid: u32,
        gid: u32,
        interactive: bool,
    ) -> Result<BackendOp> {
        let body = json!({
            "command": command,
            "environment": env,
            "user": uid,
            "group": gid,
            "interactive": interactive,
            "wait-for-websocket": interactive,
            "record-output": !interactive,
        });
        self.request_async(
            Method::POST,
            &format!("/1.0/instances/{name}/exec"),
            Some(body),
        )
        .await
    }

    /// Exec and wait for the exit code; stderr is pulled from the recorded
    /// output log when available (best effort).
    pub async fn exec_wait(
        &self,
        name: &str,
        command: &[&str],
        env: &HashMap<String, String>,
        uid: u32,
        gid: u32,
        timeout: Duration,
    ) -> Result<ExecResult> {
        let op = self.exec(name, command, env, uid, gid, false).await?;
        let done = self.wait_operation(&op.id, timeout, None).await?;

        let exit_code = done
            .metadata
            .get("return")
            .and_then(|v| v.as_i64())
            .unwrap_or(-1);

        let mut stderr = String::new();
        if exit_code != 0 {
            if let Some(path) = done
                .metadata
                .get("output")
                .and_then(|o| o.get("2"))
                .and_then(|v| v.as_str())
            {
                if let Ok(Some(bytes)) = self.fetch_log(path).await {
                    stderr = String::from_utf8_lossy(&bytes).trim().to_string();
                }
            }
        }

        Ok(ExecResult { exit_code, stderr })
    }

    async fn fetch_log(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let (status, bytes) = self.raw(Method::GET, path, &[], Bytes::new()).await?;
        if status == 200 {
            Ok(Some(bytes.to_vec()))
        } else {
            Ok(None)
        }
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    pub async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: &str,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let headers = vec![
            ("x-incus-type", "file".to_string()),
            ("x-incus-write", "overwrite".to_string()),
            ("x-incus-uid", uid.to_string()),
            ("x-incus-gid", gid.to_string()),
            ("x-incus-mode", mode.to_string()),
            ("content-type", "application/octet-stream".to_string()),
        ];
        let (status, bytes) = self
            .raw(
                Method::POST,
                &file_endpoint(name, path),
                &headers,
                Bytes::copy_from_slice(content),
            )
            .await?;
        parse_envelope(status, &bytes).map(|_| ())
    }

    pub async fn create_symlink(
        &self,
        name: &str,
        path: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let headers = vec![
            ("x-incus-type", "symlink".to_string()),
            ("x-incus-uid", uid.to_string()),
            ("x-incus-gid", gid.to_string()),
        ];
        let (status, bytes) = self
            .raw(
                Method::POST,
                &file_endpoint(name, path),
                &headers,
                Bytes::copy_from_slice(target.as_bytes()),
            )
            .await?;
        parse_envelope(status, &bytes).map(|_| ())
    }

    pub async fn mkdir(
        &self,
        name: &str,
        path: &str,
        mode: &str,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let headers = vec![
            ("x-incus-type", "directory".to_string()),
            ("x-incus-uid", uid.to_string()),
            ("x-incus-gid", gid.to_string()),
            ("x-incus-mode", mode.to_string()),
        ];
        let (status, bytes) = self
            .raw(Method::POST, &file_endpoint(name, path), &headers, Bytes::new())
            .await?;
        parse_envelope(status, &bytes).map(|_| ())
    }

    /// Pull a file's content from an instance; None when it does not exist.
    pub async fn pull_file(&self, name: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let (status, bytes) = self
            .raw(Method::GET, &file_endpoint(name, path), &[], Bytes::new())
            .await?;
        match status {
            200 => Ok(Some(bytes.to_vec())),
            404 => Ok(None),
            _ => match parse_envelope(status, &bytes) {
                Err(e) => Err(e),
                // A non-error envelope with an unexpected status; treat as absent.
                Ok(_) => Ok(None),
            },
        }
    }
}

fn file_endpoint(name: &str, path: &str) -> String {
    format!("/1.0/instances/{name}/files?path={path}")
}

/// Convert an HTTP status + body into the Incus envelope, mapping error
/// envelopes and HTTP failures into BackendError.
fn parse_envelope(status: u16, body: &[u8]) -> Result<Envelope> {
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(body) {
        if envelope.kind == ResponseType::Error {
            let code = if envelope.error_code != 0 {
                envelope.error_code
            } else {
                status
            };
            return Err(KapsuleError::Backend {
                code,
                message: envelope.error,
            });
        }
        if status >= 400 {
            return Err(KapsuleError::Backend {
                code: status,
                message: envelope.error,
            });
        }
        return Ok(envelope);
    }

    if status >= 400 {
        return Err(KapsuleError::Backend {
            code: status,
            message: String::from_utf8_lossy(body).trim().to_string(),
        });
    }

    Err(KapsuleError::Internal(anyhow::anyhow!(
        "unparseable Incus response (status {status})"
    )))
}

fn backend_op_from(envelope: Envelope) -> Result<BackendOp> {
    if envelope.kind != ResponseType::Async {
        return Err(KapsuleError::Internal(anyhow::anyhow!(
            "expected an async operation, got a {:?} response",
            envelope.kind
        )));
    }
    let operation: IncusOperation = serde_json::from_value(envelope.metadata)
        .map_err(|e| KapsuleError::Internal(e.into()))?;
    if operation.id.is_empty() {
        return Err(KapsuleError::Internal(anyhow::anyhow!(
            "async response carries no operation id"
        )));
    }
    Ok(BackendOp {
        id: operation.id.clone(),
        operation,
    })
}

/// Extract displayable progress text from operation metadata.
fn progress_text(metadata: &serde_json::Value) -> Option<String> {
    let object = metadata.as_object()?;
    if let Some(text) = object.get("download_progress").and_then(|v| v.as_str()) {
        return Some(format!("Downloading image: {text}"));
    }
    object
        .iter()
        .find_map(|(key, value)| value.as_str().map(|v| format!("{key}: {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_becomes_backend_error() {
        let body = br#"{"type": "error", "error": "Instance not found", "error_code": 404}"#;
        let err = parse_envelope(404, body).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Instance not found"));
    }

    #[test]
    fn http_error_without_envelope_is_backend_error() {
        let err = parse_envelope(500, b"internal server error").unwrap_err();
        match err {
            KapsuleError::Backend { code, message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "internal server error");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn async_envelope_yields_backend_op() {
        let body = br#"{
            "type": "async",
            "status": "Operation created",
            "status_code": 100,
            "operation": "/1.0/operations/op-1",
            "metadata": {"id": "op-1", "status": "Running", "status_code": 103}
        }"#;
        let envelope = parse_envelope(202, body).unwrap();
        let op = backend_op_from(envelope).unwrap();
        assert_eq!(op.id, "op-1");
        assert!(!op.operation.is_terminal());
    }

    #[test]
    fn sync_envelope_rejected_as_backend_op() {
        let body = br#"{"type": "sync", "status": "Success", "status_code": 200, "metadata": {}}"#;
        let envelope = parse_envelope(200, body).unwrap();
        assert!(backend_op_from(envelope).is_err());
    }

    #[test]
    fn progress_text_prefers_download_progress() {
        let metadata = serde_json::json!({
            "download_progress": "45% (12.3MB/s)",
            "other": "ignored",
        });
        assert_eq!(
            progress_text(&metadata).unwrap(),
            "Downloading image: 45% (12.3MB/s)"
        );
        assert_eq!(progress_text(&serde_json::Value::Null), None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay_for_attempt(10), Duration::from_secs(2));
    }
}

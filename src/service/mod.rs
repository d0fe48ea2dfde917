mod enter;
mod spec;

pub use enter::CallerIdentity;
pub use spec::{ContainerMode, HOSTFS_PATH, MODE_KEY, PTYXIS_PROFILE_KEY};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::KapsuleConfig;
use crate::error::{KapsuleError, Result};
use crate::incus::{
    ContainerStatus, IncusClient, IncusOperation, Instance, ProgressCallback, StateAction,
};
use crate::operation::{Reporter, Work};
use crate::ptyxis::PtyxisProfiles;

/// Ceiling for container state transitions (start, stop, waits on Running).
const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace period handed to the backend for a clean stop.
const STOP_GRACE_SECONDS: i64 = 30;

/// Image downloads routinely outlast state changes, so creation gets its
/// own generous ceiling.
const CREATE_TIMEOUT: Duration = Duration::from_secs(900);

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// One row of ListContainers: name, status, image, created, mode.
pub type ContainerRow = (String, String, String, String, String);

/// The policy layer: translates user-facing operations into compositions of
/// Incus calls, applying the kapsule container configuration.
pub struct ContainerService {
    incus: Arc<IncusClient>,
    config: KapsuleConfig,
    ptyxis: PtyxisProfiles,
}

impl ContainerService {
    pub fn new(incus: Arc<IncusClient>, config: KapsuleConfig) -> Self {
        Self {
            incus,
            config,
            ptyxis: PtyxisProfiles::new(),
        }
    }

    pub fn config(&self) -> &KapsuleConfig {
        &self.config
    }

    /// Execute one work item under the given reporter. This is the single
    /// dispatch point for everything the Operation Engine runs.
    pub async fn execute(&self, work: Work, reporter: Reporter) -> Result<()> {
        match work {
            Work::Create {
                name,
                image,
                session_mode,
                dbus_mux,
            } => {
                self.create_container(&reporter, &name, &image, session_mode, dbus_mux)
                    .await
            }
            Work::Start { name } => self.start_container(&reporter, &name).await,
            Work::Stop { name, force } => self.stop_container(&reporter, &name, force).await,
            Work::Delete { name, force } => self.delete_container(&reporter, &name, force).await,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle operations
    // -------------------------------------------------------------------------

    async fn create_container(
        &self,
        reporter: &Reporter,
        name: &str,
        image: &str,
        session_mode: bool,
        dbus_mux: bool,
    ) -> Result<()> {
        let result = self
            .create_inner(reporter, name, image, session_mode, dbus_mux)
            .await;

        // A cancelled creation may leave a half-built instance behind;
        // remove it so the name is reusable.
        if matches!(result, Err(KapsuleError::Cancelled)) {
            match self.cleanup_partial(name).await {
                Ok(true) => reporter.dim(format!("Removed partially created container '{name}'")),
                Ok(false) => {}
                Err(e) => {
                    return Err(KapsuleError::Internal(anyhow::anyhow!(
                        "cleanup of partially created container '{name}' failed: {e}"
                    )));
                }
            }
        }

        result
    }

    async fn create_inner(
        &self,
        reporter: &Reporter,
        name: &str,
        image: &str,
        session_mode: bool,
        dbus_mux: bool,
    ) -> Result<()> {
        spec::validate_name(name)?;
        let mode = ContainerMode::from_flags(session_mode, dbus_mux);

        let image = if image.is_empty() {
            self.config.default_image.clone()
        } else {
            image.to_string()
        };
        let source = spec::parse_image(&image)?;

        if self.incus.instance_exists(name).await? {
            return Err(KapsuleError::ContainerAlreadyExists(name.to_string()));
        }
        reporter.check_cancelled()?;

        reporter.info(format!("Image: {image}"));
        reporter.info("Downloading image and creating container...");

        let bar = reporter.progress_start("Downloading image", 100);
        let op = self
            .incus
            .create_instance(spec::kapsule_instance(name, source, mode))
            .await?;

        let forward = |text: &str| {
            if let Some(percent) = extract_percent(text) {
                bar.update(percent, 0.0);
            }
            reporter.dim(text.to_string());
        };
        let done = self
            .wait_cancellable(reporter, &op.id, CREATE_TIMEOUT, Some(&forward))
            .await?;
        if !done.succeeded() {
            bar.complete(false, "");
            return Err(KapsuleError::Backend {
                code: done.status_code,
                message: done.failure(),
            });
        }
        bar.complete(true, "Image ready");
        reporter.check_cancelled()?;

        reporter.info("Starting container...");
        let op = self
            .incus
            .update_instance_state(name, StateAction::Start, false, 0)
            .await?;
        let done = self
            .wait_cancellable(reporter, &op.id, STATE_CHANGE_TIMEOUT, None)
            .await?;
        if !done.succeeded() {
            return Err(KapsuleError::Backend {
                code: done.status_code,
                message: done.failure(),
            });
        }
        reporter.check_cancelled()?;

        if mode != ContainerMode::Default {
            self.setup_session_mode(reporter, name, mode).await;
        }

        // Best effort: creation never fails on the terminal profile.
        match self.ptyxis.create_profile(name).await {
            Some(profile) => {
                let mut patch = HashMap::new();
                patch.insert(PTYXIS_PROFILE_KEY.to_string(), profile);
                if let Err(e) = self.incus.patch_instance_config(name, patch).await {
                    reporter.warning(format!("Could not record terminal profile: {e}"));
                }
            }
            None => reporter.dim("Ptyxis not available, skipping terminal profile"),
        }

        reporter.success(format!("Container '{name}' created successfully"));
        Ok(())
    }

    async fn cleanup_partial(&self, name: &str) -> Result<bool> {
        if !self.incus.instance_exists(name).await? {
            return Ok(false);
        }
        if let Ok(op) = self
            .incus
            .update_instance_state(name, StateAction::Stop, true, 0)
            .await
        {
            let _ = self
                .incus
                .wait_operation(&op.id, STATE_CHANGE_TIMEOUT, None)
                .await;
        }
        let op = self.incus.delete_instance(name).await?;
        let done = self
            .incus
            .wait_operation(&op.id, STATE_CHANGE_TIMEOUT, None)
            .await?;
        if done.succeeded() {
            Ok(true)
        } else {
            Err(KapsuleError::Backend {
                code: done.status_code,
                message: done.failure(),
            })
        }
    }

    async fn start_container(&self, reporter: &Reporter, name: &str) -> Result<()> {
        let instance = self.get_existing(name).await?;
        if instance.container_status() == ContainerStatus::Running {
            reporter.warning(format!("Container '{name}' is already running"));
            return Ok(());
        }
        reporter.check_cancelled()?;

        reporter.info("Starting container...");
        let op = self
            .incus
            .update_instance_state(name, StateAction::Start, false, 0)
            .await?;
        let done = self
            .wait_cancellable(reporter, &op.id, STATE_CHANGE_TIMEOUT, None)
            .await?;
        if !done.succeeded() {
            return Err(KapsuleError::Backend {
                code: done.status_code,
                message: done.failure(),
            });
        }

        reporter.success(format!("Container '{name}' started successfully"));
        Ok(())
    }

    async fn stop_container(&self, reporter: &Reporter, name: &str, force: bool) -> Result<()> {
        let instance = self.get_existing(name).await?;
        if instance.container_status() == ContainerStatus::Stopped {
            reporter.warning(format!("Container '{name}' is not running"));
            return Ok(());
        }
        reporter.check_cancelled()?;

        reporter.info("Stopping container...");
        let op = self
            .incus
            .update_instance_state(name, StateAction::Stop, force, STOP_GRACE_SECONDS)
            .await?;
        let done = self
            .wait_cancellable(reporter, &op.id, STATE_CHANGE_TIMEOUT, None)
            .await?;
        if !done.succeeded() {
            return Err(KapsuleError::Backend {
                code: done.status_code,
                message: done.failure(),
            });
        }

        reporter.success(format!("Container '{name}' stopped successfully"));
        Ok(())
    }

    async fn delete_container(&self, reporter: &Reporter, name: &str, force: bool) -> Result<()> {
        let instance = self.get_existing(name).await?;
        let running = instance.container_status() == ContainerStatus::Running;

        if running && !force {
            return Err(KapsuleError::ContainerRunning(name.to_string()));
        }
        reporter.check_cancelled()?;

        let ptyxis_profile = instance.config.get(PTYXIS_PROFILE_KEY).cloned();

        if running {
            reporter.info("Stopping container...");
            let op = self
                .incus
                .update_instance_state(name, StateAction::Stop, true, STOP_GRACE_SECONDS)
                .await?;
            let done = self
                .wait_cancellable(reporter, &op.id, STATE_CHANGE_TIMEOUT, None)
                .await?;
            if !done.succeeded() {
                return Err(KapsuleError::Backend {
                    code: done.status_code,
                    message: done.failure(),
                });
            }
            reporter.success("Container stopped");
        }

        reporter.info("Deleting container...");
        let op = self.incus.delete_instance(name).await?;
        let done = self
            .wait_cancellable(reporter, &op.id, STATE_CHANGE_TIMEOUT, None)
            .await?;
        if !done.succeeded() {
            return Err(KapsuleError::Backend {
                code: done.status_code,
                message: done.failure(),
            });
        }

        if let Some(profile) = ptyxis_profile {
            self.ptyxis.delete_profile(&profile).await;
        }

        reporter.success(format!("Container '{name}' removed successfully"));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn list_containers(&self) -> Result<Vec<ContainerRow>> {
        let instances = self.incus.list_instances().await?;
        Ok(instances.iter().map(container_row).collect())
    }

    pub async fn get_container_info(&self, name: &str) -> Result<ContainerRow> {
        let instance = self.get_existing(name).await?;
        Ok(container_row(&instance))
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    pub(crate) async fn get_existing(&self, name: &str) -> Result<Instance> {
        match self.incus.get_instance(name).await {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_not_found() => Err(KapsuleError::ContainerNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Wait on a backend operation while watching the cancellation flag.
    /// An in-flight backend call is not aborted; its result is discarded
    /// and the operation transitions to Cancelled.
    async fn wait_cancellable(
        &self,
        reporter: &Reporter,
        op_id: &str,
        timeout: Duration,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<IncusOperation> {
        tokio::select! {
            result = self.incus.wait_operation(op_id, timeout, progress) => result,
            _ = watch_cancelled(reporter) => Err(KapsuleError::Cancelled),
        }
    }

    /// Poll an instance until it reports Running, bounded by the state
    /// transition ceiling. Used by prepare-enter for Starting containers.
    pub(crate) async fn wait_until_running(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + STATE_CHANGE_TIMEOUT;
        loop {
            let instance = self.get_existing(name).await?;
            match instance.container_status() {
                ContainerStatus::Running => return Ok(()),
                ContainerStatus::Error => {
                    return Err(KapsuleError::ContainerInvalidState {
                        name: name.to_string(),
                        status: instance.status.clone(),
                        action: "enter",
                    })
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(KapsuleError::Timeout(STATE_CHANGE_TIMEOUT));
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    pub(crate) async fn exec_root(&self, name: &str, command: &[&str]) -> Result<crate::incus::ExecResult> {
        self.incus
            .exec_wait(name, command, &HashMap::new(), 0, 0, EXEC_TIMEOUT)
            .await
    }

    // -------------------------------------------------------------------------
    // Session mode (container D-Bus socket on a host-visible path)
    // -------------------------------------------------------------------------

    async fn setup_session_mode(&self, reporter: &Reporter, name: &str, mode: ContainerMode) {
        let sub = reporter.indented();
        reporter.info("Configuring session D-Bus socket...");

        let dropin_dir = "/etc/systemd/user/dbus.socket.d";
        if let Err(e) = self.incus.mkdir(name, dropin_dir, "0755", 0, 0).await {
            debug!("mkdir {} in {}: {}", dropin_dir, name, e);
        }

        // %t expands to XDG_RUNTIME_DIR inside the container; routed through
        // the hostfs mount the socket lands on the host side too.
        let socket_path = format!("{HOSTFS_PATH}%t/kapsule/{name}/dbus.socket");
        let dropin = format!(
            "[Socket]\n\
             # Kapsule: publish the session bus socket on a host-visible path\n\
             ListenStream=\n\
             ListenStream={socket_path}\n"
        );
        if let Err(e) = self
            .incus
            .push_file(
                name,
                &format!("{dropin_dir}/kapsule.conf"),
                dropin.as_bytes(),
                "0644",
                0,
                0,
            )
            .await
        {
            sub.warning(format!("Could not configure D-Bus socket: {e}"));
            return;
        }

        if mode == ContainerMode::DbusMux {
            self.install_dbus_mux(&sub, name, &socket_path).await;
        }

        match self
            .exec_root(name, &["systemctl", "--user", "--global", "daemon-reload"])
            .await
        {
            Ok(result) if !result.ok() => {
                sub.warning(format!("systemd reload failed: {}", result.stderr))
            }
            Err(e) => sub.warning(format!("systemd reload failed: {e}")),
            Ok(_) => {}
        }
    }

    async fn install_dbus_mux(&self, reporter: &Reporter, name: &str, container_socket: &str) {
        reporter.info("Installing kapsule-dbus-mux.service");

        let mux_bin = format!("{HOSTFS_PATH}/usr/lib/kapsule/kapsule-dbus-mux");
        let host_bus = format!("unix:path={HOSTFS_PATH}%t/bus");
        let unit = format!(
            "[Unit]\n\
             Description=Kapsule D-Bus Multiplexer\n\
             After=dbus.service\n\
             Requires=dbus.service\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={mux_bin} \\\n\
             \x20   --listen %t/bus \\\n\
             \x20   --container-bus unix:path={container_socket} \\\n\
             \x20   --host-bus {host_bus}\n\
             Restart=on-failure\n\
             RestartSec=1\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n"
        );

        if let Err(e) = self
            .incus
            .push_file(
                name,
                "/etc/systemd/user/kapsule-dbus-mux.service",
                unit.as_bytes(),
                "0644",
                0,
                0,
            )
            .await
        {
            reporter.warning(format!("Could not install dbus-mux service: {e}"));
            return;
        }

        match self
            .exec_root(
                name,
                &[
                    "systemctl",
                    "--user",
                    "--global",
                    "enable",
                    "kapsule-dbus-mux.service",
                ],
            )
            .await
        {
            Ok(result) if !result.ok() => {
                warn!("enable kapsule-dbus-mux in {}: {}", name, result.stderr)
            }
            Err(e) => warn!("enable kapsule-dbus-mux in {}: {}", name, e),
            Ok(_) => {}
        }
    }
}

async fn watch_cancelled(reporter: &Reporter) {
    loop {
        if reporter.is_cancelled() {
            return;
        }
        sleep(Duration::from_millis(250)).await;
    }
}

fn container_row(instance: &Instance) -> ContainerRow {
    let mode = instance
        .config
        .get(MODE_KEY)
        .map(|v| ContainerMode::parse(v))
        .unwrap_or(ContainerMode::Default);
    (
        instance.name.clone(),
        instance.container_status().as_str().to_string(),
        instance.image_description(),
        instance.created_iso8601(),
        mode.as_str().to_string(),
    )
}

/// Pick a percentage out of backend progress text like
/// "Downloading image: 45% (12.3MB/s)".
fn extract_percent(text: &str) -> Option<u64> {
    let index = text.find('%')?;
    let head = &text[..index];
    let digits: String = head
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn extracts_percent_from_progress_text() {
        assert_eq!(extract_percent("Downloading image: 45% (12.3MB/s)"), Some(45));
        assert_eq!(extract_percent("100%"), Some(100));
        assert_eq!(extract_percent("no percentage here"), None);
        assert_eq!(extract_percent("% alone"), None);
    }

    #[test]
    fn container_row_maps_all_fields() {
        let raw = serde_json::json!({
            "name": "dev",
            "status": "Running",
            "config": {
                "image.description": "Archlinux current amd64",
                "user.kapsule.mode": "dbus-mux",
            },
            "created_at": chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        });
        let instance: Instance = serde_json::from_value(raw).unwrap();
        let (name, status, image, created, mode) = container_row(&instance);
        assert_eq!(name, "dev");
        assert_eq!(status, "Running");
        assert_eq!(image, "Archlinux current amd64");
        assert!(created.starts_with("2026-03-01T12:00:00"));
        assert_eq!(mode, "dbus-mux");
    }

    #[test]
    fn container_row_defaults_mode() {
        let raw = serde_json::json!({"name": "plain", "status": "Stopped"});
        let instance: Instance = serde_json::from_value(raw).unwrap();
        let (_, status, image, created, mode) = container_row(&instance);
        assert_eq!(status, "Stopped");
        assert_eq!(image, "unknown");
        assert_eq!(created, "");
        assert_eq!(mode, "default");
    }
}

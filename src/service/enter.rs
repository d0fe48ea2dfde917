use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{KapsuleError, Result};
use crate::incus::{ContainerStatus, INCUS_CLI};

use super::spec::HOSTFS_PATH;
use super::ContainerService;

/// Identity of the D-Bus caller, resolved before prepare-enter begins and
/// immutable for the life of the call it seeds.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub username: String,
    pub home: String,
    pub env: HashMap<String, String>,
}

/// Distro family of a container, as far as user provisioning cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Distro {
    Alpine,
    Arch,
    Fedora,
    Debian,
    Unknown,
}

impl Distro {
    fn admin_group(self) -> &'static str {
        match self {
            Distro::Arch | Distro::Fedora => "wheel",
            Distro::Debian => "sudo",
            Distro::Alpine => "adm",
            Distro::Unknown => "sudo",
        }
    }

    fn install_sudo_command(self) -> Option<&'static [&'static str]> {
        match self {
            Distro::Alpine => Some(&["apk", "add", "sudo"]),
            Distro::Arch => Some(&["pacman", "-Sy", "--noconfirm", "sudo"]),
            Distro::Fedora => Some(&["dnf", "install", "-y", "sudo"]),
            Distro::Debian => Some(&["apt-get", "install", "-y", "sudo"]),
            Distro::Unknown => None,
        }
    }
}

impl ContainerService {
    /// Prepare a container for the caller to enter, returning the argument
    /// vector the client executes in place of its own process.
    ///
    /// Synchronous from the client's perspective: no Operation object is
    /// involved, the triple comes back in the method reply.
    pub async fn prepare_enter(
        &self,
        caller: &CallerIdentity,
        container: &str,
        command: &[String],
    ) -> Result<Vec<String>> {
        let name = if container.is_empty() {
            self.config.default_container.clone()
        } else {
            container.to_string()
        };
        if name.is_empty() {
            return Err(KapsuleError::ContainerNotFound(
                "no container named and no default_container configured".to_string(),
            ));
        }

        // Step 1: resolve the target and get it Running.
        let instance = self.get_existing(&name).await?;
        match instance.container_status() {
            ContainerStatus::Running => {}
            ContainerStatus::Stopped => {
                info!("Starting container '{}' for enter", name);
                let op = self
                    .incus
                    .update_instance_state(&name, crate::incus::StateAction::Start, false, 0)
                    .await?;
                let done = self
                    .incus
                    .wait_operation(&op.id, std::time::Duration::from_secs(120), None)
                    .await?;
                if !done.succeeded() {
                    return Err(KapsuleError::Backend {
                        code: done.status_code,
                        message: done.failure(),
                    });
                }
                self.wait_until_running(&name).await?;
            }
            ContainerStatus::Starting => {
                self.wait_until_running(&name).await?;
            }
            other => {
                return Err(KapsuleError::ContainerInvalidState {
                    name: name.clone(),
                    status: other.as_str().to_string(),
                    action: "enter",
                })
            }
        }

        // Steps 2 and 3: make sure the caller's account exists inside.
        self.ensure_user(&name, caller).await?;

        // Step 4: bind the caller's home into the container.
        self.ensure_home_mount(&name, caller).await?;

        // Step 5: wire up display and runtime sockets through hostfs.
        self.materialize_runtime_links(&name, caller).await;

        // Step 6: hand back the exec vector.
        Ok(compose_exec_args(&name, caller, command))
    }

    /// Probe /etc/passwd for the caller's uid and provision the account if
    /// it is missing, with distro-appropriate tooling and admin group.
    async fn ensure_user(&self, name: &str, caller: &CallerIdentity) -> Result<()> {
        let passwd = self
            .incus
            .pull_file(name, "/etc/passwd")
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        if passwd_has_uid(&passwd, caller.uid) {
            debug!("uid {} already present in '{}'", caller.uid, name);
            return Ok(());
        }

        let os_release = self
            .incus
            .pull_file(name, "/etc/os-release")
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let distro = detect_distro(&os_release);
        let admin_group = distro.admin_group();

        info!(
            "Provisioning user '{}' (uid {}) in container '{}'",
            caller.username, caller.uid, name
        );

        let uid = caller.uid.to_string();
        let gid = caller.gid.to_string();
        let user = caller.username.as_str();
        let home = caller.home.as_str();

        match distro {
            Distro::Alpine => {
                self.exec_tolerant(name, &["addgroup", "-g", &gid, user]).await;
                self.exec_tolerant(name, &["adduser", "-u", &uid, "-D", "-H", "-h", home, user])
                    .await;
                self.exec_tolerant(name, &["addgroup", user, admin_group]).await;
            }
            _ => {
                self.exec_tolerant(name, &["groupadd", "-o", "-g", &gid, user])
                    .await;
                self.exec_tolerant(
                    name,
                    &[
                        "useradd", "-o", "-M", "-u", &uid, "-g", &gid, "-d", home, "-s",
                        "/bin/bash", user,
                    ],
                )
                .await;
                self.exec_tolerant(name, &["usermod", "-aG", admin_group, user])
                    .await;
            }
        }

        self.ensure_sudo(name, distro).await;

        // Admin group members get passwordless sudo inside the container.
        // One drop-in per provisioned user so callers never share a file.
        let sudoers = format!("%{admin_group} ALL=(ALL) NOPASSWD:ALL\n");
        self.incus
            .push_file(
                name,
                &format!("/etc/sudoers.d/{user}"),
                sudoers.as_bytes(),
                "0440",
                0,
                0,
            )
            .await?;

        Ok(())
    }

    /// Run a provisioning command, downgrading failures to warnings; a user
    /// or group that already exists is business as usual.
    async fn exec_tolerant(&self, name: &str, command: &[&str]) {
        match self.exec_root(name, command).await {
            Ok(result) if result.ok() => {}
            Ok(result) => {
                if !result.stderr.contains("already exists")
                    && !result.stderr.contains("in use")
                {
                    warn!("{} in '{}': {}", command[0], name, result.stderr);
                }
            }
            Err(e) => warn!("{} in '{}': {}", command[0], name, e),
        }
    }

    async fn ensure_sudo(&self, name: &str, distro: Distro) {
        let probe = self
            .exec_root(name, &["sh", "-c", "command -v sudo"])
            .await;
        if matches!(&probe, Ok(result) if result.ok()) {
            return;
        }

        let Some(install) = distro.install_sudo_command() else {
            warn!("sudo missing in '{}' and distro is unknown, leaving as is", name);
            return;
        };
        info!("Installing sudo in container '{}'", name);
        match self
            .incus
            .exec_wait(
                name,
                install,
                &HashMap::new(),
                0,
                0,
                std::time::Duration::from_secs(300),
            )
            .await
        {
            Ok(result) if !result.ok() => {
                warn!("installing sudo in '{}' failed: {}", name, result.stderr)
            }
            Err(e) => warn!("installing sudo in '{}' failed: {}", name, e),
            Ok(_) => {}
        }
    }

    /// Attach the caller's home as a disk device unless an equivalent bind
    /// is already on the device list.
    async fn ensure_home_mount(&self, name: &str, caller: &CallerIdentity) -> Result<()> {
        let instance = self.get_existing(name).await?;
        let already_mounted = instance.devices.values().any(|device| {
            device.get("type").map(String::as_str) == Some("disk")
                && device.get("source").map(String::as_str) == Some(caller.home.as_str())
        });
        if already_mounted {
            return Ok(());
        }

        info!(
            "Mounting home directory {} into container '{}'",
            caller.home, name
        );
        let mut device = HashMap::new();
        device.insert("type".to_string(), "disk".to_string());
        device.insert("source".to_string(), caller.home.clone());
        device.insert("path".to_string(), caller.home.clone());
        device.insert("shift".to_string(), "false".to_string());
        self.incus
            .add_instance_device(name, &format!("kapsule-home-{}", caller.username), device)
            .await
    }

    /// Create the runtime and display symlinks, all pointing through the
    /// hostfs mount. Every step is idempotent; an existing link is fine.
    async fn materialize_runtime_links(&self, name: &str, caller: &CallerIdentity) {
        let uid = caller.uid;
        let gid = caller.gid;
        let runtime_dir = format!("/run/user/{uid}");

        if let Err(e) = self.incus.mkdir(name, "/run/user", "0755", 0, 0).await {
            debug!("mkdir /run/user in '{}': {}", name, e);
        }
        if let Err(e) = self.incus.mkdir(name, &runtime_dir, "0700", uid, gid).await {
            debug!("mkdir {} in '{}': {}", runtime_dir, name, e);
        }
        if let Err(e) = self.incus.mkdir(name, "/tmp/.X11-unix", "1777", 0, 0).await {
            debug!("mkdir /tmp/.X11-unix in '{}': {}", name, e);
        }

        for (link, target) in runtime_symlinks(uid, &caller.env) {
            if let Err(e) = self.incus.create_symlink(name, &link, &target, uid, gid).await {
                debug!("symlink {} in '{}': {}", link, name, e);
            }
        }
    }
}

/// True when a passwd line carries the given uid (third field).
fn passwd_has_uid(passwd: &str, uid: u32) -> bool {
    let needle = uid.to_string();
    passwd.lines().any(|line| {
        line.split(':').nth(2).map(str::trim) == Some(needle.as_str())
    })
}

/// Classify a container's distro from its /etc/os-release content.
fn detect_distro(os_release: &str) -> Distro {
    let mut id = String::new();
    let mut id_like = String::new();
    for line in os_release.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = value.trim_matches('"').to_ascii_lowercase();
        } else if let Some(value) = line.strip_prefix("ID_LIKE=") {
            id_like = value.trim_matches('"').to_ascii_lowercase();
        }
    }

    let matches_family = |family: &str| id == family || id_like.split_whitespace().any(|t| t == family);
    if matches_family("alpine") {
        Distro::Alpine
    } else if matches_family("arch") {
        Distro::Arch
    } else if matches_family("fedora") || id == "rhel" || id_like.contains("rhel") {
        Distro::Fedora
    } else if matches_family("debian") || id == "ubuntu" {
        Distro::Debian
    } else {
        Distro::Unknown
    }
}

/// X display number from a DISPLAY value like ":0" or ":1.0".
fn display_number(display: &str) -> Option<&str> {
    let rest = display.strip_prefix(':')?;
    let number = rest.split('.').next()?;
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(number)
}

/// Plan the symlinks for one caller: (link path, target) pairs, each target
/// resolving through the hostfs mount.
fn runtime_symlinks(uid: u32, env: &HashMap<String, String>) -> Vec<(String, String)> {
    let runtime_dir = format!("/run/user/{uid}");
    let host_runtime_dir = format!("{HOSTFS_PATH}{runtime_dir}");
    let mut links = Vec::new();

    if let Some(wayland) = env.get("WAYLAND_DISPLAY") {
        if !wayland.is_empty() && !wayland.contains('/') {
            links.push((
                format!("{runtime_dir}/{wayland}"),
                format!("{host_runtime_dir}/{wayland}"),
            ));
        }
    }

    if let Some(xauthority) = env.get("XAUTHORITY") {
        if let Some(basename) = xauthority.rsplit('/').next() {
            if !basename.is_empty() {
                links.push((
                    format!("{runtime_dir}/{basename}"),
                    format!("{HOSTFS_PATH}{xauthority}"),
                ));
            }
        }
    }

    for socket in ["pipewire-0", "pulse", "bus"] {
        links.push((
            format!("{runtime_dir}/{socket}"),
            format!("{host_runtime_dir}/{socket}"),
        ));
    }

    if let Some(number) = env.get("DISPLAY").and_then(|d| display_number(d)) {
        links.push((
            format!("/tmp/.X11-unix/X{number}"),
            format!("{HOSTFS_PATH}/tmp/.X11-unix/X{number}"),
        ));
    }

    links
}

/// The vector the client executes: an incus exec invocation that drops the
/// caller into the container as themselves, environment wired up.
fn compose_exec_args(name: &str, caller: &CallerIdentity, command: &[String]) -> Vec<String> {
    let mut args = vec![
        INCUS_CLI.to_string(),
        "exec".to_string(),
        name.to_string(),
        "--user".to_string(),
        caller.uid.to_string(),
        "--group".to_string(),
        caller.gid.to_string(),
        "--cwd".to_string(),
        caller.home.clone(),
    ];

    for key in ["TERM", "DISPLAY", "WAYLAND_DISPLAY", "XAUTHORITY"] {
        if let Some(value) = caller.env.get(key) {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
    }
    args.push("--env".to_string());
    args.push(format!("XDG_RUNTIME_DIR=/run/user/{}", caller.uid));

    args.push("--".to_string());
    if command.is_empty() {
        // Interactive login shell as the provisioned user.
        args.extend([
            "login".to_string(),
            "-p".to_string(),
            "-f".to_string(),
            caller.username.clone(),
        ]);
    } else {
        args.extend(command.iter().cloned());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_caller() -> CallerIdentity {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("DISPLAY".to_string(), ":0".to_string());
        env.insert("WAYLAND_DISPLAY".to_string(), "wayland-0".to_string());
        env.insert(
            "XAUTHORITY".to_string(),
            "/run/user/1000/xauth_abc".to_string(),
        );
        CallerIdentity {
            uid: 1000,
            gid: 1000,
            pid: 4242,
            username: "alex".to_string(),
            home: "/home/alex".to_string(),
            env,
        }
    }

    #[test]
    fn passwd_probe_finds_uid_in_third_field() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
                      alex:x:1000:1000::/home/alex:/bin/bash\n";
        assert!(passwd_has_uid(passwd, 1000));
        assert!(passwd_has_uid(passwd, 0));
        assert!(!passwd_has_uid(passwd, 1001));
        // A gid of 1000 on another line must not count as uid 1000.
        let tricky = "svc:x:999:1000::/var/svc:/sbin/nologin\n";
        assert!(!passwd_has_uid(tricky, 1000));
    }

    #[test]
    fn distro_detection_covers_the_families() {
        assert_eq!(detect_distro("ID=alpine\n"), Distro::Alpine);
        assert_eq!(detect_distro("ID=arch\n"), Distro::Arch);
        assert_eq!(detect_distro("ID=fedora\n"), Distro::Fedora);
        assert_eq!(detect_distro("ID=debian\n"), Distro::Debian);
        assert_eq!(
            detect_distro("ID=ubuntu\nID_LIKE=debian\n"),
            Distro::Debian
        );
        assert_eq!(
            detect_distro("ID=manjaro\nID_LIKE=\"arch\"\n"),
            Distro::Arch
        );
        assert_eq!(detect_distro("ID=almalinux\nID_LIKE=\"rhel centos fedora\"\n"), Distro::Fedora);
        assert_eq!(detect_distro(""), Distro::Unknown);
    }

    #[test]
    fn admin_groups_match_distro_convention() {
        assert_eq!(Distro::Arch.admin_group(), "wheel");
        assert_eq!(Distro::Fedora.admin_group(), "wheel");
        assert_eq!(Distro::Debian.admin_group(), "sudo");
        assert_eq!(Distro::Alpine.admin_group(), "adm");
    }

    #[test]
    fn display_number_parsing() {
        assert_eq!(display_number(":0"), Some("0"));
        assert_eq!(display_number(":1.0"), Some("1"));
        assert_eq!(display_number("localhost:10.0"), None);
        assert_eq!(display_number(""), None);
        assert_eq!(display_number(":"), None);
    }

    #[test]
    fn runtime_symlinks_route_through_hostfs() {
        let caller = test_caller();
        let links = runtime_symlinks(caller.uid, &caller.env);

        let expect = |link: &str, target: &str| {
            assert!(
                links.iter().any(|(l, t)| l == link && t == target),
                "missing {link} -> {target} in {links:?}"
            );
        };
        expect(
            "/run/user/1000/wayland-0",
            "/.kapsule/host/run/user/1000/wayland-0",
        );
        expect(
            "/run/user/1000/xauth_abc",
            "/.kapsule/host/run/user/1000/xauth_abc",
        );
        expect(
            "/run/user/1000/pipewire-0",
            "/.kapsule/host/run/user/1000/pipewire-0",
        );
        expect("/run/user/1000/pulse", "/.kapsule/host/run/user/1000/pulse");
        expect("/run/user/1000/bus", "/.kapsule/host/run/user/1000/bus");
        expect("/tmp/.X11-unix/X0", "/.kapsule/host/tmp/.X11-unix/X0");
    }

    #[test]
    fn runtime_symlinks_without_display_env() {
        let links = runtime_symlinks(1000, &HashMap::new());
        // Only the three unconditional sockets remain.
        assert_eq!(links.len(), 3);
        assert!(links.iter().all(|(l, _)| l.starts_with("/run/user/1000/")));
    }

    #[test]
    fn exec_args_for_interactive_shell() {
        let caller = test_caller();
        let args = compose_exec_args("test-enter", &caller, &[]);

        assert_eq!(args[0], "incus");
        assert_eq!(args[1], "exec");
        assert_eq!(args[2], "test-enter");

        let joined = args.join(" ");
        assert!(joined.contains("--user 1000"));
        assert!(joined.contains("--group 1000"));
        assert!(joined.contains("--cwd /home/alex"));
        assert!(joined.contains("--env XDG_RUNTIME_DIR=/run/user/1000"));
        assert!(joined.contains("--env DISPLAY=:0"));
        assert!(joined.contains("--env WAYLAND_DISPLAY=wayland-0"));
        assert!(joined.ends_with("-- login -p -f alex"));
    }

    #[test]
    fn exec_args_with_explicit_command() {
        let caller = test_caller();
        let command = vec!["ls".to_string(), "-la".to_string()];
        let args = compose_exec_args("dev", &caller, &command);
        let separator = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[separator + 1..], ["ls", "-la"]);
    }

    #[test]
    fn exec_args_are_stable_across_calls() {
        let caller = test_caller();
        let first = compose_exec_args("dev", &caller, &[]);
        let second = compose_exec_args("dev", &caller, &[]);
        assert_eq!(first, second);
    }
}

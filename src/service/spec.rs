use std::collections::HashMap;

use crate::error::{KapsuleError, Result};
use crate::incus::{InstanceSource, InstancesPost};

/// Incus config key holding the kapsule mode of a container.
pub const MODE_KEY: &str = "user.kapsule.mode";

/// Incus config key recording the Ptyxis terminal profile, if one was made.
pub const PTYXIS_PROFILE_KEY: &str = "user.kapsule.ptyxis-profile";

/// Where the host root filesystem is mounted inside every container.
pub const HOSTFS_PATH: &str = "/.kapsule/host";

/// The closed set of container modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    Default,
    Session,
    DbusMux,
}

impl ContainerMode {
    /// dbus-mux implies session mode, so the mux flag wins.
    pub fn from_flags(session_mode: bool, dbus_mux: bool) -> Self {
        if dbus_mux {
            ContainerMode::DbusMux
        } else if session_mode {
            ContainerMode::Session
        } else {
            ContainerMode::Default
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "session" => ContainerMode::Session,
            "dbus-mux" => ContainerMode::DbusMux,
            _ => ContainerMode::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerMode::Default => "default",
            ContainerMode::Session => "session",
            ContainerMode::DbusMux => "dbus-mux",
        }
    }
}

/// Container names follow the backend rule: letters, digits, and hyphens,
/// beginning with a letter. Incus also caps names at 63 characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(KapsuleError::InvalidArgument(
            "container name must not be empty".to_string(),
        ));
    }
    if name.len() > 63 {
        return Err(KapsuleError::InvalidArgument(format!(
            "container name '{name}' is longer than 63 characters"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('-');
    if !first.is_ascii_alphabetic() {
        return Err(KapsuleError::InvalidArgument(format!(
            "container name '{name}' must begin with a letter"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(KapsuleError::InvalidArgument(format!(
            "container name '{name}' may only contain letters, digits, and hyphens"
        )));
    }
    Ok(())
}

/// Parse an image reference like `images:ubuntu/24.04` into an instance
/// source. The server alias maps to a pre-registered simplestreams endpoint;
/// a bare image path defaults to the community image server.
pub fn parse_image(image: &str) -> Result<InstanceSource> {
    let (server_alias, alias) = match image.split_once(':') {
        Some((server, path)) => (server, path),
        None => ("images", image),
    };

    if alias.is_empty() {
        return Err(KapsuleError::InvalidArgument(format!(
            "invalid image reference: '{image}'"
        )));
    }

    let server = match server_alias {
        "images" => "https://images.linuxcontainers.org",
        "ubuntu" => "https://cloud-images.ubuntu.com/releases",
        other => {
            return Err(KapsuleError::InvalidArgument(format!(
                "unknown image server '{other}'; use an 'images:' or 'ubuntu:' prefix"
            )))
        }
    };

    Ok(InstanceSource {
        source_type: "image".to_string(),
        protocol: "simplestreams".to_string(),
        server: server.to_string(),
        alias: alias.to_string(),
    })
}

fn device(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Build the creation request for a kapsule container: privileged and
/// nesting-enabled so Docker/Podman work inside, host networking, and the
/// host root mounted at /.kapsule/host for session wiring.
pub fn kapsule_instance(
    name: &str,
    source: InstanceSource,
    mode: ContainerMode,
) -> InstancesPost {
    let mut config = HashMap::new();
    config.insert("security.privileged".to_string(), "true".to_string());
    config.insert("security.nesting".to_string(), "true".to_string());
    config.insert("raw.lxc".to_string(), "lxc.net.0.type=none\n".to_string());
    config.insert(MODE_KEY.to_string(), mode.as_str().to_string());

    let mut devices = HashMap::new();
    devices.insert(
        "root".to_string(),
        device(&[("type", "disk"), ("path", "/"), ("pool", "default")]),
    );
    devices.insert("gpu".to_string(), device(&[("type", "gpu")]));
    devices.insert(
        "hostfs".to_string(),
        device(&[
            ("type", "disk"),
            ("source", "/"),
            ("path", HOSTFS_PATH),
            ("recursive", "true"),
            ("propagation", "rslave"),
            ("shift", "false"),
        ]),
    );

    InstancesPost {
        name: name.to_string(),
        source,
        config: Some(config),
        devices: Some(devices),
        profiles: None,
        instance_type: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_pass() {
        for name in ["a", "dev", "test-life", "box2", "a-b-c"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_names_are_rejected()  {
        for name in ["", "2box", "-box", "my box", "box_1", "böx"] {
            assert!(
                matches!(validate_name(name), Err(KapsuleError::InvalidArgument(_))),
                "{name} should be rejected"
            );
        }
        let long = format!("a{}", "b".repeat(63));
        assert!(validate_name(&long).is_err());
    }

    #[test]
    fn image_with_server_alias() {
        let source = parse_image("images:alpine/edge").unwrap();
        assert_eq!(source.server, "https://images.linuxcontainers.org");
        assert_eq!(source.alias, "alpine/edge");
        assert_eq!(source.protocol, "simplestreams");

        let source = parse_image("ubuntu:24.04").unwrap();
        assert_eq!(source.server, "https://cloud-images.ubuntu.com/releases");
        assert_eq!(source.alias, "24.04");
    }

    #[test]
    fn bare_image_defaults_to_community_server() {
        let source = parse_image("archlinux").unwrap();
        assert_eq!(source.server, "https://images.linuxcontainers.org");
        assert_eq!(source.alias, "archlinux");
    }

    #[test]
    fn unknown_server_and_empty_path_fail() {
        assert!(parse_image("dockerhub:alpine").is_err());
        assert!(parse_image("images:").is_err());
    }

    #[test]
    fn mode_from_flags() {
        assert_eq!(ContainerMode::from_flags(false, false), ContainerMode::Default);
        assert_eq!(ContainerMode::from_flags(true, false), ContainerMode::Session);
        // dbus-mux implies session, recorded as the stronger mode
        assert_eq!(ContainerMode::from_flags(false, true), ContainerMode::DbusMux);
        assert_eq!(ContainerMode::from_flags(true, true), ContainerMode::DbusMux);
    }

    #[test]
    fn mode_round_trips_through_config_value() {
        for mode in [
            ContainerMode::Default,
            ContainerMode::Session,
            ContainerMode::DbusMux,
        ] {
            assert_eq!(ContainerMode::parse(mode.as_str()), mode);
        }
        assert_eq!(ContainerMode::parse("bogus"), ContainerMode::Default);
    }

    #[test]
    fn kapsule_spec_carries_required_config_and_devices() {
        let source = parse_image("images:archlinux").unwrap();
        let post = kapsule_instance("dev", source, ContainerMode::Session);

        let config = post.config.unwrap();
        assert_eq!(config.get("security.privileged").unwrap(), "true");
        assert_eq!(config.get("security.nesting").unwrap(), "true");
        assert_eq!(config.get("raw.lxc").unwrap(), "lxc.net.0.type=none\n");
        assert_eq!(config.get(MODE_KEY).unwrap(), "session");

        let devices = post.devices.unwrap();
        assert_eq!(devices.get("root").unwrap().get("pool").unwrap(), "default");
        assert_eq!(devices.get("gpu").unwrap().get("type").unwrap(), "gpu");
        let hostfs = devices.get("hostfs").unwrap();
        assert_eq!(hostfs.get("source").unwrap(), "/");
        assert_eq!(hostfs.get("path").unwrap(), HOSTFS_PATH);
        assert_eq!(hostfs.get("recursive").unwrap(), "true");
    }
}

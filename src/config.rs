use std::collections::HashMap;
use std::path::Path;

use ini::Ini;
use tracing::{debug, warn};

/// Daemon configuration, read from INI files with layered precedence:
/// `/etc/kapsule.conf` overrides `/usr/lib/kapsule.conf`.
///
/// Recognized keys live in the `[kapsule]` section:
/// - `default_container`: container used by PrepareEnter when none is named
/// - `default_image`: image used by CreateContainer when none is given
#[derive(Debug, Clone)]
pub struct KapsuleConfig {
    pub default_container: String,
    pub default_image: String,
}

pub const CONFIG_PATHS: &[&str] = &["/etc/kapsule.conf", "/usr/lib/kapsule.conf"];

const SECTION: &str = "kapsule";

impl Default for KapsuleConfig {
    fn default() -> Self {
        Self {
            default_container: "kapsule".to_string(),
            default_image: "images:ubuntu/24.04".to_string(),
        }
    }
}

impl KapsuleConfig {
    /// Load configuration from the standard paths.
    pub fn load() -> Self {
        Self::load_from(CONFIG_PATHS)
    }

    /// Load from an explicit path list, highest priority first. Files are
    /// read lowest priority first so higher-priority values override.
    pub fn load_from<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut config = Self::default();

        for path in paths.iter().rev() {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }

            let ini = match Ini::load_from_file(path) {
                Ok(ini) => ini,
                Err(e) => {
                    warn!("Skipping malformed config file {}: {}", path.display(), e);
                    continue;
                }
            };

            if let Some(section) = ini.section(Some(SECTION)) {
                if let Some(value) = section.get("default_container") {
                    config.default_container = value.to_string();
                }
                if let Some(value) = section.get("default_image") {
                    config.default_image = value.to_string();
                }
                debug!("Loaded config from {}", path.display());
            }
        }

        config
    }

    /// The `a{ss}` map returned by the Manager's GetConfig method.
    pub fn as_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            "default_container".to_string(),
            self.default_container.clone(),
        );
        map.insert("default_image".to_string(), self.default_image.clone());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_when_no_files_exist() {
        let config = KapsuleConfig::load_from(&["/nonexistent/kapsule.conf"]);
        assert_eq!(config.default_container, "kapsule");
        assert_eq!(config.default_image, "images:ubuntu/24.04");
    }

    #[test]
    fn higher_priority_file_overrides_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let etc = write_conf(
            &dir,
            "etc.conf",
            "[kapsule]\ndefault_container = work\n",
        );
        let lib = write_conf(
            &dir,
            "lib.conf",
            "[kapsule]\ndefault_container = lib-box\ndefault_image = images:alpine/edge\n",
        );

        let config = KapsuleConfig::load_from(&[etc, lib]);
        assert_eq!(config.default_container, "work");
        // Not set in the higher-priority file, so the fallback wins.
        assert_eq!(config.default_image, "images:alpine/edge");
    }

    #[test]
    fn unknown_sections_and_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_conf(
            &dir,
            "kapsule.conf",
            "[other]\ndefault_container = nope\n[kapsule]\nsurprise = 1\n",
        );

        let config = KapsuleConfig::load_from(&[path]);
        assert_eq!(config.default_container, "kapsule");
    }

    #[test]
    fn config_map_carries_both_keys() {
        let config = KapsuleConfig {
            default_container: "dev".into(),
            default_image: "images:archlinux".into(),
        };
        let map = config.as_map();
        assert_eq!(map.get("default_container").unwrap(), "dev");
        assert_eq!(map.get("default_image").unwrap(), "images:archlinux");
    }
}

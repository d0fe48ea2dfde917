use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Best-effort Ptyxis terminal profile management.
///
/// Profiles are written through `gsettings` with the relocatable Ptyxis
/// profile schema. When Ptyxis (or gsettings) is not installed every
/// operation quietly does nothing; callers never fail on this.
pub struct PtyxisProfiles;

const PTYXIS_SCHEMA: &str = "org.gnome.Ptyxis";
const PTYXIS_PROFILE_SCHEMA: &str = "org.gnome.Ptyxis.Profile";
const PTYXIS_PROFILE_PATH: &str = "/org/gnome/Ptyxis/Profiles/";

impl PtyxisProfiles {
    pub fn new() -> Self {
        Self
    }

    /// Create a profile that opens a terminal inside the container.
    /// Returns the profile UUID, or None when Ptyxis is unavailable.
    pub async fn create_profile(&self, container_name: &str) -> Option<String> {
        let uuids = match self.read_profile_uuids().await {
            Some(uuids) => uuids,
            None => return None,
        };

        let profile_uuid = Uuid::new_v4().to_string();
        let schema = format!(
            "{PTYXIS_PROFILE_SCHEMA}:{PTYXIS_PROFILE_PATH}{profile_uuid}/"
        );

        let custom_command = format!("kapsule enter {container_name}");
        let steps: [&[&str]; 3] = [
            &["set", &schema, "label", container_name],
            &["set", &schema, "custom-command", &custom_command],
            &["set", &schema, "use-custom-command", "true"],
        ];
        for args in steps {
            if !self.gsettings(args).await {
                debug!("Failed to write Ptyxis profile settings");
                return None;
            }
        }

        let mut updated = uuids;
        updated.push(profile_uuid.clone());
        if !self
            .gsettings(&[
                "set",
                PTYXIS_SCHEMA,
                "profile-uuids",
                &format_string_list(&updated),
            ])
            .await
        {
            return None;
        }

        info!(
            "Created Ptyxis profile {} for container {}",
            profile_uuid, container_name
        );
        Some(profile_uuid)
    }

    /// Remove a profile from the Ptyxis profile list.
    pub async fn delete_profile(&self, profile_uuid: &str) {
        let uuids = match self.read_profile_uuids().await {
            Some(uuids) => uuids,
            None => return,
        };
        let remaining: Vec<String> = uuids.into_iter().filter(|u| u != profile_uuid).collect();
        if self
            .gsettings(&[
                "set",
                PTYXIS_SCHEMA,
                "profile-uuids",
                &format_string_list(&remaining),
            ])
            .await
        {
            info!("Deleted Ptyxis profile {}", profile_uuid);
        }
    }

    async fn read_profile_uuids(&self) -> Option<Vec<String>> {
        let output = Command::new("gsettings")
            .args(["get", PTYXIS_SCHEMA, "profile-uuids"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            debug!("Ptyxis schema not available, skipping profile management");
            return None;
        }
        Some(parse_string_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn gsettings(&self, args: &[&str]) -> bool {
        match Command::new("gsettings").args(args).output().await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("gsettings not runnable: {}", e);
                false
            }
        }
    }
}

impl Default for PtyxisProfiles {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a GVariant `as` literal like `['a', 'b']` into its elements.
fn parse_string_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("@as").unwrap_or(trimmed).trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or("");
    inner
        .split(',')
        .map(|item| item.trim().trim_matches('\'').trim_matches('"').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Render elements back into a GVariant `as` literal.
fn format_string_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| format!("'{item}'")).collect();
    format!("[{}]", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gvariant_string_lists() {
        assert_eq!(
            parse_string_list("['aa', 'bb']"),
            vec!["aa".to_string(), "bb".to_string()]
        );
        assert_eq!(parse_string_list("@as []"), Vec::<String>::new());
        assert_eq!(parse_string_list("[]"), Vec::<String>::new());
    }

    #[test]
    fn formats_round_trip() {
        let items = vec!["one".to_string(), "two".to_string()];
        let formatted = format_string_list(&items);
        assert_eq!(formatted, "['one', 'two']");
        assert_eq!(parse_string_list(&formatted), items);
    }
}

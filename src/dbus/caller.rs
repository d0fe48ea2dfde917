use std::collections::HashMap;

use zbus::names::BusName;
use zbus::Connection;

use crate::error::{KapsuleError, Result};
use crate::service::CallerIdentity;

/// Environment variables captured from the caller's process. The session
/// slice drives display and runtime wiring; USER/LOGNAME/HOME name the
/// account to provision.
const CAPTURED_ENV: &[&str] = &[
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "XAUTHORITY",
    "XDG_RUNTIME_DIR",
    "TERM",
    "LANG",
    "SHELL",
    "PATH",
    "USER",
    "LOGNAME",
    "HOME",
];

/// Resolves a bus caller's unique name into uid, gid, pid, and environment,
/// combining the bus daemon's credentials query with /proc.
pub struct CallerResolver {
    connection: Connection,
}

impl CallerResolver {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn resolve(&self, caller: BusName<'_>) -> Result<CallerIdentity> {
        let proxy = zbus::fdo::DBusProxy::new(&self.connection)
            .await
            .map_err(|e| KapsuleError::Internal(e.into()))?;

        let credentials = proxy
            .get_connection_credentials(caller.clone())
            .await
            .map_err(|e| KapsuleError::UnknownCaller(format!("{caller}: {e}")))?;

        let uid = credentials
            .unix_user_id()
            .ok_or_else(|| KapsuleError::UnknownCaller(format!("{caller}: no unix uid")))?;
        let pid = credentials
            .process_id()
            .ok_or_else(|| KapsuleError::UnknownCaller(format!("{caller}: no process id")))?;

        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
            .await
            .map_err(|e| KapsuleError::CallerGone(format!("pid {pid}: {e}")))?;
        let gid = parse_status_gid(&status).unwrap_or(uid);

        // An unreadable environment is not fatal; enter proceeds without
        // display wiring.
        let env = match tokio::fs::read(format!("/proc/{pid}/environ")).await {
            Ok(bytes) => parse_environ(&bytes),
            Err(_) => HashMap::new(),
        };

        let passwd = tokio::fs::read_to_string("/etc/passwd")
            .await
            .unwrap_or_default();
        let entry = passwd_entry(&passwd, uid);

        let username = env
            .get("USER")
            .or_else(|| env.get("LOGNAME"))
            .cloned()
            .or_else(|| entry.as_ref().map(|(name, _)| name.clone()))
            .unwrap_or_else(|| format!("user{uid}"));
        let home = env
            .get("HOME")
            .cloned()
            .or_else(|| entry.as_ref().map(|(_, home)| home.clone()))
            .unwrap_or_else(|| format!("/home/{username}"));

        Ok(CallerIdentity {
            uid,
            gid,
            pid,
            username,
            home,
            env,
        })
    }
}

/// Real gid from a /proc/<pid>/status dump ("Gid: real effective saved fs").
fn parse_status_gid(status: &str) -> Option<u32> {
    status
        .lines()
        .find(|line| line.starts_with("Gid:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// NUL-separated environ block filtered down to the captured slice.
fn parse_environ(bytes: &[u8]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for chunk in bytes.split(|b| *b == 0) {
        let text = String::from_utf8_lossy(chunk);
        if let Some((key, value)) = text.split_once('=') {
            if CAPTURED_ENV.contains(&key) {
                env.insert(key.to_string(), value.to_string());
            }
        }
    }
    env
}

/// (name, home) from the host passwd database for a uid.
fn passwd_entry(passwd: &str, uid: u32) -> Option<(String, String)> {
    let needle = uid.to_string();
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 6 && fields[2] == needle {
            Some((fields[0].to_string(), fields[5].to_string()))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_comes_from_the_status_line() {
        let status = "Name:\tbash\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(parse_status_gid(status), Some(1000));
        assert_eq!(parse_status_gid("Name:\tbash\n"), None);
    }

    #[test]
    fn environ_keeps_only_the_captured_slice() {
        let raw = b"DISPLAY=:0\0SECRET_TOKEN=hunter2\0TERM=xterm\0HOME=/home/alex\0";
        let env = parse_environ(raw);
        assert_eq!(env.get("DISPLAY").unwrap(), ":0");
        assert_eq!(env.get("TERM").unwrap(), "xterm");
        assert_eq!(env.get("HOME").unwrap(), "/home/alex");
        assert!(!env.contains_key("SECRET_TOKEN"));
    }

    #[test]
    fn environ_tolerates_garbage() {
        let raw = b"\0novalue\0=weird\0PATH=/usr/bin\0";
        let env = parse_environ(raw);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin");
    }

    #[test]
    fn passwd_entry_by_uid() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
                      alex:x:1000:1000:Alex:/home/alex:/bin/zsh\n";
        assert_eq!(
            passwd_entry(passwd, 1000),
            Some(("alex".to_string(), "/home/alex".to_string()))
        );
        assert_eq!(passwd_entry(passwd, 42), None);
    }
}

//! Runtime and snapshot configuration
//!
//! Plain structs with sane defaults. `from_env()` lets a native host tweak
//! them through `ISOBOX_*` variables; unparsable values fall back to the
//! defaults rather than failing startup.

/// How the PID pool picks the next identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PidPolicy {
    /// Scan upward from the last issued PID, wrapping past `pid_max`.
    /// Freed low identifiers are only reused after the cursor wraps.
    #[default]
    Forward,
    /// Always hand out the lowest identifier that is not held
    LowestFree,
}

/// Default upper bound for PIDs (matches Linux `pid_max` default)
pub const DEFAULT_PID_MAX: u32 = 32768;

/// Where the host filesystem is mounted inside an image instance
pub const DEFAULT_MOUNT_POINT: &str = "/work";

/// Configuration for the process runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub pid_policy: PidPolicy,
    pub pid_max: u32,
    pub mount_point: String,
    /// Return a handle's PID to the pool once it reaches a terminal state
    pub release_pids: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pid_policy: PidPolicy::Forward,
            pid_max: DEFAULT_PID_MAX,
            mount_point: DEFAULT_MOUNT_POINT.to_string(),
            release_pids: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `ISOBOX_PID_MAX`, `ISOBOX_PID_POLICY` and
    /// `ISOBOX_MOUNT_POINT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(max) = lookup("ISOBOX_PID_MAX").and_then(|s| s.parse::<u32>().ok())
            && max > 0
        {
            config.pid_max = max;
        }

        if let Some(policy) = lookup("ISOBOX_PID_POLICY") {
            match policy.as_str() {
                "forward" => config.pid_policy = PidPolicy::Forward,
                "lowest-free" => config.pid_policy = PidPolicy::LowestFree,
                _ => {}
            }
        }

        if let Some(mount) = lookup("ISOBOX_MOUNT_POINT")
            && mount.starts_with('/')
            && mount.len() > 1
        {
            config.mount_point = mount;
        }

        config
    }
}

/// Configuration for the snapshot manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Durable store key, also the archive entry holding the payload
    pub store_key: String,
    /// File name stem used for downloads
    pub archive_name: String,
    /// Copy a version-mismatched archive aside before discarding it
    pub backup_on_mismatch: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            store_key: "memory".to_string(),
            archive_name: "workspace".to_string(),
            backup_on_mismatch: false,
        }
    }
}

impl SnapshotConfig {
    /// Defaults overridden by `ISOBOX_SNAPSHOT_KEY` and `ISOBOX_SNAPSHOT_BACKUP`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(key) = lookup("ISOBOX_SNAPSHOT_KEY")
            && !key.is_empty()
            && !key.contains('/')
        {
            config.store_key = key;
        }

        if let Some(flag) = lookup("ISOBOX_SNAPSHOT_BACKUP") {
            config.backup_on_mismatch = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Name of the downloadable archive file
    pub fn download_file_name(&self) -> String {
        format!("{}.zip", self.archive_name)
    }

    /// Store key used for a backup of an archive written by `version`
    pub fn backup_key(&self, version: &str) -> String {
        format!("{}.backup-{}", self.store_key, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_runtime_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pid_policy, PidPolicy::Forward);
        assert_eq!(config.pid_max, 32768);
        assert_eq!(config.mount_point, "/work");
        assert!(config.release_pids);
    }

    #[test]
    fn test_runtime_env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("ISOBOX_PID_MAX", "64"),
            ("ISOBOX_PID_POLICY", "lowest-free"),
            ("ISOBOX_MOUNT_POINT", "/mnt"),
        ]));
        assert_eq!(config.pid_max, 64);
        assert_eq!(config.pid_policy, PidPolicy::LowestFree);
        assert_eq!(config.mount_point, "/mnt");
    }

    #[test]
    fn test_runtime_env_garbage_ignored() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("ISOBOX_PID_MAX", "lots"),
            ("ISOBOX_PID_POLICY", "random"),
            ("ISOBOX_MOUNT_POINT", "relative"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_snapshot_env_overrides() {
        let config = SnapshotConfig::from_lookup(lookup(&[
            ("ISOBOX_SNAPSHOT_KEY", "heap"),
            ("ISOBOX_SNAPSHOT_BACKUP", "true"),
        ]));
        assert_eq!(config.store_key, "heap");
        assert!(config.backup_on_mismatch);
    }

    #[test]
    fn test_snapshot_names() {
        let config = SnapshotConfig::default();
        assert_eq!(config.download_file_name(), "workspace.zip");
        assert_eq!(config.backup_key("0.3.1"), "memory.backup-0.3.1");
    }
}

//! CF-009: Local state: rendered templates and the per-cluster lock file.
//!
//! Layout under the state directory:
//! `<cluster>/state.lock.yaml` and `<cluster>/<stack>.json`.
//! Every write goes to a temp file first and is renamed into place.

use crate::error::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Lock file for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLock {
    pub schema: String,
    pub cluster: String,
    pub generated_at: String,
    pub generator: String,
    /// Stack name → lock, in deployment order
    #[serde(default)]
    pub stacks: IndexMap<String, StackLock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackLock {
    pub hash: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

/// Derive the lock file path for a cluster within the state directory.
pub fn lock_file_path(state_dir: &Path, cluster: &str) -> PathBuf {
    state_dir.join(cluster).join("state.lock.yaml")
}

/// Path a stack's rendered template is written to.
pub fn template_path(state_dir: &Path, cluster: &str, stack: &str) -> PathBuf {
    state_dir.join(cluster).join(format!("{}.json", stack))
}

/// Load a cluster's lock file. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, cluster: &str) -> Result<Option<StateLock>> {
    let path = lock_file_path(state_dir, cluster);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(Some(serde_yaml_ng::from_str(&content)?))
}

/// Save a lock file atomically.
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(lock)?;
    write_atomic(&lock_file_path(state_dir, &lock.cluster), yaml.as_bytes())
}

/// Write a rendered template atomically; returns its path.
pub fn save_template(
    state_dir: &Path,
    cluster: &str,
    stack: &str,
    template: &[u8],
) -> Result<PathBuf> {
    let path = template_path(state_dir, cluster, stack);
    write_atomic(&path, template)?;
    Ok(path)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Create a new empty lock for a cluster.
pub fn new_lock(cluster: &str) -> StateLock {
    StateLock {
        schema: "1.0".to_string(),
        cluster: cluster.to_string(),
        generated_at: now_iso8601(),
        generator: format!("clusterforge {}", env!("CARGO_PKG_VERSION")),
        stacks: IndexMap::new(),
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_epoch(secs)
}

fn format_epoch(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, minutes, seconds) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let mut year = 1970u64;
    let mut remaining = days;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }
    let feb = if is_leap(year) { 29 } else { 28 };
    let months = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1;
    for len in months {
        if remaining < len {
            break;
        }
        remaining -= len;
        month += 1;
    }
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(y: u64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lock() -> StateLock {
        let mut stacks = IndexMap::new();
        stacks.insert(
            "clusterforge-demo-cluster".to_string(),
            StackLock {
                hash: "blake3:abc123".to_string(),
                status: "CREATE_COMPLETE".to_string(),
                outputs: [("VPC".to_string(), "vpc-1".to_string())].into_iter().collect(),
            },
        );
        StateLock {
            schema: "1.0".to_string(),
            cluster: "demo".to_string(),
            generated_at: "2026-02-16T14:00:00Z".to_string(),
            generator: "clusterforge 0.4.0".to_string(),
            stacks,
        }
    }

    #[test]
    fn test_cf009_paths() {
        assert_eq!(
            lock_file_path(Path::new("/state"), "demo"),
            PathBuf::from("/state/demo/state.lock.yaml")
        );
        assert_eq!(
            template_path(Path::new("/state"), "demo", "clusterforge-demo-cluster"),
            PathBuf::from("/state/demo/clusterforge-demo-cluster.json")
        );
    }

    #[test]
    fn test_cf009_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();
        let loaded = load_lock(dir.path(), "demo").unwrap().unwrap();
        assert_eq!(loaded, make_lock());
        assert!(!dir.path().join("demo").join("state.lock.yaml.tmp").exists());
    }

    #[test]
    fn test_cf009_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_lock(dir.path(), "ghost").unwrap().is_none());
    }

    #[test]
    fn test_cf009_template_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_template(dir.path(), "demo", "s", b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        assert!(!dir.path().join("demo").join("s.json.tmp").exists());
    }

    #[test]
    fn test_cf009_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = make_lock();
        lock.stacks.insert(
            "aaa-later".to_string(),
            StackLock {
                hash: "blake3:x".to_string(),
                status: "CREATE_COMPLETE".to_string(),
                outputs: BTreeMap::new(),
            },
        );
        save_lock(dir.path(), &lock).unwrap();
        let loaded = load_lock(dir.path(), "demo").unwrap().unwrap();
        let keys: Vec<_> = loaded.stacks.keys().collect();
        assert_eq!(keys, vec!["clusterforge-demo-cluster", "aaa-later"]);
    }

    #[test]
    fn test_cf009_epoch_formatting() {
        assert_eq!(format_epoch(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_epoch(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_epoch(1_771_250_400), "2026-02-16T14:00:00Z");
        assert!(new_lock("demo").generated_at.ends_with('Z'));
    }
}

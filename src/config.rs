//! Store configuration, read from `<principal-root>/.opencode/swarm.yaml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::worktree::{self, DEFAULT_DB_NAME, STORE_DIR};

/// Name of the optional config file inside the store directory.
pub const CONFIG_FILE: &str = "swarm.yaml";

/// Environment override for [`StoreConfig::db_name`].
pub const DB_NAME_ENV: &str = "SWARM_DB_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file name under `.opencode/`.
    pub db_name: String,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout_ms: u64,
    /// TTL used when a reservation request does not carry one.
    pub default_reservation_ttl_secs: u64,
    /// TTL used when a lock request does not carry one.
    pub default_lock_ttl_secs: u64,
    /// Additional glob patterns (relative to the project root) scanned for
    /// stray databases on top of the built-in locations.
    pub extra_stray_locations: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_name: DEFAULT_DB_NAME.to_string(),
            busy_timeout_ms: 5000,
            default_reservation_ttl_secs: 3600,
            default_lock_ttl_secs: 30,
            extra_stray_locations: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Load the config for the repository containing `project_path`.
    ///
    /// A missing file yields the defaults; `SWARM_DB_NAME` overrides the file.
    pub fn load(project_path: &Path) -> Result<Self> {
        let root = worktree::main_repo_root(project_path)?;
        let path = root.join(STORE_DIR).join(CONFIG_FILE);
        let mut config = if path.is_file() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&raw)?
            }
        } else {
            Self::default()
        };

        if let Some(name) = std::env::var(DB_NAME_ENV).ok().filter(|s| !s.trim().is_empty()) {
            config.db_name = name;
        }

        Ok(config)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.default_reservation_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lock_ttl_secs)
    }

    /// Canonical database path for `project_path`.
    pub fn db_path(&self, project_path: &Path) -> Result<std::path::PathBuf> {
        worktree::resolve_db_path(project_path, &self.db_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // Env-var tests must not run concurrently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_file_yields_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();

        let config = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(
            config.db_path(dir.path()).unwrap(),
            dir.path().join(".opencode").join("swarm.db")
        );
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join(".opencode")).unwrap();
        fs::write(
            dir.path().join(".opencode").join(CONFIG_FILE),
            "db_name: coordination.db\nextra_stray_locations:\n  - tools/*/.opencode/*.db\n",
        )
        .unwrap();

        let config = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.db_name, "coordination.db");
        assert_eq!(config.extra_stray_locations, vec!["tools/*/.opencode/*.db"]);
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn invalid_yaml_is_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join(".opencode")).unwrap();
        fs::write(
            dir.path().join(".opencode").join(CONFIG_FILE),
            "busy_timeout_ms: [not a number",
        )
        .unwrap();

        let err = StoreConfig::load(dir.path()).unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}

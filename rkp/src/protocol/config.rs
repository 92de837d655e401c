use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::controller::ControllerConfig;
use crate::leader::LeaderConfig;
use crate::queue::ExponentialBackoff;

static PROVISIONER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?(/[a-z0-9]([-a-z0-9_.]*[a-z0-9])?)?$")
        .expect("provisioner name pattern is valid")
});

pub const DEFAULT_PROVISIONER: &str = "rk8s.io/nfs";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub xline_config: XlineConfig,
    pub nfs: NfsConfig,
    /// Name storage classes use to select this provisioner.
    pub provisioner: String,
    pub leader_election: LeaderElectionConfig,
    pub controller: ControllerSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xline_config: XlineConfig::default(),
            nfs: NfsConfig::default(),
            provisioner: DEFAULT_PROVISIONER.to_string(),
            leader_election: LeaderElectionConfig::default(),
            controller: ControllerSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for XlineConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/registry".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    /// NFS server address published in volume objects.
    pub server: String,
    /// Exported directory on the server.
    pub server_path: PathBuf,
    /// Where the export is mounted on this host.
    pub mount_path: PathBuf,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            server_path: PathBuf::new(),
            mount_path: PathBuf::from("/mount"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    /// Defaults to a random `rkp-<uuid>` per process.
    pub identity: Option<String>,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "rkp-leader".to_string(),
            identity: None,
            lease_duration_secs: 15,
            renew_deadline_secs: 10,
            retry_period_secs: 2,
        }
    }
}

impl LeaderElectionConfig {
    pub fn to_leader_config(&self) -> LeaderConfig {
        LeaderConfig {
            lease_name: self.lease_name.clone(),
            identity: self
                .identity
                .clone()
                .unwrap_or_else(|| format!("rkp-{}", uuid::Uuid::new_v4())),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub workers: usize,
    pub resync_period_secs: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub terminal_retry_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period_secs: 300,
            base_backoff_ms: 500,
            max_backoff_secs: 300,
            terminal_retry_secs: 300,
        }
    }
}

impl ControllerSection {
    pub fn to_controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_period: Duration::from_secs(self.resync_period_secs),
            terminal_retry: Duration::from_secs(self.terminal_retry_secs),
            backoff: ExponentialBackoff::new(
                Duration::from_millis(self.base_backoff_ms),
                Duration::from_secs(self.max_backoff_secs),
            ),
        }
    }
}

impl Config {
    /// Rejects settings the daemon cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.nfs.server.is_empty() {
            bail!("nfs.server is required");
        }
        if self.nfs.server_path.as_os_str().is_empty() {
            bail!("nfs.server_path is required");
        }
        if self.nfs.mount_path.as_os_str().is_empty() {
            bail!("nfs.mount_path is required");
        }
        if !PROVISIONER_NAME.is_match(&self.provisioner) {
            bail!("invalid provisioner name {:?}", self.provisioner);
        }
        if self.leader_election.enabled {
            self.leader_election
                .to_leader_config()
                .validate()
                .context("invalid leader_election section")?;
        }
        let controller = &self.controller;
        if controller.workers == 0 {
            bail!("controller.workers must be at least 1");
        }
        if controller.resync_period_secs == 0 || controller.base_backoff_ms == 0 {
            bail!("controller resync period and base backoff must be positive");
        }
        Ok(())
    }
}

/// Reads a YAML config. Sections missing from the file keep their defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.nfs.server = "10.0.0.2".to_string();
        cfg.nfs.server_path = PathBuf::from("/exports");
        cfg
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "nfs:\n  server: 10.0.0.2\n  server_path: /exports\nleader_election:\n  enabled: true\n  identity: node-a\n"
        )
        .unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.nfs.server, "10.0.0.2");
        assert_eq!(cfg.nfs.mount_path, PathBuf::from("/mount"));
        assert_eq!(cfg.provisioner, DEFAULT_PROVISIONER);
        assert_eq!(cfg.xline_config.prefix, "/registry");
        assert!(cfg.leader_election.enabled);
        assert_eq!(cfg.leader_election.lease_name, "rkp-leader");
        assert_eq!(
            cfg.leader_election.to_leader_config().identity,
            "node-a".to_string()
        );
        assert_eq!(cfg.controller.workers, 4);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_unreadable_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.yaml"), "{err:#}");
    }

    #[test]
    fn test_missing_nfs_settings_rejected() {
        assert!(Config::default().validate().is_err());

        let mut cfg = valid();
        cfg.nfs.server_path = PathBuf::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_provisioner_name_pattern() {
        for ok in ["rk8s.io/nfs", "nfs", "example.com/nfs-client_1"] {
            let mut cfg = valid();
            cfg.provisioner = ok.to_string();
            assert!(cfg.validate().is_ok(), "{ok}");
        }
        for bad in ["", "NFS", "rk8s.io/", "-nfs", "a/b/c"] {
            let mut cfg = valid();
            cfg.provisioner = bad.to_string();
            assert!(cfg.validate().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_leader_timings_checked_when_enabled() {
        let mut cfg = valid();
        cfg.leader_election.renew_deadline_secs = 20;
        assert!(cfg.validate().is_ok());
        cfg.leader_election.enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_generated_identity_is_unique() {
        let section = LeaderElectionConfig::default();
        assert_ne!(
            section.to_leader_config().identity,
            section.to_leader_config().identity
        );
    }
}

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use syncmd_index::STATE_DIR;
use syncmd_proto::Validator;
use syncmd_sync::ReplicaConfig;

use crate::discovery::PeerCandidate;
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7700";

/// One directory tree kept in sync, with its own listener and peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRoot {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub peers: Vec<PeerCandidate>,
}

fn default_enabled() -> bool {
    true
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl SyncRoot {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            enabled: true,
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
        }
    }

    /// Engine state for this root
    pub fn state_dir(&self) -> PathBuf {
        self.path.join(STATE_DIR)
    }

    fn validate(&self, device_id: &str) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) || self.name.trim() != self.name {
            bail!("Invalid root name {:?}", self.name);
        }
        if self.path.as_os_str().is_empty() {
            bail!("Root {} has an empty path", self.name);
        }
        for peer in &self.peers {
            if peer.device_id == device_id {
                bail!("Peer list of root {} contains this device ({})", self.name, device_id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub device_id: String,
    #[serde(default)]
    pub roots: Vec<SyncRoot>,
    #[serde(default)]
    pub replica: ReplicaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl DaemonConfig {
    /// Fresh configuration with a new random device id and one root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut config = Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            roots: Vec::new(),
            replica: ReplicaConfig::default(),
            scheduler: SchedulerConfig::default(),
        };
        config.add_root(root);
        config
    }

    /// Add a root named after its directory, made unique among existing roots
    pub fn add_root(&mut self, path: impl Into<PathBuf>) -> &mut SyncRoot {
        let path = path.into();
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("root")
            .to_string();
        let mut name = base.clone();
        let mut n = 2;
        while self.root(&name).is_some() {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        self.roots.push(SyncRoot::new(name, path));
        let last = self.roots.len() - 1;
        &mut self.roots[last]
    }

    pub fn root(&self, name: &str) -> Option<&SyncRoot> {
        self.roots.iter().find(|root| root.name == name)
    }

    pub fn root_mut(&mut self, name: &str) -> Option<&mut SyncRoot> {
        self.roots.iter_mut().find(|root| root.name == name)
    }

    pub fn enabled_roots(&self) -> impl Iterator<Item = &SyncRoot> {
        self.roots.iter().filter(|root| root.enabled)
    }

    /// The named root, or the only enabled one when no name is given
    pub fn select_root(&self, name: Option<&str>) -> Result<&SyncRoot> {
        if let Some(name) = name {
            return self
                .root(name)
                .with_context(|| format!("No root named {} in config", name));
        }
        let mut enabled = self.enabled_roots();
        match (enabled.next(), enabled.next()) {
            (Some(root), None) => Ok(root),
            (None, _) => bail!("Config has no enabled roots"),
            (Some(_), Some(_)) => {
                let names: Vec<&str> = self.enabled_roots().map(|r| r.name.as_str()).collect();
                bail!("Config has several roots ({}); pick one with --root", names.join(", "))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        Validator::validate_device_id(&self.device_id).context("Invalid device_id in config")?;
        Validator::validate_chunk_size(self.replica.chunk_size).context("Invalid replica.chunk_size in config")?;
        if self.roots.is_empty() {
            bail!("Config has no roots");
        }

        let mut names = HashSet::new();
        let mut listeners = HashSet::new();
        for root in &self.roots {
            root.validate(&self.device_id)?;
            if !names.insert(root.name.as_str()) {
                bail!("Root name {} is used twice", root.name);
            }
            if root.enabled && !root.listen_addr.ends_with(":0") && !listeners.insert(root.listen_addr.as_str()) {
                bail!("Listen address {} is used by more than one root", root.listen_addr);
            }
        }
        for a in &self.roots {
            for b in &self.roots {
                if a.name != b.name && a.path.starts_with(&b.path) {
                    bail!("Root {} is inside root {}", a.name, b.name);
                }
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<DaemonConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

/// `~/.syncmd/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".syncmd").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let mut config = DaemonConfig::new("/srv/notes");
        config.roots[0].peers.push(PeerCandidate::new("laptop", "192.168.1.20:7700"));
        config.scheduler.tick_interval_secs = 10;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[[roots]]"));
        assert!(toml_str.contains("name = \"notes\""));
        assert!(toml_str.contains("listen_addr = \"0.0.0.0:7700\""));
        assert!(toml_str.contains("[[roots.peers]]"));
        assert!(toml_str.contains("tick_interval_secs = 10"));

        let parsed: DaemonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            device_id = "desk"

            [[roots]]
            name = "notes"
            path = "/home/me/notes"
            "#,
        )
        .unwrap();
        let root = &parsed.roots[0];
        assert!(root.enabled);
        assert_eq!(root.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(root.peers.is_empty());
        assert_eq!(parsed.replica, ReplicaConfig::default());
        assert_eq!(parsed.scheduler, SchedulerConfig::default());
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = DaemonConfig::new(dir.path().join("notes"));
        config.save(&path).unwrap();
        assert_eq!(DaemonConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let mut config = DaemonConfig::new("/srv/notes");
        assert!(config.validate().is_ok());

        config.replica.chunk_size = 1;
        assert!(config.validate().is_err());

        config.replica.chunk_size = ReplicaConfig::default().chunk_size;
        let device = config.device_id.clone();
        config.roots[0].peers.push(PeerCandidate::new(device, "127.0.0.1:7700"));
        assert!(config.validate().is_err());

        config.roots.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiple_roots() {
        let mut config = DaemonConfig::new("/srv/notes");
        let photos = config.add_root("/srv/photos");
        photos.listen_addr = "0.0.0.0:7701".to_string();
        assert!(config.validate().is_ok());

        // Names stay unique
        let other = config.add_root("/mnt/backup/notes");
        assert_eq!(other.name, "notes-2");
        other.listen_addr = "0.0.0.0:7702".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.root("notes-2").unwrap().path, PathBuf::from("/mnt/backup/notes"));

        // Two enabled roots on one port
        config.root_mut("notes-2").unwrap().listen_addr = "0.0.0.0:7701".to_string();
        assert!(config.validate().is_err());
        config.root_mut("notes-2").unwrap().enabled = false;
        assert!(config.validate().is_ok());

        let nested = config.add_root("/srv/notes/journal");
        nested.listen_addr = "0.0.0.0:7703".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inside root notes"));
    }

    #[test]
    fn test_select_root() {
        let mut config = DaemonConfig::new("/srv/notes");
        assert_eq!(config.select_root(None).unwrap().name, "notes");

        config.add_root("/srv/photos").listen_addr = "0.0.0.0:7701".to_string();
        let err = config.select_root(None).unwrap_err();
        assert!(err.to_string().contains("notes, photos"));
        assert_eq!(config.select_root(Some("photos")).unwrap().path, PathBuf::from("/srv/photos"));
        assert!(config.select_root(Some("music")).is_err());

        config.root_mut("photos").unwrap().enabled = false;
        assert_eq!(config.select_root(None).unwrap().name, "notes");
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let dir = tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

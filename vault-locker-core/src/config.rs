//! TOML configuration: vault paths, tool binaries, bus, dialog and autoseal timings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Location read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vault-locker/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub autoseal: AutoSealSettings,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub dialog: DialogConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Device-mapper name, also the file name under `mapper_dir`.
    #[serde(default = "default_vault_name")]
    pub name: String,
    #[serde(default = "default_device")]
    pub device: PathBuf,
    #[serde(default = "default_mapper_dir")]
    pub mapper_dir: PathBuf,
    #[serde(default = "default_mountpoint")]
    pub mountpoint: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

impl VaultConfig {
    pub fn mapper_path(&self) -> PathBuf {
        self.mapper_dir.join(&self.name)
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            name: default_vault_name(),
            device: default_device(),
            mapper_dir: default_mapper_dir(),
            mountpoint: default_mountpoint(),
            key_file: default_key_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSealSettings {
    #[serde(default = "default_autoseal_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl AutoSealSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for AutoSealSettings {
    fn default() -> Self {
        Self {
            duration_secs: default_autoseal_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_kind")]
    pub kind: BusKind,
    /// Interface the `Seal`/`Unseal` signals are scoped to.
    #[serde(default = "default_bus_interface")]
    pub interface: String,
    /// Object path used when emitting signals.
    #[serde(default = "default_bus_object_path")]
    pub object_path: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: default_bus_kind(),
            interface: default_bus_interface(),
            object_path: default_bus_object_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dialog_program")]
    pub program: String,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_dialog_program(),
        }
    }
}

/// Binaries used for the privileged operations, resolved through `PATH`
/// unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_cryptsetup")]
    pub cryptsetup: String,
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default = "default_umount")]
    pub umount: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            cryptsetup: default_cryptsetup(),
            mount: default_mount(),
            umount: default_umount(),
        }
    }
}

fn default_vault_name() -> String {
    "vault".to_string()
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/vault")
}

fn default_mapper_dir() -> PathBuf {
    PathBuf::from("/dev/mapper")
}

fn default_mountpoint() -> PathBuf {
    PathBuf::from("/vault")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/root/vault.bin")
}

fn default_autoseal_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_bus_kind() -> BusKind {
    BusKind::System
}

fn default_bus_interface() -> String {
    "com.clems4ever.Vault".to_string()
}

fn default_bus_object_path() -> String {
    "/com/clems4ever/Vault".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dialog_program() -> String {
    "qarma".to_string()
}

fn default_cryptsetup() -> String {
    "cryptsetup".to_string()
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.vault.name, "vault");
        assert_eq!(cfg.vault.device, PathBuf::from("/dev/vault"));
        assert_eq!(cfg.vault.mapper_path(), PathBuf::from("/dev/mapper/vault"));
        assert_eq!(cfg.vault.mountpoint, PathBuf::from("/vault"));
        assert_eq!(cfg.vault.key_file, PathBuf::from("/root/vault.bin"));
        assert_eq!(cfg.autoseal.duration(), Duration::from_secs(60));
        assert_eq!(cfg.autoseal.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.bus.kind, BusKind::System);
        assert_eq!(cfg.bus.interface, "com.clems4ever.Vault");
        assert_eq!(cfg.bus.object_path, "/com/clems4ever/Vault");
        assert!(cfg.dialog.enabled);
        assert_eq!(cfg.dialog.program, "qarma");
        assert_eq!(cfg.tools.cryptsetup, "cryptsetup");
    }

    #[test]
    fn parse_vault_section() {
        let toml_str = r#"
            [vault]
            name = "secure"
            device = "/dev/sdb2"
            mountpoint = "/mnt/secure"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.vault.name, "secure");
        assert_eq!(cfg.vault.device, PathBuf::from("/dev/sdb2"));
        assert_eq!(cfg.vault.mapper_path(), PathBuf::from("/dev/mapper/secure"));
        assert_eq!(cfg.vault.mountpoint, PathBuf::from("/mnt/secure"));
        // Unset fields keep defaults
        assert_eq!(cfg.vault.key_file, PathBuf::from("/root/vault.bin"));
    }

    #[test]
    fn parse_autoseal_bus_and_dialog() {
        let toml_str = r#"
            [autoseal]
            duration_secs = 300

            [bus]
            kind = "session"

            [dialog]
            enabled = false
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.autoseal.duration(), Duration::from_secs(300));
        assert_eq!(cfg.autoseal.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.bus.kind, BusKind::Session);
        assert_eq!(cfg.bus.interface, "com.clems4ever.Vault");
        assert!(!cfg.dialog.enabled);
    }

    #[test]
    fn rejects_unknown_bus_kind() {
        let result: Result<Config, _> = toml::from_str("[bus]\nkind = \"starter\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_reads_file_and_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[tools]\numount = \"/usr/bin/umount\"\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.tools.umount, "/usr/bin/umount");

        std::fs::write(&path, "[autoseal\n").unwrap();
        match Config::load(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn config_roundtrip_serialize() {
        let cfg = Config::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized, cfg);
    }
}

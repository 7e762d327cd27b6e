use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

const CONFIG_DIR: &str = ".local/share/github-copilot-svcs";
const CONFIG_FILE: &str = "config.json";

fn default_port() -> u16 {
    8081
}

/// Proxy configuration persisted as JSON under
/// `$HOME/.local/share/github-copilot-svcs/config.json`.
///
/// The token fields are mutated only by the token manager; everything else
/// is read once at startup. Missing fields are filled with defaults on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub github_token: String,
    #[serde(default)]
    pub copilot_token: String,
    /// Absolute Copilot token expiry, seconds since epoch.
    #[serde(default)]
    pub expires_at: i64,
    /// Nominal token lifetime in seconds as reported at issuance.
    #[serde(default)]
    pub refresh_in: i64,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            github_token: String::new(),
            copilot_token: String::new(),
            expires_at: 0,
            refresh_in: 0,
            timeouts: Timeouts::default(),
        }
    }
}

/// All tunable timeouts, in seconds. Each must be within 1..=3600.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timeouts {
    #[serde(default = "default_http_client")]
    pub http_client: u64,
    #[serde(default = "default_server_read")]
    pub server_read: u64,
    #[serde(default = "default_server_write")]
    pub server_write: u64,
    #[serde(default = "default_server_idle")]
    pub server_idle: u64,
    #[serde(default = "default_proxy_context")]
    pub proxy_context: u64,
    #[serde(default = "default_circuit_breaker")]
    pub circuit_breaker: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_tls_handshake")]
    pub tls_handshake: u64,
    #[serde(default = "default_dial")]
    pub dial: u64,
    #[serde(default = "default_idle_connection")]
    pub idle_connection: u64,
}

fn default_http_client() -> u64 {
    300
}
fn default_server_read() -> u64 {
    30
}
fn default_server_write() -> u64 {
    300
}
fn default_server_idle() -> u64 {
    120
}
fn default_proxy_context() -> u64 {
    300
}
fn default_circuit_breaker() -> u64 {
    30
}
fn default_keep_alive() -> u64 {
    30
}
fn default_tls_handshake() -> u64 {
    10
}
fn default_dial() -> u64 {
    10
}
fn default_idle_connection() -> u64 {
    90
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            http_client: default_http_client(),
            server_read: default_server_read(),
            server_write: default_server_write(),
            server_idle: default_server_idle(),
            proxy_context: default_proxy_context(),
            circuit_breaker: default_circuit_breaker(),
            keep_alive: default_keep_alive(),
            tls_handshake: default_tls_handshake(),
            dial: default_dial(),
            idle_connection: default_idle_connection(),
        }
    }
}

impl Timeouts {
    fn validate(&self) -> Result<()> {
        let fields: [(&'static str, u64); 10] = [
            ("timeouts.http_client", self.http_client),
            ("timeouts.server_read", self.server_read),
            ("timeouts.server_write", self.server_write),
            ("timeouts.server_idle", self.server_idle),
            ("timeouts.proxy_context", self.proxy_context),
            ("timeouts.circuit_breaker", self.circuit_breaker),
            ("timeouts.keep_alive", self.keep_alive),
            ("timeouts.tls_handshake", self.tls_handshake),
            ("timeouts.dial", self.dial),
            ("timeouts.idle_connection", self.idle_connection),
        ];
        for (field, value) in fields {
            if !(1..=3600).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field,
                    value: value.to_string(),
                    reason: "must be between 1 and 3600 seconds",
                }
                .into());
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
        Ok(PathBuf::from(home).join(CONFIG_DIR))
    }

    pub fn path() -> Result<PathBuf> {
        Ok(Self::dir()?.join(CONFIG_FILE))
    }

    /// Load the config from the default location, returning defaults when
    /// the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    /// Persist atomically: write a sibling temp file, fsync, rename over the
    /// target, then fsync the directory. The parent directory is created
    /// with mode 0700 and the file itself with mode 0600 since it holds
    /// credentials.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().ok_or(ConfigError::NoHome)?;
        create_private_dir(parent).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;

        let content = serde_json::to_vec_pretty(self)?;
        let temp = path.with_extension("json.tmp");
        let write = |temp: &Path| -> std::io::Result<()> {
            let mut file = open_private_file(temp)?;
            file.write_all(&content)?;
            file.sync_all()?;
            fs::rename(temp, path)?;
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
            Ok(())
        };
        write(&temp).map_err(|e| {
            let _ = fs::remove_file(&temp);
            ConfigError::Write {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                value: "0".to_string(),
                reason: "must be a valid TCP port",
            }
            .into());
        }
        self.timeouts.validate()
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

fn open_private_file(path: &Path) -> std::io::Result<File> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8081);
        assert!(config.github_token.is_empty());
        assert!(config.copilot_token.is_empty());
        assert_eq!(config.expires_at, 0);
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.http_client, 300);
        assert_eq!(t.server_read, 30);
        assert_eq!(t.server_write, 300);
        assert_eq!(t.server_idle, 120);
        assert_eq!(t.proxy_context, 300);
        assert_eq!(t.circuit_breaker, 30);
        assert_eq!(t.keep_alive, 30);
        assert_eq!(t.tls_handshake, 10);
        assert_eq!(t.dial, 10);
        assert_eq!(t.idle_connection, 90);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.github_token = "gh_x".to_string();
        config.copilot_token = "c_x".to_string();
        config.expires_at = 1_900_000_000;
        config.refresh_in = 1500;

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_fields_are_defaulted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(&path, r#"{"github_token":"gh_x"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.github_token, "gh_x");
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_timeout_out_of_range_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"timeouts":{"http_client":0}}"#).unwrap();
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, r#"{"timeouts":{"dial":3601}}"#).unwrap();
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, r#"{"timeouts":{"dial":3600}}"#).unwrap();
        assert!(Config::load_from(&path).is_ok());
    }

    #[test]
    fn test_parse_error_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::default();
        config.save_to(&path).unwrap();

        let mut updated = config.clone();
        updated.copilot_token = "c_y".to_string();
        updated.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), updated);
        // No temp file left behind.
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["config.json"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        Config::default().save_to(&path).unwrap();

        let file_mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}

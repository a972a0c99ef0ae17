use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_WATCH_DIRECTORY: &str = "/tmp/ralph";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("host {0} has no key, password or local flag")]
    MissingCredentials(String),
    #[error("duplicate host name {0}")]
    DuplicateHost(String),
    #[error("host #{0} has an empty name")]
    EmptyName(usize),
    #[error("remote host {0} has no address")]
    MissingAddress(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, alias = "vms")]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

/// One monitored machine. Holds credentials, so it is deliberately not
/// `Serialize`; use [`HostConfig::public`] for anything sent to viewers.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub name: String,
    #[serde(default, alias = "host")]
    pub address: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub local: bool,
    #[serde(default, alias = "watchDir")]
    pub watch_directory: Option<String>,
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("local", &self.local)
            .field("watch_directory", &self.watch_directory)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAuth<'a> {
    Local,
    Key(&'a str),
    Password(&'a str),
}

/// Credential-free host descriptor shared with viewers and the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicHost {
    pub name: String,
    pub address: String,
    pub user: String,
    pub local: bool,
    pub watch_directory: String,
}

impl HostConfig {
    pub fn local(name: &str, watch_directory: &str) -> Self {
        Self {
            name: name.to_string(),
            address: "localhost".to_string(),
            user: String::new(),
            port: None,
            key: None,
            password: None,
            local: true,
            watch_directory: Some(watch_directory.to_string()),
        }
    }

    pub fn watch_dir(&self) -> &str {
        self.watch_directory
            .as_deref()
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or(DEFAULT_WATCH_DIRECTORY)
    }

    pub fn auth(&self) -> Result<HostAuth<'_>, ConfigError> {
        if self.local {
            return Ok(HostAuth::Local);
        }
        if let Some(key) = self.key.as_deref().filter(|key| !key.is_empty()) {
            return Ok(HostAuth::Key(key));
        }
        if let Some(password) = self.password.as_deref().filter(|pw| !pw.is_empty()) {
            return Ok(HostAuth::Password(password));
        }
        Err(ConfigError::MissingCredentials(self.name.clone()))
    }

    pub fn public(&self) -> PublicHost {
        PublicHost {
            name: self.name.clone(),
            address: self.address.clone(),
            user: self.user.clone(),
            local: self.local,
            watch_directory: self.watch_dir().to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (idx, host) in self.hosts.iter().enumerate() {
            if host.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(idx));
            }
            if !seen.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
            host.auth()?;
            if !host.local && host.address.trim().is_empty() {
                return Err(ConfigError::MissingAddress(host.name.clone()));
            }
        }
        Ok(())
    }
}

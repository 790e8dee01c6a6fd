//! Validated runtime configuration, assembled from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use thiserror::Error;

use crate::backend::{Backend, BridgeBackend, LocalBackend};
use crate::bridge::{BridgeClient, BridgeConfig};
use crate::engine::EngineOptions;
use crate::status::StatusPublisher;
use crate::telemetry::logging::LogConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the bridge backend needs --bridge-program (or LFS_BRIDGE_PROGRAM)")]
    MissingBridgeProgram,
    #[error("--bridge-pool-size must be at least 1")]
    ZeroPoolSize,
    #[error("{option} must be greater than zero")]
    ZeroTimeout { option: &'static str },
    #[error("invalid --bridge-env entry '{0}': expected NAME or PREFIX*")]
    InvalidEnvEntry(String),
    #[error("unable to determine a default store directory; pass --store-dir")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Local {
        store_dir: PathBuf,
        verify: bool,
    },
    Bridge {
        bridge: BridgeConfig,
        credential_provider: String,
        remote_base: String,
        verify: bool,
    },
}

impl BackendConfig {
    pub fn build(&self) -> Arc<dyn Backend> {
        match self {
            BackendConfig::Local { store_dir, verify } => {
                Arc::new(LocalBackend::new(store_dir.clone(), *verify))
            }
            BackendConfig::Bridge {
                bridge,
                credential_provider,
                remote_base,
                verify,
            } => {
                let client = Arc::new(BridgeClient::new(bridge.clone()));
                Arc::new(BridgeBackend::new(
                    client,
                    credential_provider.clone(),
                    remote_base.clone(),
                    *verify,
                ))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub logging: LogConfig,
    pub backend: BackendConfig,
    pub engine: EngineOptions,
    pub status_file: Option<PathBuf>,
}

impl AdapterConfig {
    pub fn status_publisher(&self) -> StatusPublisher {
        match &self.status_file {
            Some(path) => StatusPublisher::new(path.clone()),
            None => StatusPublisher::disabled(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "lfs-bridge")
}

pub fn default_store_dir() -> Result<PathBuf, ConfigError> {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("objects"))
        .ok_or(ConfigError::NoDataDir)
}

/// git-lfs renames finished downloads into `.git/lfs/objects`, so the
/// default stays on the repository's filesystem when run from a checkout.
pub fn default_download_dir(cwd: &Path) -> PathBuf {
    let git_dir = cwd.join(".git");
    if git_dir.is_dir() {
        return git_dir.join("lfs").join("tmp").join("lfs-bridge");
    }
    project_dirs()
        .map(|dirs| dirs.cache_dir().join("downloads"))
        .unwrap_or_else(|| std::env::temp_dir().join("lfs-bridge"))
}

pub(crate) fn check_env_entry(entry: &str) -> Result<(), ConfigError> {
    let name = entry.strip_suffix('*').unwrap_or(entry);
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidEnvEntry(entry.to_string()))
    }
}

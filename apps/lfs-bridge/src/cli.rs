use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::env::EnvAllowlist;
use crate::bridge::{BridgeConfig, DEFAULT_POOL_SIZE};
use crate::config::{
    check_env_entry, default_download_dir, default_store_dir, AdapterConfig, BackendConfig,
    ConfigError,
};
use crate::engine::EngineOptions;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "lfs-bridge",
    about = "Git LFS custom transfer agent backed by an isolated storage bridge",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub bridge: BridgeArgs,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "LFS_BRIDGE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "LFS_BRIDGE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum BackendKind {
    /// Local content-addressed directory (testing and offline use)
    Local,
    /// External bridge process talking to the remote store
    #[default]
    Bridge,
}

#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    #[arg(
        long,
        value_enum,
        env = "LFS_BRIDGE_BACKEND",
        default_value_t = BackendKind::Bridge,
        help = "Where objects are stored"
    )]
    pub backend: BackendKind,

    #[arg(
        long = "store-dir",
        value_name = "DIR",
        env = "LFS_BRIDGE_STORE_DIR",
        help = "Object directory for the local backend"
    )]
    pub store_dir: Option<PathBuf>,

    #[arg(
        long = "download-dir",
        value_name = "DIR",
        env = "LFS_BRIDGE_DOWNLOAD_DIR",
        help = "Directory for finished downloads handed back to git-lfs"
    )]
    pub download_dir: Option<PathBuf>,

    #[arg(
        long = "no-verify",
        env = "LFS_BRIDGE_NO_VERIFY",
        help = "Skip SHA-256 verification of downloaded objects (sizes are still checked)"
    )]
    pub no_verify: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BridgeArgs {
    #[arg(
        long = "bridge-program",
        value_name = "PATH",
        env = "LFS_BRIDGE_PROGRAM",
        help = "Executable spawned for each storage operation"
    )]
    pub program: Option<PathBuf>,

    #[arg(
        long = "bridge-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Argument passed to the bridge program (repeatable)"
    )]
    pub args: Vec<String>,

    #[arg(
        long = "bridge-timeout-secs",
        value_name = "SECS",
        env = "LFS_BRIDGE_TIMEOUT_SECS",
        default_value_t = 300,
        help = "Kill a bridge call that runs longer than this"
    )]
    pub timeout_secs: u64,

    #[arg(
        long = "bridge-pool-size",
        value_name = "N",
        env = "LFS_BRIDGE_POOL_SIZE",
        default_value_t = DEFAULT_POOL_SIZE,
        help = "Maximum number of bridge processes running at once"
    )]
    pub pool_size: usize,

    #[arg(
        long = "bridge-env",
        value_name = "NAME",
        env = "LFS_BRIDGE_ENV",
        value_delimiter = ',',
        help = "Extra environment variable (or PREFIX*) forwarded to the bridge"
    )]
    pub env: Vec<String>,

    #[arg(
        long = "credential-provider",
        value_name = "NAME",
        env = "LFS_BRIDGE_CREDENTIAL_PROVIDER",
        default_value = "default",
        help = "Opaque credential provider name passed to the bridge"
    )]
    pub credential_provider: String,

    #[arg(
        long = "remote-base",
        value_name = "PREFIX",
        env = "LFS_BRIDGE_REMOTE_BASE",
        default_value = "lfs/objects",
        help = "Base path of the object layout in the remote store"
    )]
    pub remote_base: String,
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    #[arg(
        long = "status-file",
        value_name = "PATH",
        env = "LFS_BRIDGE_STATUS_FILE",
        help = "Publish a JSON status snapshot to this file"
    )]
    pub status_file: Option<PathBuf>,

    #[arg(
        long = "drain-timeout-secs",
        value_name = "SECS",
        env = "LFS_BRIDGE_DRAIN_TIMEOUT_SECS",
        default_value_t = 30,
        help = "How long terminate waits for in-flight transfers"
    )]
    pub drain_timeout_secs: u64,
}

impl Cli {
    pub fn to_config(&self) -> Result<AdapterConfig, ConfigError> {
        let verify = !self.storage.no_verify;
        let backend = match self.storage.backend {
            BackendKind::Local => BackendConfig::Local {
                store_dir: match &self.storage.store_dir {
                    Some(dir) => dir.clone(),
                    None => default_store_dir()?,
                },
                verify,
            },
            BackendKind::Bridge => BackendConfig::Bridge {
                bridge: self.bridge.to_config()?,
                credential_provider: self.bridge.credential_provider.clone(),
                remote_base: self.bridge.remote_base.clone(),
                verify,
            },
        };

        if self.session.drain_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                option: "--drain-timeout-secs",
            });
        }
        let download_dir = match &self.storage.download_dir {
            Some(dir) => dir.clone(),
            None => default_download_dir(&std::env::current_dir().unwrap_or_default()),
        };
        let mut engine = EngineOptions::new(download_dir);
        engine.drain_timeout = Duration::from_secs(self.session.drain_timeout_secs);

        Ok(AdapterConfig {
            logging: self.logging.to_config(),
            backend,
            engine,
            status_file: self.session.status_file.clone(),
        })
    }
}

impl BridgeArgs {
    fn to_config(&self) -> Result<BridgeConfig, ConfigError> {
        let program = self
            .program
            .clone()
            .ok_or(ConfigError::MissingBridgeProgram)?;
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                option: "--bridge-timeout-secs",
            });
        }
        for entry in &self.env {
            check_env_entry(entry.trim())?;
        }

        let mut config = BridgeConfig::new(program);
        config.args = self.args.clone();
        config.env = EnvAllowlist::default().extend(&self.env);
        config.timeout = Duration::from_secs(self.timeout_secs);
        config.pool_size = self.pool_size;
        Ok(config)
    }
}

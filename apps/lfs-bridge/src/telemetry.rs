fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

/// Diagnostics go to stderr or a file. Stdout belongs to the protocol.
pub mod logging {
    use clap::ValueEnum;
    use parking_lot::Mutex;
    use std::fs::OpenOptions;
    use std::io::IsTerminal;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "LFS_BRIDGE_LOG_FILTER";
    const TRACE_DEPS_ENV: &str = "LFS_BRIDGE_TRACE_DEPS";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    /// Flushes buffered log lines. Call once before the process exits.
    pub fn shutdown() {
        drop(GUARD.lock().take());
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        // git-lfs copies our stderr into its own trace output.
        let ansi = config.file.is_none() && std::io::stderr().is_terminal();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(ansi)
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        *GUARD.lock() = Some(guard);
        if throttled_deps {
            tracing::debug!(
                target: "lfs_bridge::telemetry",
                "suppressing dependency trace noise; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
        if let Ok(filter) = std::env::var(FILTER_ENV) {
            return (EnvFilter::new(filter), false);
        }
        let (filter, throttled) = default_filter_for(level, allow_dependency_traces());
        (EnvFilter::new(filter), throttled)
    }

    const TRACE_DEP_TARGETS: &[&str] = &["tokio", "runtime", "mio"];

    fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        let base = match level {
            LevelFilter::TRACE => "info,lfs_bridge=trace,lfs_bridge_proto=trace",
            LevelFilter::DEBUG => "info,lfs_bridge=debug,lfs_bridge_proto=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level == LevelFilter::TRACE && !allow_deps {
            (throttle_dependency_traces(base), true)
        } else {
            (base.to_owned(), false)
        }
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false)
    }

    fn throttle_dependency_traces(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        filter
    }

}

use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// One week.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MAX_REQUESTS: usize = 128;
/// 64 KiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_REDIS_DSN: &str = "redis://127.0.0.1:6379/0";

/// Application configuration structure that defines all runtime parameters.
///
/// Every field can be set from the command line or from the environment, and
/// the whole structure can alternatively be read from a TOML file given with
/// `--config`. It uses the `clap` and `toml` derive macros for respectively
/// command-line and file argument parsing.
///
/// # Fields Overview
///
/// - `listen_addr`, `port`: where the HTTP server binds
/// - `read_timeout_secs`, `write_timeout_secs`, `idle_timeout_secs`: HTTP timeouts; the write
///   timeout also bounds session response delays and live-feed writes
/// - `storage_driver`, `pubsub_driver`, `redis_dsn`: backend selection
/// - `session_ttl_secs`, `max_requests`, `max_request_body_size`: capture limits
/// - `auto_create_sessions`: capture requests for unknown session ids by creating them
/// - `ignore_header_prefixes`: header name prefixes never recorded
/// - `shutdown_timeout_secs`: upper bound on graceful shutdown
/// - `ws_max_clients`, `ws_max_lifetime_secs`: live-feed limits, `0` meaning unlimited
#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(name = "webhook-tester")]
#[command(version)]
#[command(about = "Capture, inspect and replay webhook requests")]
#[serde(default)]
pub struct Config {
    /// Read the whole configuration from this TOML file instead of flags.
    #[arg(long = "config", env = "CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Logging level, overridden by `RUST_LOG` when set.
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// IP address to listen on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    /// HTTP server port.
    #[arg(long, env = "HTTP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "HTTP_READ_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub read_timeout_secs: u64,

    /// Also the upper bound for session response delays.
    #[arg(long, env = "HTTP_WRITE_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub write_timeout_secs: u64,

    #[arg(long, env = "HTTP_IDLE_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "STORAGE_DRIVER", value_enum, default_value_t = StorageDriver::Memory)]
    pub storage_driver: StorageDriver,

    #[arg(long, env = "PUBSUB_DRIVER", value_enum, default_value_t = PubSubDriver::Memory)]
    pub pubsub_driver: PubSubDriver,

    /// Redis connection string, used by the `redis` drivers.
    #[arg(long, env = "REDIS_DSN", default_value = DEFAULT_REDIS_DSN)]
    pub redis_dsn: String,

    /// Session lifetime in seconds.
    #[arg(long, env = "SESSION_TTL", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,

    /// Maximal number of requests kept per session; older ones are evicted.
    #[arg(long, env = "MAX_REQUESTS", default_value_t = DEFAULT_MAX_REQUESTS)]
    pub max_requests: usize,

    /// Maximal captured request body size in bytes.
    #[arg(long, env = "MAX_REQUEST_BODY_SIZE", default_value_t = DEFAULT_MAX_BODY_SIZE)]
    pub max_request_body_size: usize,

    /// Create a session on the fly when a request hits an unknown session id.
    #[arg(long, env = "AUTO_CREATE_SESSIONS", action = clap::ArgAction::SetTrue)]
    pub auto_create_sessions: bool,

    /// Comma-separated, case-insensitive header name prefixes that are not recorded.
    #[arg(long, env = "IGNORE_HEADER_PREFIXES", value_delimiter = ',')]
    pub ignore_header_prefixes: Vec<String>,

    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout_secs: u64,

    /// Maximal number of concurrent live-feed connections, 0 for unlimited.
    #[arg(long, env = "WS_MAX_CLIENTS", default_value_t = 0)]
    pub ws_max_clients: usize,

    /// Maximal lifetime of one live-feed connection in seconds, 0 for unlimited.
    #[arg(long, env = "WS_MAX_LIFETIME", default_value_t = 0)]
    pub ws_max_lifetime_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: None,
            log_level: LogLevel::Info,
            listen_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            read_timeout_secs: DEFAULT_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage_driver: StorageDriver::Memory,
            pubsub_driver: PubSubDriver::Memory,
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_request_body_size: DEFAULT_MAX_BODY_SIZE,
            auto_create_sessions: false,
            ignore_header_prefixes: Vec::new(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            ws_max_clients: 0,
            ws_max_lifetime_secs: 0,
        }
    }
}

impl Config {
    /// Builds the configuration from the command line (and environment). When
    /// `--config` is given, the file replaces every other source.
    ///
    /// # Errors
    /// Returns `ConfigError` when the file cannot be read or parsed, or when a
    /// value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        let args = Self::parse();
        let config = match &args.config_file {
            Some(path) => Self::from_file(path)?,
            None => args,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML configuration file. Missing keys take their default value.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config =
            toml::from_str(&text).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::BadIPFormatting(format!("{}: {}", self.listen_addr, e)))?;

        if self.port == 0 {
            return Err(ConfigError::NotInRange("port must be in 1..=65535".into()));
        }
        if self.write_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(ConfigError::NotInRange("HTTP timeouts must be positive".into()));
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::NotInRange("session TTL must be positive".into()));
        }
        if self.max_requests == 0 || self.max_requests > u16::MAX as usize {
            return Err(ConfigError::NotInRange(format!(
                "max requests must be in 1..={}",
                u16::MAX
            )));
        }
        if self.max_request_body_size == 0 {
            return Err(ConfigError::NotInRange("max request body size must be positive".into()));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::NotInRange("shutdown timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .listen_addr
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::BadIPFormatting(format!("{}: {}", self.listen_addr, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn ws_max_lifetime(&self) -> Option<Duration> {
        (self.ws_max_lifetime_secs > 0).then(|| Duration::from_secs(self.ws_max_lifetime_secs))
    }

    pub fn ws_max_clients(&self) -> Option<usize> {
        (self.ws_max_clients > 0).then_some(self.ws_max_clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn from_args_under_test(args: &[&str]) -> Result<Config, clap::Error> {
        let mut argv = vec!["webhook-tester"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv)
    }

    #[test]
    #[serial]
    fn test_defaults_from_args() {
        let config = from_args_under_test(&[]).unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_args() {
        let config = from_args_under_test(&[
            "--listen-addr",
            "127.0.0.1",
            "--port",
            "9090",
            "--storage-driver",
            "redis",
            "--pubsub-driver",
            "redis",
            "--max-requests",
            "2",
            "--auto-create-sessions",
            "--ignore-header-prefixes",
            "X-Forwarded-,cf-",
            "--ws-max-clients",
            "10",
            "--ws-max-lifetime-secs",
            "600",
        ])
        .unwrap_or_else(|e| panic!("{}", e));

        assert_eq!(config.listen_addr, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.storage_driver, StorageDriver::Redis);
        assert_eq!(config.pubsub_driver, PubSubDriver::Redis);
        assert_eq!(config.max_requests, 2);
        assert!(config.auto_create_sessions);
        assert_eq!(config.ignore_header_prefixes, vec!["X-Forwarded-", "cf-"]);
        assert_eq!(config.ws_max_clients(), Some(10));
        assert_eq!(config.ws_max_lifetime(), Some(Duration::from_secs(600)));
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("MAX_REQUESTS", "7");
        std::env::set_var("SESSION_TTL", "30");
        let config = from_args_under_test(&[]);
        std::env::remove_var("MAX_REQUESTS");
        std::env::remove_var("SESSION_TTL");

        let config = config.unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(config.max_requests, 7);
        assert_eq!(config.session_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 8181
storage_driver = "redis"
max_request_body_size = 1024
ignore_header_prefixes = ["cf-"]
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 8181);
        assert_eq!(config.storage_driver, StorageDriver::Redis);
        assert_eq!(config.max_request_body_size, 1024);
        assert_eq!(config.ignore_header_prefixes, vec!["cf-"]);
        assert_eq!(config.max_requests, DEFAULT_MAX_REQUESTS);
        assert_eq!(config.config_file.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_from_file_errors() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::TomlError(_))));

        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/webhook-tester.toml")),
            Err(ConfigError::IoError(_))
        ));
    }

    #[test]
    fn test_validate() {
        let bad_ip = Config {
            listen_addr: "localhost".into(),
            ..Default::default()
        };
        assert!(matches!(bad_ip.validate(), Err(ConfigError::BadIPFormatting(_))));

        let no_requests = Config {
            max_requests: 0,
            ..Default::default()
        };
        assert!(matches!(no_requests.validate(), Err(ConfigError::NotInRange(_))));

        let no_ttl = Config {
            session_ttl_secs: 0,
            ..Default::default()
        };
        assert!(matches!(no_ttl.validate(), Err(ConfigError::NotInRange(_))));
    }
}

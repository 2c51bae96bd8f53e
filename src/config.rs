use fractal_core::consumer::{QueueBinding, QueueKind};
use fractal_core::retry::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
use fractal_core::Credentials;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Matrix account the worker acts as
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatrixConfig {
    /// Homeserver URL (e.g., "https://matrix.example.org")
    pub homeserver_url: Option<String>,
    /// Access token of the user's session
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// Full user id (e.g., "@alice:example.org")
    pub matrix_id: Option<String>,
}

impl MatrixConfig {
    /// Returns true if a session can be built from this config
    pub fn is_configured(&self) -> bool {
        self.homeserver_url.is_some() && self.access_token.is_some() && self.matrix_id.is_some()
    }

    /// The user's session on the homeserver, if fully configured
    pub fn session(&self) -> Option<Credentials> {
        match (&self.homeserver_url, &self.access_token, &self.matrix_id) {
            (Some(homeserver), Some(token), Some(matrix_id)) => Some(Credentials::new(
                token.clone(),
                homeserver.clone(),
                matrix_id.clone(),
            )),
            _ => None,
        }
    }
}

/// A queue the worker consumes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub room_id: String,
}

impl From<&QueueConfig> for QueueBinding {
    fn from(queue: &QueueConfig) -> Self {
        QueueBinding::new(queue.kind, queue.room_id.clone())
    }
}

/// Worker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Long-poll timeout per queue fetch, in seconds
    pub fetch_timeout_secs: u64,
    /// Attempts per operation, task push and task run
    pub retry_count: u32,
    /// Delay before the first retry, in milliseconds
    pub retry_backoff_ms: u64,
    /// Interval between pushes of local changes, in seconds
    pub push_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            retry_count: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_BACKOFF.as_millis() as u64,
            push_interval_secs: 10,
        }
    }
}

impl WorkerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs.max(1))
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Name of this device
    pub device_name: ConfigValue<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub matrix: MatrixConfig,
    pub queues: Vec<QueueConfig>,
    pub worker: WorkerConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    device_name: Option<String>,
    matrix: Option<MatrixConfig>,
    queues: Vec<QueueConfig>,
    worker: Option<WorkerConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path =
            ConfigValue::new(Self::default_data_dir().join("fractal.db"), ConfigSource::Default);
        let mut device_name = ConfigValue::new("worker".to_string(), ConfigSource::Default);
        let mut config_file = None;
        let mut matrix = MatrixConfig::default();
        let mut queues = Vec::new();
        let mut worker = WorkerConfig::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(name) = file_config.device_name {
                device_name = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(matrix_config) = file_config.matrix {
                matrix = matrix_config;
            }
            if let Some(worker_config) = file_config.worker {
                worker = worker_config;
            }
            queues = file_config.queues;
        }

        if let Ok(db_path) = std::env::var("FRACTAL_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(name) = std::env::var("FRACTAL_DEVICE_NAME") {
            device_name = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("FRACTAL_HOMESERVER_URL") {
            matrix.homeserver_url = Some(url);
        }
        if let Ok(token) = std::env::var("FRACTAL_ACCESS_TOKEN") {
            matrix.access_token = Some(token);
        }
        if let Ok(id) = std::env::var("FRACTAL_MATRIX_ID") {
            matrix.matrix_id = Some(id);
        }
        if let Ok(room_id) = std::env::var("FRACTAL_QUEUE_ROOM") {
            let queue = QueueConfig {
                kind: QueueKind::Replication,
                room_id,
            };
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }

        Ok(Self {
            database_path,
            device_name,
            config_file,
            matrix,
            queues,
            worker,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/fractal/
    /// - macOS: ~/Library/Application Support/fractal/
    /// - Windows: %APPDATA%/fractal/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fractal")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/fractal/
    /// - macOS: ~/Library/Application Support/fractal/
    /// - Windows: %APPDATA%/fractal/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fractal")
    }

    /// First configured mutex queue; operation runs are scheduled there
    pub fn mutex_queue(&self) -> Option<&QueueConfig> {
        self.queues.iter().find(|queue| queue.kind == QueueKind::Mutex)
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

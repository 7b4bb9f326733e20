/// Configuration management for shardgate
use crate::core::{KeyBound, ShardId, ShardInfo};
use crate::directory::metadata::{ChunkEntry, ClusterMetadata, CollectionEntry, DatabaseEntry};
use crate::directory::PartitionMap;
pub use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main shardgate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shard server configuration (`shardgate shard`)
    pub server: ServerConfig,
    /// Router timeouts
    pub router: RouterConfig,
    /// Where the partition map comes from
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Shard server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the shard server listens on
    pub listen_addr: String,
    /// Id the shard server reports in its logs
    pub shard_id: String,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bound on establishing a shard connection, in milliseconds
    pub connect_timeout_ms: u64,
    /// Bound on one request to a shard, in milliseconds
    pub operation_timeout_ms: u64,
    /// Idle time after which a session is closed by the sweep
    pub session_timeout_sec: u64,
    /// TCP keepalive interval for shard connections
    pub tcp_keepalive_sec: u64,
}

impl RouterConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_sec)
    }

    pub fn tcp_keepalive(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_sec)
    }
}

/// Partition metadata, inline or in a separate file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Metadata file re-read on every refresh; overrides the inline tables
    pub file: Option<PathBuf>,
    pub version: u64,
    pub shards: Vec<ShardInfo>,
    pub databases: Vec<DatabaseEntry>,
    pub collections: Vec<CollectionEntry>,
}

impl MetadataConfig {
    /// The inline tables as cluster metadata
    pub fn cluster_metadata(&self) -> ClusterMetadata {
        ClusterMetadata {
            version: self.version,
            shards: self.shards.clone(),
            databases: self.databases.clone(),
            collections: self.collections.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1:27018".to_string(),
                shard_id: "shard0000".to_string(),
            },
            router: RouterConfig {
                connect_timeout_ms: 1000,
                operation_timeout_ms: 5000,
                session_timeout_sec: 1800,
                tcp_keepalive_sec: 30,
            },
            metadata: MetadataConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen address: {}",
                    self.server.listen_addr
                ))
            })?;

        if self.server.shard_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "shard_id cannot be empty".to_string(),
            ));
        }

        if self.router.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.router.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.router.session_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "session_timeout_sec must be greater than 0".to_string(),
            ));
        }

        // A metadata file is only read at refresh time
        if self.metadata.file.is_none() {
            for shard in &self.metadata.shards {
                if !shard.endpoint.contains(':') {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid endpoint '{}' for shard {}: must be host:port",
                        shard.endpoint, shard.id
                    )));
                }
            }
            PartitionMap::build(self.metadata.cluster_metadata())
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Two shards, one unsharded database and one collection split at key 0
    pub fn example() -> Self {
        let shard0 = ShardId::new("shard0000");
        let shard1 = ShardId::new("shard0001");
        Config {
            metadata: MetadataConfig {
                file: None,
                version: 1,
                shards: vec![
                    ShardInfo::new(shard0.clone(), "127.0.0.1:27018"),
                    ShardInfo::new(shard1.clone(), "127.0.0.1:27019"),
                ],
                databases: vec![
                    DatabaseEntry {
                        name: "fooUnsharded".to_string(),
                        primary: shard0.clone(),
                    },
                    DatabaseEntry {
                        name: "fooSharded".to_string(),
                        primary: shard0.clone(),
                    },
                ],
                collections: vec![CollectionEntry {
                    namespace: "fooSharded.barSharded".to_string(),
                    shard_key: "_id".to_string(),
                    chunks: vec![
                        ChunkEntry {
                            min: KeyBound::MinKey,
                            max: KeyBound::Value(0),
                            shard: shard0,
                        },
                        ChunkEntry {
                            min: KeyBound::Value(0),
                            max: KeyBound::MaxKey,
                            shard: shard1,
                        },
                    ],
                }],
            },
            ..Default::default()
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Self::example().save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.router.operation_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.router.operation_timeout_ms = 1000;
        assert!(config.validate().is_ok());

        config.server.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_metadata_rejected() {
        let mut config = Config::example();
        assert!(config.validate().is_ok());

        config.metadata.collections[0].chunks.pop();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        // Not checked when the map comes from a file
        config.metadata.file = Some(PathBuf::from("metadata.toml"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::example();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
        assert_eq!(
            parsed_config.metadata.cluster_metadata(),
            config.metadata.cluster_metadata()
        );
    }

    #[test]
    fn test_metadata_section_optional() {
        let toml_str = r#"
            [server]
            listen_addr = "127.0.0.1:27018"
            shard_id = "shard0000"

            [router]
            connect_timeout_ms = 500
            operation_timeout_ms = 2000
            session_timeout_sec = 60
            tcp_keepalive_sec = 30

            [logging]
            level = "debug"
            format = "json"
            stdout = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.metadata.shards.is_empty());
        assert_eq!(config.router.operation_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../../config/shardgate.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.metadata.cluster_metadata(),
            Config::example().metadata.cluster_metadata()
        );
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
        assert_eq!(loaded_config.metadata.shards.len(), 2);
    }
}

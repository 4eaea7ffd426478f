use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::collaborators::EnrollmentRef;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8444,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    /// SQLite database file; relative paths resolve against data_dir.
    pub db_path: String,
    /// Root for carve blocks and archives.
    pub data_dir: String,
}

impl StorageConfig {
    fn default(project_dirs: Option<&ProjectDirs>) -> Self {
        let base = project_dirs
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        StorageConfig {
            db_path: base.join("nodegate.db").to_string_lossy().into_owned(),
            data_dir: base.to_string_lossy().into_owned(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.db_path);
        if path.is_relative() {
            PathBuf::from(&self.data_dir).join(path)
        } else {
            path
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolConfig {
    /// Maximum distributed queries handed out per poll.
    pub read_limit: usize,
    /// Result rows per insert batch on distributed_write.
    pub result_batch_size: usize,
}

impl ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            read_limit: crate::selector::DEFAULT_READ_LIMIT,
            result_batch_size: crate::collector::DEFAULT_RESULT_BATCH_SIZE,
        }
    }

    fn ensure_valid(&mut self) {
        if self.read_limit == 0 {
            eprintln!(
                "Config error: read_limit of 0 is invalid - using default of {}",
                crate::selector::DEFAULT_READ_LIMIT
            );
            self.read_limit = crate::selector::DEFAULT_READ_LIMIT;
        }
        if self.result_batch_size == 0 {
            eprintln!(
                "Config error: result_batch_size of 0 is invalid - using default of {}",
                crate::collector::DEFAULT_RESULT_BATCH_SIZE
            );
            self.result_batch_size = crate::collector::DEFAULT_RESULT_BATCH_SIZE;
        }
    }
}

/// One enrollment secret accepted by the built-in verifier.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollmentSecretConfig {
    pub secret: String,
    pub enrollment_id: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub enrollment_secrets: Vec<EnrollmentSecretConfig>,
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's
    /// data directory. If the file is missing or fails to parse,
    /// defaults are used; a missing file is written out with the
    /// defaults so there is something to edit.
    pub fn load_config(project_dirs: Option<&ProjectDirs>) -> Self {
        let default_config = Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(project_dirs),
            protocol: ProtocolConfig::default(),
            enrollment_secrets: Vec::new(),
        };

        let Some(dirs) = project_dirs else {
            return default_config;
        };
        let config_path = dirs.data_local_dir().join("config.toml");

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path));

        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();
        config
    }

    fn ensure_valid(&mut self) {
        self.protocol.ensure_valid();
    }

    /// Secret table for the built-in verifier.
    pub fn secret_table(&self) -> HashMap<String, EnrollmentRef> {
        self.enrollment_secrets
            .iter()
            .map(|s| {
                (
                    s.secret.clone(),
                    EnrollmentRef {
                        enrollment_id: s.enrollment_id,
                        tags: s.tags.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::load_config(None);
        assert_eq!(config.protocol.read_limit, 10);
        assert_eq!(config.protocol.result_batch_size, 100);
        assert!(config.enrollment_secrets.is_empty());
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let mut config = Config::load_config(None);
        config.protocol.read_limit = 0;
        config.protocol.result_batch_size = 0;
        config.ensure_valid();
        assert_eq!(config.protocol.read_limit, 10);
        assert_eq!(config.protocol.result_batch_size, 100);
    }

    #[test]
    fn secret_table_carries_tags() {
        let mut config = Config::load_config(None);
        config.enrollment_secrets.push(EnrollmentSecretConfig {
            secret: "s3cret".to_string(),
            enrollment_id: 4,
            tags: vec!["laptops".to_string()],
        });
        let table = config.secret_table();
        assert_eq!(table["s3cret"].enrollment_id, 4);
        assert_eq!(table["s3cret"].tags, vec!["laptops"]);
    }
}

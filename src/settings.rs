//! Process settings, read from `queryset.toml` and `QUERYSET__*` environment
//! variables. Environment wins over the file.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{QuerySetError, Result};
use crate::persist::PersistenceMode;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. An in-memory database is used when absent.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    pub server: ServerSettings,
    pub log: LogSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from("queryset")
    }

    /// Reads `<basename>.toml` (optional) and the environment.
    pub fn load_from(basename: &str) -> Result<Self> {
        Config::builder()
            .set_default("server.host", "127.0.0.1")
            .and_then(|b| b.set_default("server.port", 8080_i64))
            .and_then(|b| b.set_default("log.filter", "info"))
            .map_err(config_error)?
            .add_source(File::with_name(basename).required(false))
            .add_source(
                Environment::with_prefix("QUERYSET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database.path {
            Some(path) if !path.is_empty() => PersistenceMode::File(path.clone()),
            _ => PersistenceMode::InMemory,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn config_error(e: config::ConfigError) -> QuerySetError {
    QuerySetError::Config(e.to_string())
}

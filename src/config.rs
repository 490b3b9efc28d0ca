use crate::error::{InventoryError, Result};
use chrono::format::{Item, StrftimeItems};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of uploads, master and history
    pub data_dir: PathBuf,
    /// Keep a timestamped copy of each replaced master
    pub backup_master: bool,
}

/// Report and import settings ("configuracion")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub company: String,
    /// Use a date found in the file name as provenance for rows without one
    pub use_file_date: bool,
    pub date_format: String,
}

impl ReportConfig {
    /// Reject date formats chrono cannot render
    pub fn validate(&self) -> Result<()> {
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(InventoryError::InvalidSetting(format!(
                "date_format {:?} is not a valid strftime format",
                self.date_format
            )));
        }
        Ok(())
    }

    /// Copy with the fields present in `update` replaced
    pub fn merged(&self, update: &ReportUpdate) -> Self {
        Self {
            company: update.company.clone().unwrap_or_else(|| self.company.clone()),
            use_file_date: update.use_file_date.unwrap_or(self.use_file_date),
            date_format: update
                .date_format
                .clone()
                .unwrap_or_else(|| self.date_format.clone()),
        }
    }
}

/// Partial change to [`ReportConfig`]; absent fields are kept
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportUpdate {
    pub company: Option<String>,
    pub use_file_date: Option<bool>,
    pub date_format: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("data"),
                backup_master: true,
            },
            report: ReportConfig {
                company: "Inventario".to_string(),
                use_file_date: false,
                date_format: "%Y-%m-%d".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Defaults, then `inventario.{toml,json,yaml}` if present, then
    /// `INVENTARIO_*` environment variables (`INVENTARIO_SERVER__PORT=9000`)
    pub fn load() -> Result<Self> {
        Self::load_from("inventario")
    }

    pub fn load_from(file_stem: &str) -> Result<Self> {
        let defaults = Self::default();
        let config = Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", i64::from(defaults.server.port))?
            .set_default(
                "storage.data_dir",
                defaults.storage.data_dir.to_string_lossy().into_owned(),
            )?
            .set_default("storage.backup_master", defaults.storage.backup_master)?
            .set_default("report.company", defaults.report.company)?
            .set_default("report.use_file_date", defaults.report.use_file_date)?
            .set_default("report.date_format", defaults.report.date_format)?
            .add_source(File::with_name(file_stem).required(false))
            .add_source(
                Environment::with_prefix("INVENTARIO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

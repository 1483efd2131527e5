use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::{FieldDef, FieldKind};

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: "127.0.0.1".into(),
            port: 3306,
            database: "dedupe".into(),
        }
    }
}

impl DatabaseConfig {
    pub fn to_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

/// Where the records live and what their fields look like.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SourceConfig {
    pub table: String,
    pub key_field: String,
    pub fields: Vec<FieldDef>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            table: "records".into(),
            key_field: "activity_nr".into(),
            fields: default_fields(),
        }
    }
}

impl SourceConfig {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.field == name)
    }
}

/// Inspection-record schema used when no field list is configured.
pub fn default_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new("estab_name", FieldKind::String),
        FieldDef::new("site_address", FieldKind::String),
        FieldDef::new("site_city", FieldKind::ShortString).missing(),
        FieldDef::new("site_zip", FieldKind::ShortString).missing(),
        FieldDef::new("owner_type", FieldKind::Categorical).with_categories(&[
            "A", "B", "C", "D", "",
        ]),
        FieldDef::new("sic_code", FieldKind::ShortString).missing(),
        FieldDef::new("naics_code", FieldKind::ShortString).missing(),
        FieldDef::new("union_status", FieldKind::Categorical)
            .missing()
            .with_categories(&["Y", "U", "A", "N", "B", ""]),
        FieldDef::new("nr_in_estab", FieldKind::Price).missing(),
        FieldDef::new("open_date", FieldKind::ShortString).missing(),
    ]
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PipelineConfig {
    pub workers: usize,
    pub sample: f64,
    pub training_path: PathBuf,
    pub threshold: f64,
    pub batch_size: usize,
    pub progress_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            sample: 0.10,
            training_path: PathBuf::from("training.json"),
            threshold: 0.5,
            batch_size: 10_000,
            progress_every: 10_000,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

pub(crate) fn is_valid_ident(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl AppConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.host.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.host",
            });
        }
        if self.database.username.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.username",
            });
        }
        if self.database.database.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.database",
            });
        }
        if self.database.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "database.port",
                reason: "must be > 0".into(),
            });
        }
        if !is_valid_ident(&self.source.table) {
            return Err(ConfigError::InvalidValue {
                field: "source.table",
                reason: format!("invalid identifier: {}", self.source.table),
            });
        }
        if !is_valid_ident(&self.source.key_field) {
            return Err(ConfigError::InvalidValue {
                field: "source.key_field",
                reason: format!("invalid identifier: {}", self.source.key_field),
            });
        }
        if self.source.fields.is_empty() {
            return Err(ConfigError::MissingField {
                field: "source.fields",
            });
        }
        let mut seen = HashSet::new();
        for f in &self.source.fields {
            if !is_valid_ident(&f.field) || f.field == self.source.key_field {
                return Err(ConfigError::InvalidValue {
                    field: "source.fields",
                    reason: format!("invalid field name: {}", f.field),
                });
            }
            if !seen.insert(f.field.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "source.fields",
                    reason: format!("duplicate field: {}", f.field),
                });
            }
            if f.kind == FieldKind::Categorical && f.categories.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "source.fields",
                    reason: format!("categorical field {} has no categories", f.field),
                });
            }
        }
        let p = &self.pipeline;
        if !(p.sample > 0.0 && p.sample <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.sample",
                reason: format!("{} not in (0, 1]", p.sample),
            });
        }
        if !(0.0..=1.0).contains(&p.threshold) {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.threshold",
                reason: format!("{} not in 0..=1", p.threshold),
            });
        }
        if p.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.workers",
                reason: "must be > 0".into(),
            });
        }
        if p.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.batch_size",
                reason: "must be > 0".into(),
            });
        }
        if p.progress_every == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.progress_every",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.database.username = "dedupe".into();
        cfg
    }

    #[test]
    fn default_with_user_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_sample_out_of_range() {
        let mut cfg = valid();
        cfg.pipeline.sample = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "pipeline.sample",
                ..
            })
        ));
        cfg.pipeline.sample = 1.0;
        assert!(cfg.validate().is_ok());
        cfg.pipeline.sample = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_identifiers_and_duplicates() {
        let mut cfg = valid();
        cfg.source.table = "records; DROP".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.source.fields.push(FieldDef::new("site_zip", FieldKind::String));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "source.fields",
                ..
            })
        ));
    }

    #[test]
    fn categorical_requires_categories() {
        let mut cfg = valid();
        cfg.source.fields = vec![FieldDef::new("kind", FieldKind::Categorical)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn password_is_redacted() {
        let mut db = DatabaseConfig::default();
        db.password = "hunter2".into();
        let s = format!("{:?}", db);
        assert!(!s.contains("hunter2"));
    }

    #[test]
    fn json_round_trip_keeps_field_schema() {
        let cfg = valid();
        let s = serde_json::to_string(&cfg).unwrap();
        let back: AppConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.source.fields, cfg.source.fields);
        assert_eq!(back.pipeline.training_path, cfg.pipeline.training_path);
    }
}

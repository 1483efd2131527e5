use crate::config::AppConfig;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "entity_dedupe",
    version,
    about = "Blocking, candidate generation and clustering for record deduplication",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Worker threads for scoring
    #[arg(short = 'j', long = "cores", value_name = "N")]
    pub cores: Option<usize>,
    /// Database name (env: DB_NAME, default dedupe)
    #[arg(long = "dbname", value_name = "NAME", env = "DB_NAME")]
    pub dbname: Option<String>,
    /// Fraction of records sampled for training, in (0, 1]
    #[arg(short = 's', long = "sample", value_name = "FRACTION")]
    pub sample: Option<f64>,
    /// Training labels file
    #[arg(short = 't', long = "training", value_name = "PATH")]
    pub training: Option<PathBuf>,
    /// Debug-level logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    /// Minimum pair score for clustering, in [0, 1]
    #[arg(long = "threshold", value_name = "SCORE")]
    pub threshold: Option<f64>,
    /// Rows per bulk insert and per scan page
    #[arg(long = "batch-size", value_name = "N")]
    pub batch_size: Option<usize>,
    /// JSON config file; flags and env override its values
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Write a .env template and exit
    #[arg(
        long = "write-env-template",
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = ".env.template"
    )]
    pub write_env_template: Option<PathBuf>,
    /// DB host (env: DB_HOST)
    #[arg(long = "host", value_name = "HOST", env = "DB_HOST")]
    pub host: Option<String>,
    /// DB port (env: DB_PORT)
    #[arg(long = "port", value_name = "PORT", env = "DB_PORT")]
    pub port: Option<u16>,
    /// DB user (env: DB_USER)
    #[arg(long = "user", value_name = "USER", env = "DB_USER")]
    pub user: Option<String>,
    /// DB password (env: DB_PASSWORD)
    #[arg(
        long = "password",
        value_name = "PASSWORD",
        env = "DB_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,
}

impl Cli {
    /// Starts from `base` and applies every flag that was given.
    pub fn apply(&self, mut cfg: AppConfig) -> AppConfig {
        let db = &mut cfg.database;
        if let Some(h) = &self.host {
            db.host = h.clone();
        }
        if let Some(p) = self.port {
            db.port = p;
        }
        if let Some(u) = &self.user {
            db.username = u.clone();
        }
        if let Some(p) = &self.password {
            db.password = p.clone();
        }
        if let Some(n) = &self.dbname {
            db.database = n.clone();
        }

        let p = &mut cfg.pipeline;
        if let Some(n) = self.cores {
            p.workers = n;
        }
        if let Some(s) = self.sample {
            p.sample = s;
        }
        if let Some(t) = &self.training {
            p.training_path = t.clone();
        }
        if let Some(t) = self.threshold {
            p.threshold = t;
        }
        if let Some(b) = self.batch_size {
            p.batch_size = b;
        }
        cfg
    }

    pub fn to_app_config(&self) -> anyhow::Result<AppConfig> {
        let base = match &self.config {
            Some(path) => AppConfig::from_json_file(path)?,
            None => AppConfig::default(),
        };
        let cfg = self.apply(base);
        cfg.validate().context("Invalid configuration")?;
        Ok(cfg)
    }
}

/// Parses argv (clap exits with status 2 on bad usage) and resolves the
/// merged config. The parsed flags are returned even when the config is bad.
pub fn parse_cli_to_app_config() -> (Cli, anyhow::Result<AppConfig>) {
    let cli = Cli::parse();
    let cfg = cli.to_app_config();
    (cli, cfg)
}

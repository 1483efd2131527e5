use anyhow::{Context, Result};
use env_logger::Env;
use log::{debug, error, info, warn};

use entity_dedupe::blocking::{Blocker, PredicateBlocker};
use entity_dedupe::cli::parse_cli_to_app_config;
use entity_dedupe::config::AppConfig;
use entity_dedupe::db::make_pool;
use entity_dedupe::matching::FieldSimilarityMatcher;
use entity_dedupe::pipeline;
use entity_dedupe::util::envfile::{load_dotenv_if_present, write_env_template};

async fn run(cfg: AppConfig) -> Result<()> {
    info!(
        "Deduplicating {}.{} on {} ({} fields, {} workers)",
        cfg.database.database,
        cfg.source.table,
        cfg.database.host,
        cfg.source.fields.len(),
        cfg.pipeline.workers
    );
    let pool = make_pool(&cfg.database)
        .await
        .context("Failed to connect to database")?;

    let blocker = PredicateBlocker::for_schema(&cfg.source)?;
    info!(
        "Blocking with {} predicate rules; index fields: {:?}",
        blocker.rules().count(),
        blocker.index_fields()
    );
    let matcher = FieldSimilarityMatcher::new(cfg.source.fields.clone(), cfg.pipeline.workers)?;

    let summary = pipeline::run(&pool, &cfg, blocker, matcher).await?;
    summary.log();
    pool.close().await;
    Ok(())
}

fn main() {
    // .env must be applied before clap reads DB_* from the environment.
    let dotenv = load_dotenv_if_present();
    let (cli, cfg) = parse_cli_to_app_config();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
    match dotenv {
        Ok(env) => {
            for line in &env.skipped {
                warn!("Ignoring .env line {} without '='", line);
            }
            if !env.vars.is_empty() {
                debug!("Loaded {} variables from .env", env.vars.len());
            }
        }
        Err(e) => warn!("Failed to load .env: {:#}", e),
    }

    if let Some(path) = &cli.write_env_template {
        match write_env_template(path) {
            Ok(()) => {
                info!("Wrote {}", path.display());
                std::process::exit(0);
            }
            Err(e) => {
                error!("{:#}", e);
                std::process::exit(2);
            }
        }
    }

    let cfg = match cfg {
        Ok(c) => c,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cfg)) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use riptide_engine::EngineBuilder;
use riptide_rules::{Rule, RulesEngine};
use riptide_server::{AppState, router};

#[derive(Debug, Parser)]
#[command(name = "riptide-api")]
#[command(about = "Riptide real-time document database API")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
    /// SQLite database file; omitted, state lives in memory.
    #[arg(long)]
    db: Option<PathBuf>,
    /// JSON rules file: an ordered list of {pattern, operations, expression}.
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long, env = "RIPTIDE_SIGNING_SECRET")]
    signing_secret: Option<String>,
    /// Bearer token guarding POST /documents/internal/reset. Unset, the
    /// reset route refuses every caller.
    #[arg(long, env = "RIPTIDE_ADMIN_TOKEN")]
    admin_token: Option<String>,
}

fn load_rules(path: &std::path::Path) -> Result<RulesEngine> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {path:?}"))?;
    let rules: Vec<Rule> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse rules {path:?}"))?;
    info!(count = rules.len(), "rules loaded; declaration order decides");
    Ok(RulesEngine::new(rules)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    let rules = match &cli.rules {
        Some(path) => load_rules(path)?,
        None => {
            warn!("no rules file given; any authenticated caller is allowed");
            RulesEngine::permissive_defaults()
        }
    };

    let mut builder = EngineBuilder::new().rules(rules);
    if let Some(db) = &cli.db {
        builder = builder.db_path(db);
    }
    if let Some(secret) = &cli.signing_secret {
        builder = builder.signing_secret(secret.as_bytes().to_vec());
    } else {
        warn!("using the built-in dev signing secret; set RIPTIDE_SIGNING_SECRET in production");
    }
    let engine = builder.build()?;

    let mut state = AppState::new(engine);
    match &cli.admin_token {
        Some(token) => state = state.with_admin_token(token),
        None => warn!("no admin token configured; the internal reset route is disabled"),
    }

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, db = ?cli.db, "riptide-api serving");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

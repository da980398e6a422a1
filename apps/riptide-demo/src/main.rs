use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;

use riptide_bus::InProcessBroker;
use riptide_client::RiptideClient;
use riptide_engine::EngineBuilder;
use riptide_protocol::{Direction, FilterOp};
use riptide_server::{AppState, router};

#[derive(Debug, Parser)]
#[command(name = "riptide-demo")]
#[command(about = "Riptide end-to-end demo: server, live subscription, offline-style flows")]
struct Cli {
    #[arg(long, default_value = "demo-user")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").compact().init();

    let cli = Cli::parse();

    let broker = Arc::new(InProcessBroker::default());
    let engine = EngineBuilder::new().broker(broker.clone()).build()?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(engine.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    info!(%addr, "demo server up");

    let cache_dir = tempfile::tempdir()?;
    let client = RiptideClient::builder()
        .endpoint(format!("http://{addr}"))
        .user(cli.user)
        .broker(broker)
        .persistence(cache_dir.path().join("demo.redb"))
        .build()?;

    let token = client.token().await?;
    info!(token_len = token.len(), "broker token issued");

    // Live subscription to the five highest-priority active tasks.
    let watcher = client
        .collection("tasks")?
        .where_field("status", FilterOp::Eq, json!("active"))
        .order_by("priority", Direction::Desc)
        .limit(5)
        .on_snapshot(|snapshot| {
            let titles: Vec<String> = snapshot
                .docs
                .iter()
                .map(|doc| format!("{}({})", doc.id, doc.data["priority"]))
                .collect();
            info!(result_set = ?titles, "live query delivered");
        })?;

    // Seed a few tasks through the fluent surface.
    for (id, priority) in [("triage", 3), ("ship", 8), ("docs", 1)] {
        client
            .doc(&format!("tasks/{id}"))?
            .set(json!({"status": "active", "priority": priority}))
            .await?;
    }

    // A merge patch only touches the named keys.
    client.doc("tasks/docs")?.update(json!({"priority": 9})).await?;

    let snapshot = client.doc("tasks/docs")?.get().await?;
    info!(data = %snapshot.data.unwrap_or_default(), version = snapshot.version, "read back");

    // Read-modify-write with OCC: bump a counter safely.
    client.doc("counters/visits")?.set(json!({"n": 0})).await?;
    let bumper = client.clone();
    client
        .run_transaction(move |tx| {
            let client = bumper.clone();
            async move {
                let doc = client.doc("counters/visits")?;
                let snapshot = tx.get(&doc).await?;
                let n = snapshot
                    .data
                    .as_ref()
                    .and_then(|data| data["n"].as_i64())
                    .unwrap_or(0);
                tx.update(&doc, json!({"n": n + 1}));
                Ok(())
            }
        })
        .await?;
    let counter = client.doc("counters/visits")?.get().await?;
    info!(data = %counter.data.unwrap_or_default(), "counter after transaction");

    // Let the debounced listener flush its last delivery.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    watcher.dispose();

    info!("demo complete");
    Ok(())
}

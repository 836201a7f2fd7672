use anyhow::Context;
use dbver_migrate::{Database, DatabaseConfig};
use serde_json::json;

use super::Output;

pub async fn run(config: &DatabaseConfig, output: Output) -> anyhow::Result<()> {
    let target = config.redacted_target();
    let database = Database::connect(config)
        .await
        .with_context(|| format!("failed to connect to {}", target))?;

    let result = database.ping().await;
    database.close().await;
    let elapsed = result.with_context(|| format!("ping to {} failed", target))?;

    output.emit(
        &json!({ "target": target, "latency_ms": elapsed.as_secs_f64() * 1000.0 }),
        || format!("{} is reachable ({:.1} ms)", target, elapsed.as_secs_f64() * 1000.0),
    )
}

use anyhow::Context;
use dbver_migrate::{
    Database, DatabaseConfig, MigrationConfig, MigrationManager, MigrationPlan, Migrator,
};
use serde_json::json;

use super::Output;

async fn connect(config: &DatabaseConfig) -> anyhow::Result<Database> {
    let target = config.redacted_target();
    tracing::debug!(database = %target, "connecting");
    Database::connect(config)
        .await
        .with_context(|| format!("failed to connect to {}", target))
}

pub async fn run(
    database_config: &DatabaseConfig,
    config: MigrationConfig,
    output: Output,
) -> anyhow::Result<()> {
    let database = connect(database_config).await?;
    let result = Migrator::for_database(&database, config).migrate().await;
    database.close().await;

    match result {
        Ok(status) => output.emit(&status, || format!("Migrations complete: {}", status)),
        Err(failure) => {
            output.emit(&failure.status, || {
                format!("Migrations stopped: {}", failure.status)
            })?;
            Err(failure.error).context("migration run failed")
        }
    }
}

pub async fn status(
    database_config: &DatabaseConfig,
    config: MigrationConfig,
    output: Output,
) -> anyhow::Result<()> {
    let database = connect(database_config).await?;
    let plan = Migrator::for_database(&database, config).plan().await;
    database.close().await;
    let plan = plan.context("could not reconcile migrations with the database")?;

    let report = json!({
        "current": plan.state,
        "up_to_date": plan.is_up_to_date(),
        "migrations": plan.migrations,
    });
    output.emit(&report, || render_plan(&plan))
}

pub async fn create(config: MigrationConfig, name: &str, output: Output) -> anyhow::Result<()> {
    let path = MigrationManager::with_config(config)
        .create_migration(name)
        .await
        .context("failed to create migration")?;

    output.emit(&json!({ "created": path }), || {
        format!("Created migration: {}", path.display())
    })
}

pub async fn resolve(
    database_config: &DatabaseConfig,
    config: MigrationConfig,
    version: u64,
    output: Output,
) -> anyhow::Result<()> {
    let database = connect(database_config).await?;
    let resolved = Migrator::for_database(&database, config).resolve(version).await;
    database.close().await;
    let state = resolved.with_context(|| format!("could not resolve migration {}", version))?;

    tracing::warn!(version, file = %state.file, "migration marked complete by hand");
    output.emit(&state, || {
        format!("Migration {} ({}) marked complete", state.version, state.file)
    })
}

fn render_plan(plan: &MigrationPlan) -> String {
    let mut lines = vec![format!(
        "Current version: {} ({})",
        plan.state.version,
        if plan.state.complete {
            "complete"
        } else {
            "incomplete"
        }
    )];

    if plan.migrations.is_empty() {
        lines.push("No migrations found".to_string());
    }
    for migration in &plan.migrations {
        let marker = if migration.complete {
            "applied"
        } else {
            "pending"
        };
        lines.push(format!(
            "  {:>8}  {:<7}  {}",
            migration.version,
            marker,
            migration.file.display()
        ));
    }

    let pending = plan.pending().count();
    lines.push(if pending == 0 {
        "Up to date".to_string()
    } else {
        format!("{} pending", pending)
    });
    lines.join("\n")
}

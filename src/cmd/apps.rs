//! Application management commands — `slipway register`, `slipway applications`.

use anyhow::{Context, Result};

use slipway::config::SlipwayConfig;
use slipway::store::{NewApplication, SqliteStore, Store};

pub async fn cmd_register(
    config: SlipwayConfig,
    name: String,
    repository: String,
    label: Option<String>,
    credentials_id: Option<i64>,
    auto_build: bool,
) -> Result<()> {
    let store = open_store(&config)?;
    let application = store
        .create_application(NewApplication {
            name,
            label,
            repository,
            credentials_id,
            auto_build,
        })
        .await
        .context("Failed to register application")?;

    println!(
        "Registered application '{}' (id {})",
        application.name, application.id
    );
    if !application.auto_build {
        println!("Automatic builds are off; branches will be tracked only.");
    }
    Ok(())
}

pub async fn cmd_applications(config: SlipwayConfig) -> Result<()> {
    let store = open_store(&config)?;
    let applications = store
        .list_applications()
        .await
        .context("Failed to list applications")?;

    if applications.is_empty() {
        println!("No applications registered.");
        return Ok(());
    }

    println!("{:<6} {:<24} {:<6} REPOSITORY", "ID", "NAME", "AUTO");
    for application in applications {
        println!(
            "{:<6} {:<24} {:<6} {}",
            application.id,
            application.name,
            if application.auto_build { "yes" } else { "no" },
            application.repository
        );
    }
    Ok(())
}

fn open_store(config: &SlipwayConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.daemon.db_path).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.daemon.db_path.display()
        )
    })
}

//! Inventory export and import: `numberhub export`, `numberhub import`.

use std::path::Path;

use anyhow::{Context, Result};

use numberhub::config::HubConfig;
use numberhub::hub::models::EventLevel;
use numberhub::hub::server::open_database;

pub fn cmd_export(config: &HubConfig, output: Option<&Path>) -> Result<()> {
    let db = open_database(config)?;
    let export = db.export_inventory()?;
    let json = serde_json::to_string_pretty(&export).context("Failed to serialize export")?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "Exported {} people, {} numbers, {} store accounts, {} assignments to {}",
                export.people.len(),
                export.numbers.len(),
                export.store_accounts.len(),
                export.assignments.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn cmd_import(config: &HubConfig, table: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let rows: Vec<serde_json::Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of rows", file.display()))?;

    let db = open_database(config)?;
    let inserted = db.import_rows(table, &rows)?;
    db.log_event(
        EventLevel::Info,
        "import",
        &format!("Imported {} of {} rows into {} from the CLI", inserted, rows.len(), table),
        None,
        &serde_json::json!({"table": table, "inserted": inserted, "total": rows.len()}),
    )?;
    println!("Imported {} of {} rows into {}", inserted, rows.len(), table);
    Ok(())
}

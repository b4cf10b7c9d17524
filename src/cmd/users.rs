//! Database bootstrap and user management: `numberhub init-db`, `numberhub create-user`.

use std::str::FromStr;

use anyhow::{Context, Result};

use numberhub::config::HubConfig;
use numberhub::hub::auth::hash_password;
use numberhub::hub::models::{EventLevel, Role};
use numberhub::hub::server::open_database;

pub fn cmd_init_db(config: &HubConfig) -> Result<()> {
    let db = open_database(config)?;
    let admin = db.get_user_by_username(&config.auth.admin_username)?;
    println!(
        "Database initialized at {}",
        config.server.db_path.display()
    );
    match admin {
        Some(user) => println!("Admin user: {}", user.username),
        None => println!("No admin user yet; set ADMIN_PASSWORD and re-run to create one."),
    }
    Ok(())
}

pub fn cmd_create_user(
    config: &HubConfig,
    username: &str,
    password: &str,
    role: &str,
    email: Option<&str>,
) -> Result<()> {
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    let role = Role::from_str(role).map_err(anyhow::Error::msg)?;
    let db = open_database(config)?;
    let hash = hash_password(password)?;
    let user = db
        .create_user(username, email, role, &hash)
        .with_context(|| format!("Failed to create user '{}'", username))?;
    db.log_event(
        EventLevel::Info,
        "user_created",
        &format!("Created user {} ({}) from the CLI", user.username, user.role.as_str()),
        None,
        &serde_json::json!({"user_id": user.id}),
    )?;
    println!("Created {} user '{}' (id {})", user.role.as_str(), user.username, user.id);
    Ok(())
}

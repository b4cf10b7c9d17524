use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::models::*;
use super::phone::{extract_otp_code, normalize_phone_number, number_variants};
use crate::errors::HubError;

/// Tables that may be targeted by name from the API or CLI.
const DELETABLE_TABLES: &[&str] = &[
    "people",
    "numbers",
    "store_accounts",
    "assignments",
    "users",
    "user_numbers",
    "number_tags",
    "sms_messages",
    "app_events",
];

/// Async-safe handle to the hub database.
///
/// Wraps `HubDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<HubDb>>,
}

impl DbHandle {
    pub fn new(db: HubDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HubDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, HubDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of storing an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub id: i64,
    pub number_id: Option<i64>,
    pub otp_code: Option<String>,
    /// The provider SID was already stored; `id` is the existing row.
    pub duplicate: bool,
}

pub struct HubDb {
    conn: Connection,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an inbox time bound (RFC 3339 or `YYYY-MM-DD`, taken as midnight
/// UTC) into the stored `YYYY-MM-DDTHH:MM:SSZ` form so that text comparison
/// orders by instant.
fn time_bound(raw: &str) -> Result<String> {
    let instant = match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .ok_or_else(|| HubError::InvalidInput(format!("Invalid timestamp: {}", raw)))?,
    };
    Ok(instant.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn clean(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// True when the error chain contains a SQLite constraint violation.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

impl HubDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Run raw SQL against the connection, for tests that need to break
    /// the schema.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to run raw SQL")
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS people (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    email TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS numbers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    e164 TEXT NOT NULL UNIQUE,
                    provider TEXT,
                    country TEXT,
                    capabilities TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    notes TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS store_accounts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    platform TEXT NOT NULL,
                    store_name TEXT,
                    store_id TEXT,
                    login_email TEXT,
                    notes TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(platform, store_id, login_email)
                );

                CREATE TABLE IF NOT EXISTS assignments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    person_id INTEGER NOT NULL REFERENCES people(id),
                    number_id INTEGER NOT NULL REFERENCES numbers(id),
                    store_account_id INTEGER NOT NULL REFERENCES store_accounts(id),
                    purpose TEXT NOT NULL DEFAULT '2fa',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    UNIQUE(number_id, store_account_id)
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT,
                    role TEXT NOT NULL DEFAULT 'user',
                    password_hash TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    last_login_at TEXT
                );

                CREATE TABLE IF NOT EXISTS user_numbers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    number_id INTEGER NOT NULL REFERENCES numbers(id) ON DELETE CASCADE,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    UNIQUE(user_id, number_id)
                );

                CREATE TABLE IF NOT EXISTS number_tags (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    number_id INTEGER NOT NULL UNIQUE REFERENCES numbers(id) ON DELETE CASCADE,
                    store_tag TEXT,
                    purpose_tag TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sms_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider TEXT NOT NULL,
                    provider_message_sid TEXT,
                    to_number TEXT NOT NULL,
                    from_number TEXT,
                    body TEXT,
                    received_at TEXT NOT NULL,
                    number_id INTEGER REFERENCES numbers(id) ON DELETE SET NULL,
                    is_read INTEGER NOT NULL DEFAULT 0,
                    otp_code TEXT,
                    raw_payload TEXT,
                    UNIQUE(provider, provider_message_sid)
                );

                CREATE TABLE IF NOT EXISTS app_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    level TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    message TEXT NOT NULL,
                    user_id INTEGER,
                    context_json TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sms_received_at ON sms_messages(received_at);
                CREATE INDEX IF NOT EXISTS idx_sms_to_number ON sms_messages(to_number);
                CREATE INDEX IF NOT EXISTS idx_sms_number_id ON sms_messages(number_id);
                CREATE INDEX IF NOT EXISTS idx_user_numbers_user ON user_numbers(user_id);
                CREATE INDEX IF NOT EXISTS idx_user_numbers_number ON user_numbers(number_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── People ────────────────────────────────────────────────────────

    pub fn create_person(&self, name: &str, email: Option<&str>) -> Result<Person> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::InvalidInput("Person name is required".into()).into());
        }
        self.conn
            .execute(
                "INSERT INTO people (name, email, created_at) VALUES (?1, ?2, ?3)",
                params![name, clean(email), now_iso()],
            )
            .context("Failed to insert person")?;
        let id = self.conn.last_insert_rowid();
        self.get_person(id)?.context("Person not found after insert")
    }

    pub fn list_people(&self) -> Result<Vec<Person>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, email, created_at FROM people ORDER BY name")
            .context("Failed to prepare list_people")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query people")?;
        let mut people = Vec::new();
        for row in rows {
            people.push(row.context("Failed to read person row")?);
        }
        Ok(people)
    }

    pub fn get_person(&self, id: i64) -> Result<Option<Person>> {
        self.conn
            .query_row(
                "SELECT id, name, email, created_at FROM people WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Person {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query person")
    }

    // ── Numbers ───────────────────────────────────────────────────────

    const NUMBER_SELECT: &'static str = "SELECT n.id, n.e164, n.provider, n.country, n.capabilities, n.status, n.notes, t.store_tag, t.purpose_tag, n.created_at
         FROM numbers n
         LEFT JOIN number_tags t ON t.number_id = n.id";

    fn query_numbers(&self, sql: &str, values: Vec<Value>) -> Result<Vec<PhoneNumber>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare number query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(NumberRow {
                    id: row.get(0)?,
                    e164: row.get(1)?,
                    provider: row.get(2)?,
                    country: row.get(3)?,
                    capabilities: row.get(4)?,
                    status: row.get(5)?,
                    notes: row.get(6)?,
                    store_tag: row.get(7)?,
                    purpose_tag: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query numbers")?;
        let mut numbers = Vec::new();
        for row in rows {
            let r = row.context("Failed to read number row")?;
            numbers.push(r.into_number()?);
        }
        Ok(numbers)
    }

    pub fn create_number(&self, new: &NewNumber) -> Result<PhoneNumber> {
        let e164 = normalize_phone_number(&new.e164);
        if e164.is_empty() {
            return Err(HubError::InvalidInput(format!(
                "Phone number '{}' contains no digits",
                new.e164
            ))
            .into());
        }
        let status = new.status.unwrap_or(NumberStatus::Active);
        self.conn
            .execute(
                "INSERT INTO numbers (e164, provider, country, capabilities, status, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    e164,
                    clean(new.provider.as_deref()),
                    clean(new.country.as_deref()),
                    clean(new.capabilities.as_deref()),
                    status.as_str(),
                    clean(new.notes.as_deref()),
                    now_iso(),
                ],
            )
            .context("Failed to insert number")?;
        let id = self.conn.last_insert_rowid();
        self.get_number(id)?.context("Number not found after insert")
    }

    pub fn list_numbers(&self) -> Result<Vec<PhoneNumber>> {
        let sql = format!("{} ORDER BY n.e164", Self::NUMBER_SELECT);
        self.query_numbers(&sql, Vec::new())
    }

    /// Numbers the user currently holds an active assignment for.
    pub fn list_numbers_for_user(&self, user_id: i64) -> Result<Vec<PhoneNumber>> {
        let sql = format!(
            "{} JOIN user_numbers un ON un.number_id = n.id AND un.user_id = ? AND un.is_active = 1
             ORDER BY n.e164",
            Self::NUMBER_SELECT
        );
        self.query_numbers(&sql, vec![Value::Integer(user_id)])
    }

    pub fn get_number(&self, id: i64) -> Result<Option<PhoneNumber>> {
        let sql = format!("{} WHERE n.id = ?", Self::NUMBER_SELECT);
        Ok(self.query_numbers(&sql, vec![Value::Integer(id)])?.into_iter().next())
    }

    /// Look a number up by any stored form of a normalized carrier value.
    pub fn find_number(&self, normalized: &str) -> Result<Option<PhoneNumber>> {
        let variants = number_variants(normalized);
        if variants.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "{} WHERE n.e164 IN ({}) ORDER BY n.id LIMIT 1",
            Self::NUMBER_SELECT,
            placeholders(variants.len())
        );
        let values = variants.into_iter().map(Value::Text).collect();
        Ok(self.query_numbers(&sql, values)?.into_iter().next())
    }

    pub fn update_number(&self, id: i64, update: &NumberUpdate) -> Result<Option<PhoneNumber>> {
        if self.get_number(id)?.is_none() {
            return Ok(None);
        }

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let text_fields = [
            ("provider", &update.provider),
            ("country", &update.country),
            ("capabilities", &update.capabilities),
            ("notes", &update.notes),
        ];
        for (column, value) in text_fields {
            if let Some(v) = value {
                tx.execute(
                    &format!("UPDATE numbers SET {} = ?1 WHERE id = ?2", column),
                    params![clean(Some(v.as_str())), id],
                )
                .with_context(|| format!("Failed to update number {}", column))?;
            }
        }
        if let Some(status) = update.status {
            tx.execute(
                "UPDATE numbers SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update number status")?;
        }

        tx.commit().context("Failed to commit number update")?;
        self.get_number(id)
    }

    pub fn set_number_tags(&self, number_id: i64, tags: &NumberTags) -> Result<Option<PhoneNumber>> {
        if self.get_number(number_id)?.is_none() {
            return Ok(None);
        }
        self.conn
            .execute(
                "INSERT INTO number_tags (number_id, store_tag, purpose_tag, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(number_id) DO UPDATE SET
                     store_tag = excluded.store_tag,
                     purpose_tag = excluded.purpose_tag",
                params![
                    number_id,
                    clean(tags.store_tag.as_deref()),
                    clean(tags.purpose_tag.as_deref()),
                    now_iso(),
                ],
            )
            .context("Failed to upsert number tags")?;
        self.get_number(number_id)
    }

    // ── Store accounts ────────────────────────────────────────────────

    const STORE_SELECT: &'static str =
        "SELECT id, platform, store_name, store_id, login_email, notes, created_at FROM store_accounts";

    fn store_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreAccount> {
        Ok(StoreAccount {
            id: row.get(0)?,
            platform: row.get(1)?,
            store_name: row.get(2)?,
            store_id: row.get(3)?,
            login_email: row.get(4)?,
            notes: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    pub fn create_store_account(&self, new: &NewStoreAccount) -> Result<StoreAccount> {
        let platform = new.platform.trim();
        if platform.is_empty() {
            return Err(HubError::InvalidInput("Store platform is required".into()).into());
        }
        self.conn
            .execute(
                "INSERT INTO store_accounts (platform, store_name, store_id, login_email, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    platform,
                    clean(new.store_name.as_deref()),
                    clean(new.store_id.as_deref()),
                    clean(new.login_email.as_deref()),
                    clean(new.notes.as_deref()),
                    now_iso(),
                ],
            )
            .context("Failed to insert store account")?;
        let id = self.conn.last_insert_rowid();
        self.get_store_account(id)?
            .context("Store account not found after insert")
    }

    pub fn list_store_accounts(&self) -> Result<Vec<StoreAccount>> {
        let sql = format!(
            "{} ORDER BY platform, COALESCE(store_name, ''), COALESCE(store_id, '')",
            Self::STORE_SELECT
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_store_accounts")?;
        let rows = stmt
            .query_map([], Self::store_from_row)
            .context("Failed to query store accounts")?;
        let mut stores = Vec::new();
        for row in rows {
            stores.push(row.context("Failed to read store account row")?);
        }
        Ok(stores)
    }

    pub fn get_store_account(&self, id: i64) -> Result<Option<StoreAccount>> {
        let sql = format!("{} WHERE id = ?1", Self::STORE_SELECT);
        self.conn
            .query_row(&sql, params![id], Self::store_from_row)
            .optional()
            .context("Failed to query store account")
    }

    // ── Assignments ───────────────────────────────────────────────────

    pub fn create_assignment(
        &self,
        person_id: i64,
        number_id: i64,
        store_account_id: i64,
        purpose: Option<&str>,
    ) -> Result<Assignment> {
        let purpose = clean(purpose).unwrap_or_else(|| "2fa".to_string());
        self.conn
            .execute(
                "INSERT INTO assignments (person_id, number_id, store_account_id, purpose, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![person_id, number_id, store_account_id, purpose, now_iso()],
            )
            .context("Failed to insert assignment")?;
        let id = self.conn.last_insert_rowid();
        self.get_assignment(id)?
            .context("Assignment not found after insert")
    }

    pub fn get_assignment(&self, id: i64) -> Result<Option<Assignment>> {
        self.conn
            .query_row(
                "SELECT id, person_id, number_id, store_account_id, purpose, is_active, created_at
                 FROM assignments WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Assignment {
                        id: row.get(0)?,
                        person_id: row.get(1)?,
                        number_id: row.get(2)?,
                        store_account_id: row.get(3)?,
                        purpose: row.get(4)?,
                        is_active: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query assignment")
    }

    pub fn list_assignments(&self, active_only: bool) -> Result<Vec<AssignmentView>> {
        let filter = if active_only { "WHERE a.is_active = 1" } else { "" };
        let sql = format!(
            "SELECT a.id, a.purpose, a.is_active, a.created_at,
                    p.name, p.email, n.e164, n.provider,
                    s.platform, s.store_name, s.store_id, s.login_email
             FROM assignments a
             JOIN people p ON p.id = a.person_id
             JOIN numbers n ON n.id = a.number_id
             JOIN store_accounts s ON s.id = a.store_account_id
             {}
             ORDER BY a.is_active DESC, p.name, s.platform",
            filter
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_assignments")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AssignmentView {
                    id: row.get(0)?,
                    purpose: row.get(1)?,
                    is_active: row.get(2)?,
                    created_at: row.get(3)?,
                    person_name: row.get(4)?,
                    person_email: row.get(5)?,
                    number_e164: row.get(6)?,
                    number_provider: row.get(7)?,
                    platform: row.get(8)?,
                    store_name: row.get(9)?,
                    store_id: row.get(10)?,
                    login_email: row.get(11)?,
                })
            })
            .context("Failed to query assignments")?;
        let mut assignments = Vec::new();
        for row in rows {
            assignments.push(row.context("Failed to read assignment row")?);
        }
        Ok(assignments)
    }

    pub fn deactivate_assignment(&self, id: i64) -> Result<Option<Assignment>> {
        self.conn
            .execute("UPDATE assignments SET is_active = 0 WHERE id = ?1", params![id])
            .context("Failed to deactivate assignment")?;
        self.get_assignment(id)
    }

    // ── Users ─────────────────────────────────────────────────────────

    const USER_SELECT: &'static str = "SELECT id, username, email, role, password_hash, is_active, created_at, last_login_at FROM users";

    fn query_users(&self, sql: &str, values: Vec<Value>) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare user query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    role: row.get(3)?,
                    password_hash: row.get(4)?,
                    is_active: row.get(5)?,
                    created_at: row.get(6)?,
                    last_login_at: row.get(7)?,
                })
            })
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            let r = row.context("Failed to read user row")?;
            users.push(r.into_user()?);
        }
        Ok(users)
    }

    pub fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        role: Role,
        password_hash: &str,
    ) -> Result<User> {
        let username = username.trim().to_lowercase();
        if username.is_empty() {
            return Err(HubError::InvalidInput("Username is required".into()).into());
        }
        self.conn
            .execute(
                "INSERT INTO users (username, email, role, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![username, clean(email), role.as_str(), password_hash, now_iso()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let sql = format!("{} WHERE id = ?", Self::USER_SELECT);
        Ok(self.query_users(&sql, vec![Value::Integer(id)])?.into_iter().next())
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let sql = format!("{} WHERE username = ? LIMIT 1", Self::USER_SELECT);
        let username = username.trim().to_lowercase();
        Ok(self.query_users(&sql, vec![Value::Text(username)])?.into_iter().next())
    }

    pub fn list_users(&self, active_only: bool) -> Result<Vec<User>> {
        let filter = if active_only { "WHERE is_active = 1" } else { "" };
        let sql = format!("{} {} ORDER BY username", Self::USER_SELECT, filter);
        self.query_users(&sql, Vec::new())
    }

    pub fn set_user_active(&self, id: i64, is_active: bool) -> Result<Option<User>> {
        self.conn
            .execute(
                "UPDATE users SET is_active = ?1 WHERE id = ?2",
                params![is_active, id],
            )
            .context("Failed to update user active flag")?;
        self.get_user(id)
    }

    pub fn set_last_login(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                params![now_iso(), id],
            )
            .context("Failed to update last login")?;
        Ok(())
    }

    // ── User ↔ number access ──────────────────────────────────────────

    /// Grant a user access to a number. Re-granting a revoked pair reactivates it.
    pub fn assign_number_to_user(&self, user_id: i64, number_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_numbers (user_id, number_id, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, number_id) DO UPDATE SET is_active = 1",
                params![user_id, number_id, now_iso()],
            )
            .context("Failed to assign number to user")?;
        Ok(())
    }

    pub fn unassign_number_from_user(&self, user_id: i64, number_id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE user_numbers SET is_active = 0
                 WHERE user_id = ?1 AND number_id = ?2 AND is_active = 1",
                params![user_id, number_id],
            )
            .context("Failed to unassign number from user")?;
        Ok(count > 0)
    }

    pub fn list_number_users(&self, number_id: i64, active_only: bool) -> Result<Vec<NumberUser>> {
        let filter = if active_only { "AND un.is_active = 1" } else { "" };
        let sql = format!(
            "SELECT u.id, u.username, u.email, u.role, un.is_active, un.created_at
             FROM user_numbers un
             JOIN users u ON u.id = un.user_id
             WHERE un.number_id = ?1 {}
             ORDER BY u.username",
            filter
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_number_users")?;
        let rows = stmt
            .query_map(params![number_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query number users")?;
        let mut users = Vec::new();
        for row in rows {
            let (user_id, username, email, role, is_active, created_at) =
                row.context("Failed to read number user row")?;
            users.push(NumberUser {
                user_id,
                username,
                email,
                role: Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?,
                is_active,
                created_at,
            });
        }
        Ok(users)
    }

    /// Active user ids holding the number; used to scope live notifications.
    pub fn active_user_ids_for_number(&self, number_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT un.user_id FROM user_numbers un
                 JOIN users u ON u.id = un.user_id
                 WHERE un.number_id = ?1 AND un.is_active = 1 AND u.is_active = 1
                 ORDER BY un.user_id",
            )
            .context("Failed to prepare active_user_ids_for_number")?;
        let rows = stmt
            .query_map(params![number_id], |row| row.get::<_, i64>(0))
            .context("Failed to query number users")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read user id")?);
        }
        Ok(ids)
    }

    /// Admins see every number; users only numbers actively assigned to them.
    pub fn can_view_number(&self, user: &User, number_id: Option<i64>) -> Result<bool> {
        if user.is_admin() {
            return Ok(true);
        }
        let Some(number_id) = number_id else {
            return Ok(false);
        };
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM user_numbers
                 WHERE user_id = ?1 AND number_id = ?2 AND is_active = 1",
                params![user.id, number_id],
                |row| row.get(0),
            )
            .context("Failed to check number access")?;
        Ok(exists)
    }

    // ── Messages ──────────────────────────────────────────────────────

    const MESSAGE_SELECT: &'static str = "SELECT m.id, m.provider, m.provider_message_sid, m.to_number, m.from_number, m.body,
                m.received_at, m.number_id, n.e164, m.is_read, m.otp_code, t.store_tag, t.purpose_tag
         FROM sms_messages m
         LEFT JOIN numbers n ON n.id = m.number_id
         LEFT JOIN number_tags t ON t.number_id = m.number_id";

    fn query_messages_sql(&self, sql: &str, values: Vec<Value>) -> Result<Vec<SmsMessage>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(SmsMessage {
                    id: row.get(0)?,
                    provider: row.get(1)?,
                    provider_message_sid: row.get(2)?,
                    to_number: row.get(3)?,
                    from_number: row.get(4)?,
                    body: row.get(5)?,
                    received_at: row.get(6)?,
                    number_id: row.get(7)?,
                    number_e164: row.get(8)?,
                    is_read: row.get(9)?,
                    otp_code: row.get(10)?,
                    tags: NumberTags {
                        store_tag: row.get(11)?,
                        purpose_tag: row.get(12)?,
                    },
                })
            })
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?);
        }
        Ok(messages)
    }

    /// Store an inbound SMS, matching it to the inventory and extracting its OTP.
    ///
    /// Carriers retry webhooks; a repeated `(provider, provider_message_sid)`
    /// returns the stored row instead of inserting a second copy.
    pub fn insert_inbound(&self, sms: &InboundSms) -> Result<InsertOutcome> {
        let provider = sms.provider.trim().to_lowercase();
        let to_number = sms.to_number.trim().to_string();
        let number_id = self.find_number(&to_number)?.map(|n| n.id);
        let otp_code = extract_otp_code(sms.body.as_deref());
        let received_at = sms.received_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let raw_payload =
            serde_json::to_string(&sms.raw_payload).unwrap_or_else(|_| "{}".to_string());

        let inserted = self
            .conn
            .execute(
                "INSERT INTO sms_messages
                    (provider, provider_message_sid, to_number, from_number, body, received_at, number_id, otp_code, raw_payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(provider, provider_message_sid) DO NOTHING",
                params![
                    provider,
                    sms.provider_message_sid,
                    to_number,
                    clean(sms.from_number.as_deref()),
                    sms.body,
                    received_at,
                    number_id,
                    otp_code,
                    raw_payload,
                ],
            )
            .context("Failed to insert sms message")?;

        if inserted > 0 {
            return Ok(InsertOutcome {
                id: self.conn.last_insert_rowid(),
                number_id,
                otp_code,
                duplicate: false,
            });
        }

        let (id, existing_number, existing_otp): (i64, Option<i64>, Option<String>) = self
            .conn
            .query_row(
                "SELECT id, number_id, otp_code FROM sms_messages
                 WHERE provider = ?1 AND provider_message_sid = ?2",
                params![provider, sms.provider_message_sid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to load duplicate sms message")?;
        Ok(InsertOutcome {
            id,
            number_id: existing_number,
            otp_code: existing_otp,
            duplicate: true,
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<SmsMessage>> {
        let sql = format!("{} WHERE m.id = ?", Self::MESSAGE_SELECT);
        Ok(self
            .query_messages_sql(&sql, vec![Value::Integer(id)])?
            .into_iter()
            .next())
    }

    pub fn set_message_read(&self, id: i64, is_read: bool) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE sms_messages SET is_read = ?1 WHERE id = ?2",
                params![is_read, id],
            )
            .context("Failed to update message read flag")?;
        Ok(count > 0)
    }

    /// Inbox query, newest first. Limit is clamped to 1..=5000.
    pub fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<SmsMessage>> {
        let mut values: Vec<Value> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        let mut join = "";

        if let Some(user_id) = filter.viewer {
            join = "JOIN user_numbers un ON un.number_id = m.number_id AND un.user_id = ? AND un.is_active = 1";
            values.push(Value::Integer(user_id));
        }

        if let Some(to) = filter.to_number.as_deref() {
            let variants = number_variants(&normalize_phone_number(to));
            if variants.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("m.to_number IN ({})", placeholders(variants.len())));
            values.extend(variants.into_iter().map(Value::Text));
        }
        if let Some(from) = filter.from_number.as_deref() {
            clauses.push("m.from_number = ?".to_string());
            values.push(Value::Text(normalize_phone_number(from)));
        }
        if filter.unread_only {
            clauses.push("m.is_read = 0".to_string());
        }
        if let Some(since) = clean(filter.since.as_deref()) {
            clauses.push("m.received_at >= ?".to_string());
            values.push(Value::Text(time_bound(&since)?));
        }
        if let Some(until) = clean(filter.until.as_deref()) {
            clauses.push("m.received_at <= ?".to_string());
            values.push(Value::Text(time_bound(&until)?));
        }
        if let Some(tag) = clean(filter.store_tag.as_deref()) {
            clauses.push("t.store_tag = ?".to_string());
            values.push(Value::Text(tag));
        }
        if let Some(tag) = clean(filter.purpose_tag.as_deref()) {
            clauses.push("t.purpose_tag = ?".to_string());
            values.push(Value::Text(tag));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Value::Integer(filter.limit.clamp(1, 5000)));

        let sql = format!(
            "{} {} {} ORDER BY m.received_at DESC, m.id DESC LIMIT ?",
            Self::MESSAGE_SELECT,
            join,
            where_sql
        );
        self.query_messages_sql(&sql, values)
    }

    /// Messages sent to any stored form of `normalized`. Limit clamped to 1..=1000.
    pub fn list_messages_for_number(&self, normalized: &str, limit: i64) -> Result<Vec<SmsMessage>> {
        let variants = number_variants(normalized);
        if variants.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{} WHERE m.to_number IN ({}) ORDER BY m.received_at DESC, m.id DESC LIMIT ?",
            Self::MESSAGE_SELECT,
            placeholders(variants.len())
        );
        let mut values: Vec<Value> = variants.into_iter().map(Value::Text).collect();
        values.push(Value::Integer(limit.clamp(1, 1000)));
        self.query_messages_sql(&sql, values)
    }

    // ── Dashboard ─────────────────────────────────────────────────────

    /// Counters for the viewer. `today` is a `YYYY-MM-DD` UTC date prefix.
    pub fn dashboard_stats(&self, viewer: &User, today: &str) -> Result<DashboardStats> {
        let (number_join, message_join, base): (&str, &str, Vec<Value>) = if viewer.is_admin() {
            ("", "", Vec::new())
        } else {
            (
                "JOIN user_numbers un ON un.number_id = n.id AND un.user_id = ? AND un.is_active = 1",
                "JOIN user_numbers un ON un.number_id = m.number_id AND un.user_id = ? AND un.is_active = 1",
                vec![Value::Integer(viewer.id)],
            )
        };

        let count = |sql: String, values: Vec<Value>| -> Result<i64> {
            self.conn
                .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
                .context("Failed to query dashboard counter")
        };
        let with_today = |mut v: Vec<Value>| {
            v.push(Value::Text(format!("{}%", today)));
            v
        };

        let active_phone_numbers = count(
            format!(
                "SELECT COUNT(DISTINCT n.id) FROM numbers n {} WHERE n.status = 'active'",
                number_join
            ),
            base.clone(),
        )?;
        let sms_today = count(
            format!(
                "SELECT COUNT(*) FROM sms_messages m {} WHERE m.received_at LIKE ?",
                message_join
            ),
            with_today(base.clone()),
        )?;
        let otp_today = count(
            format!(
                "SELECT COUNT(*) FROM sms_messages m {} WHERE m.received_at LIKE ? AND m.otp_code IS NOT NULL",
                message_join
            ),
            with_today(base.clone()),
        )?;
        let unread = count(
            format!(
                "SELECT COUNT(*) FROM sms_messages m {} WHERE m.is_read = 0",
                message_join
            ),
            base,
        )?;
        let active_users = if viewer.is_admin() {
            count(
                "SELECT COUNT(*) FROM users WHERE is_active = 1".to_string(),
                Vec::new(),
            )?
        } else {
            0
        };

        Ok(DashboardStats {
            active_phone_numbers,
            sms_today,
            otp_today,
            unread,
            active_users,
        })
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn log_event(
        &self,
        level: EventLevel,
        event_type: &str,
        message: &str,
        user_id: Option<i64>,
        context: &serde_json::Value,
    ) -> Result<i64> {
        let context_json = serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string());
        self.conn
            .execute(
                "INSERT INTO app_events (level, event_type, message, user_id, context_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![level.as_str(), event_type.trim(), message, user_id, context_json, now_iso()],
            )
            .context("Failed to insert app event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest events first. Limit is clamped to 1..=2000.
    pub fn list_events(&self, limit: i64) -> Result<Vec<AppEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, level, event_type, message, user_id, context_json, created_at
                 FROM app_events ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 2000)], |row| {
                let context: Option<String> = row.get(5)?;
                Ok(AppEvent {
                    id: row.get(0)?,
                    level: row.get(1)?,
                    event_type: row.get(2)?,
                    message: row.get(3)?,
                    user_id: row.get(4)?,
                    context: context
                        .and_then(|c| serde_json::from_str(&c).ok())
                        .unwrap_or(serde_json::Value::Null),
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }

    // ── Generic table access ──────────────────────────────────────────

    /// Delete a row by id from an allow-listed table.
    pub fn delete_row(&self, table: &str, id: i64) -> Result<bool> {
        if !DELETABLE_TABLES.contains(&table) {
            return Err(HubError::InvalidInput(format!("Invalid table: {}", table)).into());
        }
        let count = self
            .conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", table), params![id])
            .with_context(|| format!("Failed to delete from {}", table))?;
        Ok(count > 0)
    }

    fn fetch_json_rows(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare export query")?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([]).context("Failed to run export query")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context("Failed to read export row")? {
            let mut obj = serde_json::Map::new();
            for (i, name) in columns.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    ValueRef::Null => serde_json::Value::Null,
                    ValueRef::Integer(n) => serde_json::Value::from(n),
                    ValueRef::Real(f) => serde_json::Value::from(f),
                    ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).to_string()),
                    ValueRef::Blob(_) => serde_json::Value::Null,
                };
                obj.insert(name.clone(), value);
            }
            out.push(serde_json::Value::Object(obj));
        }
        Ok(out)
    }

    pub fn export_inventory(&self) -> Result<InventoryExport> {
        Ok(InventoryExport {
            people: self.fetch_json_rows("SELECT * FROM people ORDER BY name")?,
            numbers: self.fetch_json_rows("SELECT * FROM numbers ORDER BY e164")?,
            store_accounts: self.fetch_json_rows(
                "SELECT * FROM store_accounts ORDER BY platform, COALESCE(store_name, ''), COALESCE(store_id, '')",
            )?,
            assignments: self.fetch_json_rows("SELECT * FROM assignments ORDER BY id")?,
        })
    }

    /// Insert rows into an inventory table, skipping rows that collide with
    /// existing ids or unique keys. Returns the number of rows inserted.
    pub fn import_rows(&self, table: &str, rows: &[serde_json::Value]) -> Result<usize> {
        let target = ImportTable::from_str(table)?;
        let columns = target.columns();
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            target.name(),
            columns.join(", "),
            placeholders(columns.len())
        );

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin import transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&sql).context("Failed to prepare import")?;
            for (index, row) in rows.iter().enumerate() {
                let obj = row.as_object().ok_or_else(|| {
                    HubError::InvalidInput(format!("Row {} of {} is not an object", index, table))
                })?;
                let values = columns
                    .iter()
                    .map(|col| target.value_for(col, obj.get(*col)))
                    .collect::<Result<Vec<Value>, String>>()
                    .map_err(|e| {
                        HubError::InvalidInput(format!("Row {} of {}: {}", index, table, e))
                    })?;
                inserted += stmt
                    .execute(params_from_iter(values.iter()))
                    .with_context(|| format!("Failed to import row {} of {}", index, table))?;
            }
        }
        tx.commit().context("Failed to commit import")?;
        Ok(inserted)
    }
}

// ── Import tables ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum ImportTable {
    People,
    Numbers,
    StoreAccounts,
    Assignments,
}

impl FromStr for ImportTable {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "people" => Ok(Self::People),
            "numbers" => Ok(Self::Numbers),
            "store_accounts" => Ok(Self::StoreAccounts),
            "assignments" => Ok(Self::Assignments),
            _ => Err(HubError::InvalidInput(format!("Invalid table: {}", s)).into()),
        }
    }
}

impl ImportTable {
    fn name(&self) -> &'static str {
        match self {
            Self::People => "people",
            Self::Numbers => "numbers",
            Self::StoreAccounts => "store_accounts",
            Self::Assignments => "assignments",
        }
    }

    fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::People => &["id", "name", "email", "created_at"],
            Self::Numbers => &[
                "id",
                "e164",
                "provider",
                "country",
                "capabilities",
                "status",
                "notes",
                "created_at",
            ],
            Self::StoreAccounts => &[
                "id",
                "platform",
                "store_name",
                "store_id",
                "login_email",
                "notes",
                "created_at",
            ],
            Self::Assignments => &[
                "id",
                "person_id",
                "number_id",
                "store_account_id",
                "purpose",
                "is_active",
                "created_at",
            ],
        }
    }

    /// Column value with defaults applied. Numbers are normalized and their
    /// status must parse, so every imported row reads back cleanly.
    fn value_for(&self, column: &str, raw: Option<&serde_json::Value>) -> Result<Value, String> {
        let value = raw.map(json_to_sql).unwrap_or(Value::Null);
        if *self == Self::Numbers {
            match (column, &value) {
                ("e164", Value::Text(t)) => {
                    let normalized = normalize_phone_number(t);
                    if normalized.trim_start_matches('+').is_empty() {
                        return Err(format!("e164 has no digits: {:?}", t));
                    }
                    return Ok(Value::Text(normalized));
                }
                ("e164", _) => return Err("e164 must be a string".to_string()),
                ("status", Value::Text(t)) => {
                    let status = NumberStatus::from_str(t)?;
                    return Ok(Value::Text(status.as_str().to_string()));
                }
                ("status", Value::Null) => {}
                ("status", _) => return Err("status must be a string".to_string()),
                _ => {}
            }
        }
        Ok(match (column, value) {
            ("created_at", Value::Null) => Value::Text(now_iso()),
            ("status", Value::Null) => Value::Text(NumberStatus::Active.as_str().to_string()),
            ("purpose", Value::Null) => Value::Text("2fa".to_string()),
            ("is_active", Value::Null) => Value::Integer(1),
            (_, v) => v,
        })
    }
}

fn json_to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

struct NumberRow {
    id: i64,
    e164: String,
    provider: Option<String>,
    country: Option<String>,
    capabilities: Option<String>,
    status: String,
    notes: Option<String>,
    store_tag: Option<String>,
    purpose_tag: Option<String>,
    created_at: String,
}

impl NumberRow {
    fn into_number(self) -> Result<PhoneNumber> {
        Ok(PhoneNumber {
            id: self.id,
            e164: self.e164,
            provider: self.provider,
            country: self.country,
            capabilities: self.capabilities,
            status: NumberStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            notes: self.notes,
            tags: NumberTags {
                store_tag: self.store_tag,
                purpose_tag: self.purpose_tag,
            },
            created_at: self.created_at,
        })
    }
}

struct UserRow {
    id: i64,
    username: String,
    email: Option<String>,
    role: String,
    password_hash: String,
    is_active: bool,
    created_at: String,
    last_login_at: Option<String>,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            username: self.username,
            email: self.email,
            role: Role::from_str(&self.role).map_err(|e| anyhow::anyhow!(e))?,
            password_hash: self.password_hash,
            is_active: self.is_active,
            created_at: self.created_at,
            last_login_at: self.last_login_at,
        })
    }
}

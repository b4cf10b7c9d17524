use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NumberStatus {
    Active,
    Inactive,
    Released,
}

impl NumberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Released => "released",
        }
    }
}

impl FromStr for NumberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "released" => Ok(Self::Released),
            _ => Err(format!("Invalid number status: {}", s)),
        }
    }
}

// ── Users ─────────────────────────────────────────────────────────────

/// Full user row. Never serialized to clients; see [`UserPublic`].
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_login_at: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn public(&self) -> UserPublic {
        UserPublic {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
            is_active: self.is_active,
            last_login_at: self.last_login_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPublic {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub last_login_at: Option<String>,
}

// ── Inventory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NumberTags {
    pub store_tag: Option<String>,
    pub purpose_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: i64,
    pub e164: String,
    pub provider: Option<String>,
    pub country: Option<String>,
    pub capabilities: Option<String>,
    pub status: NumberStatus,
    pub notes: Option<String>,
    #[serde(flatten)]
    pub tags: NumberTags,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewNumber {
    pub e164: String,
    pub provider: Option<String>,
    pub country: Option<String>,
    pub capabilities: Option<String>,
    pub status: Option<NumberStatus>,
    pub notes: Option<String>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NumberUpdate {
    pub provider: Option<String>,
    pub country: Option<String>,
    pub capabilities: Option<String>,
    pub status: Option<NumberStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreAccount {
    pub id: i64,
    pub platform: String,
    pub store_name: Option<String>,
    pub store_id: Option<String>,
    pub login_email: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewStoreAccount {
    pub platform: String,
    pub store_name: Option<String>,
    pub store_id: Option<String>,
    pub login_email: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub person_id: i64,
    pub number_id: i64,
    pub store_account_id: i64,
    pub purpose: String,
    pub is_active: bool,
    pub created_at: String,
}

/// Assignment joined with the person, number and store it links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentView {
    pub id: i64,
    pub purpose: String,
    pub is_active: bool,
    pub created_at: String,
    pub person_name: String,
    pub person_email: Option<String>,
    pub number_e164: String,
    pub number_provider: Option<String>,
    pub platform: String,
    pub store_name: Option<String>,
    pub store_id: Option<String>,
    pub login_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberUser {
    pub user_id: i64,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub created_at: String,
}

// ── Messages ──────────────────────────────────────────────────────────

/// An inbound SMS as the webhook hands it to storage.
#[derive(Debug, Clone)]
pub struct InboundSms {
    pub provider: String,
    pub provider_message_sid: Option<String>,
    pub to_number: String,
    pub from_number: Option<String>,
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
}

/// Stored message row, OTP unredacted.
#[derive(Debug, Clone)]
pub struct SmsMessage {
    pub id: i64,
    pub provider: String,
    pub provider_message_sid: Option<String>,
    pub to_number: String,
    pub from_number: Option<String>,
    pub body: Option<String>,
    pub received_at: String,
    pub number_id: Option<i64>,
    pub number_e164: Option<String>,
    pub is_read: bool,
    pub otp_code: Option<String>,
    pub tags: NumberTags,
}

impl SmsMessage {
    /// Project the row for a client, hiding the OTP once its window has passed.
    pub fn view(self, now: DateTime<Utc>, window: chrono::Duration) -> MessageView {
        let visible = match DateTime::parse_from_rfc3339(&self.received_at) {
            Ok(ts) => super::phone::otp_is_visible(ts.with_timezone(&Utc), now, window),
            Err(_) => false,
        };
        MessageView {
            id: self.id,
            provider: self.provider,
            provider_message_sid: self.provider_message_sid,
            to_number: self.to_number,
            from_number: self.from_number,
            body: self.body,
            received_at: self.received_at,
            number_id: self.number_id,
            number_e164: self.number_e164,
            is_read: self.is_read,
            otp_code: if visible { self.otp_code } else { None },
            otp_expired: !visible,
            tags: self.tags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub provider: String,
    pub provider_message_sid: Option<String>,
    pub to_number: String,
    pub from_number: Option<String>,
    pub body: Option<String>,
    pub received_at: String,
    pub number_id: Option<i64>,
    pub number_e164: Option<String>,
    pub is_read: bool,
    pub otp_code: Option<String>,
    pub otp_expired: bool,
    #[serde(flatten)]
    pub tags: NumberTags,
}

/// Inbox query. `viewer` restricts results to the viewer's active numbers.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub viewer: Option<i64>,
    pub to_number: Option<String>,
    pub from_number: Option<String>,
    pub store_tag: Option<String>,
    pub purpose_tag: Option<String>,
    pub unread_only: bool,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: i64,
}

// ── Dashboard / events ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DashboardStats {
    pub active_phone_numbers: i64,
    pub sms_today: i64,
    pub otp_today: i64,
    pub unread: i64,
    pub active_users: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppEvent {
    pub id: i64,
    pub level: String,
    pub event_type: String,
    pub message: String,
    pub user_id: Option<i64>,
    pub context: serde_json::Value,
    pub created_at: String,
}

/// Snapshot of the inventory tables, as rows keyed by column name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryExport {
    pub people: Vec<serde_json::Value>,
    pub numbers: Vec<serde_json::Value>,
    pub store_accounts: Vec<serde_json::Value>,
    pub assignments: Vec<serde_json::Value>,
}

//! Number hub: SMS-number inventory, inbound webhook and OTP inbox.
//!
//! ## Overview
//!
//! Admins keep an inventory of phone numbers, the people and store accounts
//! they are used for, and which hub users may read each number's messages.
//! The carrier posts every inbound SMS to the webhook; the hub matches it to a
//! number, extracts an OTP code and pushes a change notice to connected
//! clients, who then read the message through the API under their own
//! permissions.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  form POST  ┌──────────────────────────────────────────────┐
//! │ Carrier  │ ──────────> │  webhook.rs  (signature check, ingest)       │
//! └──────────┘ <── TwiML ─ │    └─ signature.rs  (HMAC-SHA1, URL rebuild) │
//!                          │                                              │
//! ┌──────────┐    HTTP     │  server.rs  (axum Router, ServerConfig)      │
//! │  Client  │ ──────────> │    └─ api.rs  (route handlers, AppState)     │
//! │          │ <────────── │         └─ auth.rs  (argon2, JWT, extractors)│
//! └──────────┘  WebSocket  │  ws.rs  (scoped change notices)              │
//!                          │                                              │
//!                          │  db.rs  (HubDb, DbHandle) ── SQLite          │
//!                          └──────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Shared types: `PhoneNumber`, `SmsMessage`, `User`, filters  |
//! | `phone`  | Number normalization, lookup variants, OTP extraction       |
//!
//! ## Typical Request Flow (inbound SMS)
//!
//! 1. `POST /sms/webhook` → `webhook::sms_webhook()`
//! 2. The signed URL is rebuilt and the `X-Twilio-Signature` checked.
//! 3. `HubDb::insert_inbound()` normalizes `To`, matches the inventory,
//!    extracts the OTP and ignores carrier retries of the same SID.
//! 4. A `MessageReceived` notice goes to admins and the number's users.
//! 5. Clients fetch `GET /api/messages`; codes older than the visibility
//!    window come back redacted.

pub mod api;
pub mod auth;
pub mod db;
pub mod models;
pub mod phone;
pub mod server;
pub mod signature;
pub mod webhook;
pub mod ws;

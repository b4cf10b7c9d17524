use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState};
use super::auth::bootstrap_admin;
use super::db::HubDb;
use super::ws;
use crate::config::HubConfig;

/// Configuration for the hub server.
#[derive(Default)]
pub struct ServerConfig {
    pub hub: HubConfig,
    /// Bind all interfaces and allow any CORS origin.
    pub dev_mode: bool,
}

/// Build the full application router with API, webhook and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = state.config.server.cors_permissive;
    let mut app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the database and create the bootstrap admin if configured.
pub fn open_database(config: &HubConfig) -> Result<HubDb> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = HubDb::new(db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    bootstrap_admin(&db, &config.auth).context("Failed to bootstrap admin user")?;
    Ok(db)
}

/// Start the hub server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let mut hub = config.hub;
    if config.dev_mode {
        hub.server.host = "0.0.0.0".to_string();
        hub.server.cors_permissive = true;
    }
    for warning in hub.validate() {
        warn!("{}", warning);
    }

    let db = open_database(&hub)?;
    let addr = format!("{}:{}", hub.server.host, hub.server.port);
    let db_path = hub.server.db_path.clone();
    let state = Arc::new(AppState::new(db, hub));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %db_path.display(), "numberhub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::models::{EventLevel, MessageFilter, NewNumber, Role};
    use crate::hub::signature::{SIGNATURE_HEADER, compute_signature};
    use crate::hub::webhook::EMPTY_TWIML;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const FORM: &str = "To=%2B1%20555%20000%200001&From=%2B15559990000&Body=Your+code+is+123456&MessageSid=SM1";

    fn form_params() -> Vec<(String, String)> {
        vec![
            ("To".into(), "+1 555 000 0001".into()),
            ("From".into(), "+15559990000".into()),
            ("Body".into(), "Your code is 123456".into()),
            ("MessageSid".into(), "SM1".into()),
        ]
    }

    fn test_state(enforce: bool) -> Arc<AppState> {
        let mut config = HubConfig::default();
        config.webhook.enforce_signature = enforce;
        config.webhook.twilio_auth_token = Some("tok".into());
        let db = HubDb::new_in_memory().unwrap();
        let number = db
            .create_number(&NewNumber {
                e164: "+15550000001".into(),
                ..Default::default()
            })
            .unwrap();
        let user = db.create_user("bob", None, Role::User, "x").unwrap();
        db.assign_number_to_user(user.id, number.id).unwrap();
        Arc::new(AppState::new(db, config))
    }

    fn webhook_request(uri: &str, signature: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("host", "hub.test")
            .header("content-type", "application/x-www-form-urlencoded");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn stored_messages(state: &Arc<AppState>) -> usize {
        let db = state.db.lock_sync().unwrap();
        db.query_messages(&MessageFilter {
            limit: 100,
            ..Default::default()
        })
        .unwrap()
        .len()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_require_auth() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/api/numbers").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_stores_and_notifies() {
        let state = test_state(false);
        let mut rx = state.ws_tx.subscribe();
        let app = build_router(state.clone());

        let resp = app
            .oneshot(webhook_request("/sms/webhook", None, FORM))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/xml");
        assert_eq!(body_text(resp).await, EMPTY_TWIML);

        let db = state.db.lock_sync().unwrap();
        let messages = db
            .query_messages(&MessageFilter {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to_number, "+15550000001");
        assert_eq!(messages[0].otp_code.as_deref(), Some("123456"));
        assert!(messages[0].number_id.is_some());
        let events = db.list_events(10).unwrap();
        assert_eq!(events[0].event_type, "twilio_inbound_sms");
        drop(db);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.user_ids.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&notice.json).unwrap();
        assert_eq!(parsed["type"], "MessageReceived");
        assert_eq!(parsed["data"]["has_otp"], true);
        assert!(parsed["data"].get("body").is_none());
    }

    #[tokio::test]
    async fn test_webhook_duplicate_sid_is_idempotent() {
        let state = test_state(false);
        let app = build_router(state.clone());
        for uri in ["/sms/webhook", "/twilio/sms"] {
            let resp = app
                .clone()
                .oneshot(webhook_request(uri, None, FORM))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert_eq!(stored_messages(&state), 1);
    }

    #[tokio::test]
    async fn test_webhook_valid_signature_accepted() {
        let state = test_state(true);
        let app = build_router(state.clone());
        let sig = compute_signature("tok", "http://hub.test/sms/webhook", &form_params()).unwrap();

        let resp = app
            .oneshot(webhook_request("/sms/webhook", Some(&sig), FORM))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(stored_messages(&state), 1);
    }

    #[tokio::test]
    async fn test_webhook_invalid_signature_rejected() {
        let state = test_state(true);
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(webhook_request("/sms/webhook", Some("bogus"), FORM))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = app
            .oneshot(webhook_request("/sms/webhook", None, FORM))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        assert_eq!(stored_messages(&state), 0);
        let events = state.db.lock_sync().unwrap().list_events(10).unwrap();
        assert_eq!(events[0].event_type, "twilio_signature_invalid");
        assert_eq!(events[0].level, EventLevel::Warning.as_str());
    }

    #[tokio::test]
    async fn test_webhook_rejects_non_form_body() {
        let app = build_router(test_state(false));
        let req = Request::builder()
            .method("POST")
            .uri("/sms/webhook")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_unknown_number_still_stored() {
        let state = test_state(false);
        let app = build_router(state.clone());
        let resp = app
            .oneshot(webhook_request(
                "/sms/webhook",
                None,
                "To=%2B19998887777&Body=hello&MessageSid=SM9",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let db = state.db.lock_sync().unwrap();
        let messages = db
            .query_messages(&MessageFilter {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].number_id.is_none());
        assert!(messages[0].otp_code.is_none());
    }

    fn fail_inserts(state: &Arc<AppState>, table: &str) {
        state
            .db
            .lock_sync()
            .unwrap()
            .execute_raw(&format!(
                "CREATE TRIGGER fail_{table} BEFORE INSERT ON {table} \
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;"
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_storage_failure_still_answers_twiml() {
        let state = test_state(false);
        fail_inserts(&state, "sms_messages");
        let mut rx = state.ws_tx.subscribe();
        let app = build_router(state.clone());

        let resp = app
            .oneshot(webhook_request("/sms/webhook", None, FORM))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, EMPTY_TWIML);

        assert_eq!(stored_messages(&state), 0);
        let events = state.db.lock_sync().unwrap().list_events(10).unwrap();
        assert_eq!(events[0].event_type, "twilio_ingest_error");
        assert_eq!(events[0].level, EventLevel::Error.as_str());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_webhook_answers_when_event_log_is_unwritable() {
        let state = test_state(false);
        fail_inserts(&state, "sms_messages");
        fail_inserts(&state, "app_events");
        let app = build_router(state.clone());

        let resp = app
            .oneshot(webhook_request("/sms/webhook", None, FORM))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, EMPTY_TWIML);
    }

    #[tokio::test]
    async fn test_ws_requires_valid_token() {
        let state = test_state(false);
        let app = build_router(state.clone());
        for uri in ["/ws", "/ws?token=", "/ws?token=garbage"] {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }

        // A valid token gets past auth and fails only on the missing upgrade.
        let bob = state
            .db
            .lock_sync()
            .unwrap()
            .get_user_by_username("bob")
            .unwrap()
            .unwrap();
        let token = state.tokens.issue(bob.id).unwrap();
        let req = Request::builder()
            .uri(format!("/ws?token={token}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_open_database_creates_parent_and_admin() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HubConfig::default();
        config.server.db_path = dir.path().join("nested").join("hub.db");
        config.auth.admin_password = Some("pw".into());

        let db = open_database(&config).unwrap();
        let admin = db.get_user_by_username("admin").unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(config.server.db_path.exists());
    }
}

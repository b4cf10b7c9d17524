//! Inbound SMS webhook.
//!
//! The carrier posts a form for every message. The response is always TwiML
//! (or an empty XML body on rejection) because the carrier retries anything
//! else.

use axum::{
    Form,
    extract::{OriginalUri, State, rejection::FormRejection},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::{error, info, warn};

use super::api::SharedState;
use super::models::{EventLevel, InboundSms};
use super::phone::normalize_phone_number;
use super::signature;
use super::ws::{WsMessage, broadcast_message};

pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

fn xml(status: StatusCode, body: &'static str) -> Response {
    (status, [(CONTENT_TYPE, "text/xml")], body).into_response()
}

fn field<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

/// Write a webhook event; the carrier response does not depend on it.
async fn record_event(
    state: &SharedState,
    level: EventLevel,
    event_type: &'static str,
    message: &'static str,
    context: serde_json::Value,
) {
    let logged = state
        .db
        .call(move |db| db.log_event(level, event_type, message, None, &context))
        .await;
    if let Err(e) = logged {
        warn!(error = %e, event = event_type, "failed to record webhook event");
    }
}

/// Build the storage record from the posted form.
pub fn inbound_from_form(provider: &str, params: &[(String, String)]) -> InboundSms {
    let raw: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    let from = normalize_phone_number(field(params, "From").unwrap_or(""));
    InboundSms {
        provider: provider.to_string(),
        provider_message_sid: field(params, "MessageSid").map(str::to_string),
        to_number: normalize_phone_number(field(params, "To").unwrap_or("")),
        from_number: if from.is_empty() { None } else { Some(from) },
        body: params
            .iter()
            .rev()
            .find(|(k, _)| k == "Body")
            .map(|(_, v)| v.clone()),
        received_at: Utc::now(),
        raw_payload: serde_json::Value::Object(raw),
    }
}

/// `POST /sms/webhook` and `POST /twilio/sms`.
pub async fn sms_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    form: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Response {
    let Form(params) = match form {
        Ok(form) => form,
        Err(rejection) => {
            warn!(error = %rejection, "rejected unparseable webhook form");
            return xml(StatusCode::BAD_REQUEST, "");
        }
    };

    let webhook = &state.config.webhook;
    if webhook.enforce_signature {
        let url = signature::request_url(state.config.server.public_url.as_deref(), &headers, &uri);
        let valid = signature::validate(
            webhook.twilio_auth_token.as_deref(),
            &url,
            &params,
            signature::signature_header(&headers),
        );
        if !valid {
            warn!(url = %url, "webhook signature validation failed");
            let context = serde_json::json!({
                "url": url,
                "has_signature": signature::signature_header(&headers).is_some(),
                "token_configured": webhook.twilio_auth_token.is_some(),
            });
            record_event(
                &state,
                EventLevel::Warning,
                "twilio_signature_invalid",
                "Rejected webhook with an invalid signature",
                context,
            )
            .await;
            return xml(StatusCode::FORBIDDEN, "");
        }
    }

    let sms = inbound_from_form(&webhook.provider, &params);
    let to_number = sms.to_number.clone();
    let from_number = sms.from_number.clone();
    let sid = sms.provider_message_sid.clone();

    let stored = state
        .db
        .call(move |db| {
            let outcome = db.insert_inbound(&sms)?;
            db.log_event(
                EventLevel::Info,
                "twilio_inbound_sms",
                &format!("Inbound SMS to {}", sms.to_number),
                None,
                &serde_json::json!({
                    "message_id": outcome.id,
                    "to": sms.to_number,
                    "from": sms.from_number,
                    "number_id": outcome.number_id,
                    "duplicate": outcome.duplicate,
                }),
            )?;
            let audience = match outcome.number_id {
                Some(number_id) => db.active_user_ids_for_number(number_id)?,
                None => Vec::new(),
            };
            Ok((outcome, audience))
        })
        .await;

    match stored {
        Ok((outcome, audience)) => {
            info!(
                message_id = outcome.id,
                to = %to_number,
                matched = outcome.number_id.is_some(),
                duplicate = outcome.duplicate,
                "stored inbound sms"
            );
            if !outcome.duplicate {
                broadcast_message(
                    &state.ws_tx,
                    &WsMessage::MessageReceived {
                        message_id: outcome.id,
                        number_id: outcome.number_id,
                        to_number,
                        has_otp: outcome.otp_code.is_some(),
                    },
                    audience,
                );
            }
        }
        Err(e) => {
            error!(error = %e, to = %to_number, "failed to store inbound sms");
            let context = serde_json::json!({
                "error": e.to_string(),
                "to": to_number,
                "from": from_number,
                "sid": sid,
            });
            record_event(
                &state,
                EventLevel::Error,
                "twilio_ingest_error",
                "Failed to store inbound SMS",
                context,
            )
            .await;
        }
    }

    xml(StatusCode::OK, EMPTY_TWIML)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_inbound_from_form_normalizes_numbers() {
        let sms = inbound_from_form(
            "twilio",
            &form(&[
                ("To", "whatsapp:+1 555 000 0001"),
                ("From", "0044 20 7946 0000"),
                ("Body", "  Code 1234  "),
                ("MessageSid", "SM1"),
            ]),
        );
        assert_eq!(sms.to_number, "+15550000001");
        assert_eq!(sms.from_number.as_deref(), Some("+442079460000"));
        assert_eq!(sms.body.as_deref(), Some("  Code 1234  "));
        assert_eq!(sms.provider_message_sid.as_deref(), Some("SM1"));
        assert_eq!(sms.raw_payload["MessageSid"], "SM1");
    }

    #[test]
    fn test_inbound_from_form_blank_fields() {
        let sms = inbound_from_form("twilio", &form(&[("To", ""), ("From", " "), ("MessageSid", "")]));
        assert_eq!(sms.to_number, "");
        assert!(sms.from_number.is_none());
        assert!(sms.provider_message_sid.is_none());
        assert!(sms.body.is_none());
    }
}

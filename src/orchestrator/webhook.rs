//! Best-effort webhook delivery. Failures are returned for logging; there
//! are no retries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use crate::analysis::types::{ConversationAnalysis, ProcessingResult};
use crate::error::WebhookError;
use crate::tenant::model::WebhookSettings;

/// Header carrying `sha256=<hex hmac>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Signature-256";

type HmacSha256 = Hmac<Sha256>;

/// JSON body posted to a tenant webhook. Every key, nested ones included,
/// is camelCase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub conversation_id: String,
    pub message_id: Uuid,
    pub results: Option<Value>,
    pub analysis: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn new(
        event_type: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: Uuid,
        results: Option<&ProcessingResult>,
        analysis: Option<&ConversationAnalysis>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            conversation_id: conversation_id.into(),
            message_id,
            results: results.and_then(camel_case_json),
            analysis: analysis.and_then(camel_case_json),
            timestamp,
        }
    }
}

fn camel_case_json<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok().map(camel_case_keys)
}

fn camel_case_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (camel_case(&key), camel_case_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(camel_case_keys).collect()),
        other => other,
    }
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[async_trait]
pub trait WebhookDelivery: Send + Sync {
    async fn deliver(
        &self,
        target: &WebhookSettings,
        payload: &WebhookPayload,
    ) -> Result<(), WebhookError>;
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Posts JSON payloads with reqwest.
pub struct HttpWebhookDelivery {
    client: reqwest::Client,
}

impl HttpWebhookDelivery {
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::RequestFailed {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookDelivery for HttpWebhookDelivery {
    async fn deliver(
        &self,
        target: &WebhookSettings,
        payload: &WebhookPayload,
    ) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(payload)?;
        let mut request = self
            .client
            .post(&target.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &target.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret.expose_secret(), &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| WebhookError::RequestFailed {
                url: target.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::BadStatus {
                url: target.url.clone(),
                status: status.as_u16(),
            });
        }
        debug!(url = %target.url, event = %payload.event_type, "Webhook delivered");
        Ok(())
    }
}

//! Webhook channel: JSON POST/PUT to user-configured endpoints.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::db::models::{GroundingSource, WebhookMethod};
use crate::error::AppResult;
use crate::services::notifications::SendOutcome;

/// Delivered within 30 s or not at all; consumers deduplicate on
/// `execution_id`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 3;

/// The outbound body. Field set and names are a compatibility surface —
/// do not reorder or rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    pub triggered_at: String,
    pub notification: String,
    pub sources: Vec<GroundingSource>,
    pub confidence: Option<i64>,
}

#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl std::fmt::Debug for WebhookSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSender").finish_non_exhaustive()
    }
}

impl WebhookSender {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    /// Fire one request and classify the result for the retry policy.
    pub async fn send(
        &self,
        url: &str,
        method: WebhookMethod,
        headers: &HashMap<String, String>,
        payload: &WebhookPayload,
    ) -> SendOutcome {
        let header_map = match build_headers(headers) {
            Ok(map) => map,
            Err(e) => {
                return SendOutcome::Permanent {
                    http_status: None,
                    error: e,
                }
            }
        };

        let builder = match method {
            WebhookMethod::Post => self.client.post(url),
            WebhookMethod::Put => self.client.put(url),
        };

        let response = builder.headers(header_map).json(payload).send().await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                classify_status(status)
            }
            Err(e) => SendOutcome::Transient {
                http_status: None,
                error: e.to_string(),
            },
        }
    }
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name '{name}': {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid header value for '{name:?}': {e}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// 2xx delivered; 408/429 and every 5xx transient; any other 4xx permanent.
fn classify_status(status: u16) -> SendOutcome {
    let http_status = Some(status as i64);
    match status {
        200..=299 => SendOutcome::Delivered { http_status },
        408 | 429 => SendOutcome::Transient {
            http_status,
            error: format!("webhook endpoint returned {status}"),
        },
        400..=499 => SendOutcome::Permanent {
            http_status,
            error: format!("webhook endpoint returned {status}"),
        },
        _ => SendOutcome::Transient {
            http_status,
            error: format!("webhook endpoint returned {status}"),
        },
    }
}

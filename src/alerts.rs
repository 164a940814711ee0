//! Autonomous alert escalation for critical safety flags.
//!
//! Every dispatched alert emits one structured log line; CRITICAL alerts are
//! additionally POSTed to the configured webhook (Slack, PagerDuty, any HTTP
//! listener). Webhook delivery is best-effort: a failed POST is logged and
//! never blocks or fails the pipeline.

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{now_iso, SafetyFlag, Severity};

/// Outbound alert payload, shaped for generic webhook listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub event: &'static str,
    pub timestamp: String,
    pub document_id: String,
    pub filename: Option<String>,
    pub flag_id: i64,
    pub kind: String,
    pub severity: Severity,
    pub detail: String,
    pub source: &'static str,
}

impl AlertPayload {
    pub fn from_flag(flag: &SafetyFlag) -> Self {
        Self {
            event: "BIOVAULT_SAFETY_ALERT",
            timestamp: now_iso(),
            document_id: flag.document_id.clone(),
            filename: flag.filename.clone(),
            flag_id: flag.id,
            kind: flag.kind.as_str().to_string(),
            severity: flag.severity,
            detail: flag.detail.clone(),
            source: "biovault-agent",
        }
    }
}

/// Delivery seam. The production impl POSTs over HTTP; tests count calls.
pub trait WebhookSender: Send + Sync {
    fn send(&self, payload: &AlertPayload) -> Result<(), String>;
}

pub struct HttpWebhookSender {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpWebhookSender {
    pub fn new(url: String) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| format!("webhook client init: {e}"))?;
        Ok(Self { client, url })
    }
}

impl WebhookSender for HttpWebhookSender {
    fn send(&self, payload: &AlertPayload) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .map_err(|e| format!("webhook POST failed: {e}"))?;
        let status = response.status();
        if status.is_success() {
            info!(url = %self.url, %status, "webhook posted");
            Ok(())
        } else {
            Err(format!("webhook returned HTTP {status}"))
        }
    }
}

/// Escalation policy: log every flag, webhook only the critical ones.
pub struct AlertDispatcher {
    sender: Option<Box<dyn WebhookSender>>,
}

impl AlertDispatcher {
    pub fn new(sender: Option<Box<dyn WebhookSender>>) -> Self {
        Self { sender }
    }

    pub fn from_webhook_url(url: Option<&str>) -> Self {
        let sender = url.and_then(|url| match HttpWebhookSender::new(url.to_string()) {
            Ok(sender) => Some(Box::new(sender) as Box<dyn WebhookSender>),
            Err(e) => {
                warn!(error = %e, "webhook disabled");
                None
            }
        });
        Self { sender }
    }

    /// Returns true when a webhook delivery was attempted.
    pub fn dispatch(&self, flag: &SafetyFlag) -> bool {
        let payload = AlertPayload::from_flag(flag);
        warn!(
            alert = %serde_json::to_string(&payload).unwrap_or_default(),
            "AUTONOMOUS_ALERT"
        );

        if flag.severity != Severity::Critical {
            return false;
        }
        let Some(sender) = &self.sender else {
            return false;
        };
        if let Err(e) = sender.send(&payload) {
            warn!(error = %e, flag_id = flag.id, "webhook delivery failed (non-fatal)");
        }
        true
    }
}

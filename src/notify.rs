//! Outbound notifications (verification codes, poll results).
//!
//! Delivery is best effort. Callers never hold a database transaction open
//! across a send, and a failed send never undoes the state change it reports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::WhatsAppConfig;
use crate::models::Purpose;
use crate::phone;

const GRAPH_API: &str = "https://graph.facebook.com/v24.0";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification rejected with status {0}")]
    Rejected(StatusCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    VerificationCode { code: String, purpose: Purpose },
    PollResult { question: String, won: bool },
}

impl Notification {
    pub fn text(&self) -> String {
        match self {
            Notification::VerificationCode { code, .. } => {
                format!("*{code}* is your verification code.")
            }
            Notification::PollResult {
                question,
                won: true,
            } => format!(
                "Congratulations! You have been selected as the winner of the poll \"{question}\". We will contact you soon."
            ),
            Notification::PollResult {
                question,
                won: false,
            } => format!("The poll \"{question}\" has ended. Thank you for taking part!"),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, phone: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sends through the WhatsApp Cloud API: codes use the approved
/// `verification_code` template, results go out as plain text.
pub struct WhatsAppSink {
    client: Client,
    endpoint: String,
    access_token: String,
}

impl WhatsAppSink {
    pub fn new(config: &WhatsAppConfig) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{GRAPH_API}/{}/messages", config.phone_number_id),
            access_token: config.access_token.clone(),
        })
    }

    fn payload(to: &str, notification: &Notification) -> Value {
        match notification {
            Notification::VerificationCode { code, .. } => json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "template",
                "template": {
                    "name": "verification_code",
                    "language": { "code": "en_US" },
                    "components": [
                        {
                            "type": "body",
                            "parameters": [{ "type": "text", "text": code }]
                        },
                        {
                            "type": "button",
                            "sub_type": "url",
                            "index": 0,
                            "parameters": [{ "type": "text", "text": code }]
                        }
                    ]
                }
            }),
            Notification::PollResult { .. } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": { "preview_url": false, "body": notification.text() }
            }),
        }
    }
}

#[async_trait]
impl NotificationSink for WhatsAppSink {
    async fn send(&self, phone_number: &str, notification: &Notification) -> Result<(), NotifyError> {
        // Identities are stored in international form, which is what the API expects.
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&Self::payload(phone_number, notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(phone = %phone::mask(phone_number), %status, "WhatsApp send failed");
            return Err(NotifyError::Rejected(status));
        }

        info!(phone = %phone::mask(phone_number), "WhatsApp message sent");
        Ok(())
    }
}

/// Development sink: records the send in the log and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, phone_number: &str, notification: &Notification) -> Result<(), NotifyError> {
        match notification {
            Notification::VerificationCode { purpose, .. } => {
                info!(phone = %phone::mask(phone_number), %purpose, "Verification code issued (log sink)");
            }
            Notification::PollResult { won, .. } => {
                info!(phone = %phone::mask(phone_number), won, "Poll result notification (log sink)");
            }
        }
        Ok(())
    }
}

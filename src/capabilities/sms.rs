use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SosError;
use crate::model::{PhoneNumber, UnixTimeMs};
use crate::notifier::SosDispatch;

/// Upper bound for a concatenated SMS body.
pub const MAX_MESSAGE_LENGTH: usize = 1_600;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SmsReceipt {
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmsError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("connection to SMS gateway failed: {message}")]
    Connection { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },
}

impl SmsError {
    /// Maps a non-success gateway response, pulling the provider's message out of a
    /// JSON error body when there is one.
    #[must_use]
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        #[derive(Deserialize)]
        struct GatewayErrorBody {
            message: Option<String>,
            error: Option<String>,
        }

        let message = serde_json::from_slice::<GatewayErrorBody>(body)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or_else(|| match status {
                401 | 403 => "gateway rejected credentials".to_string(),
                429 => "gateway rate limit exceeded".to_string(),
                500..=599 => "gateway unavailable".to_string(),
                _ => "request rejected".to_string(),
            });
        Self::HttpStatus { status, message }
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if (400..500).contains(status))
    }
}

/// Outbound text messages. Implementations do not retry; the monitor bounds every call
/// with its own timeout.
#[async_trait::async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, to: &PhoneNumber, message: &str) -> Result<SmsReceipt, SmsError>;
}

pub fn validate_message(message: &str) -> Result<(), SmsError> {
    if message.trim().is_empty() {
        return Err(SmsError::InvalidRequest {
            reason: "message cannot be empty".into(),
        });
    }
    if message.len() > MAX_MESSAGE_LENGTH {
        return Err(SmsError::InvalidRequest {
            reason: format!("message exceeds maximum length of {MAX_MESSAGE_LENGTH} bytes"),
        });
    }
    Ok(())
}

// --- SMS capability ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SmsOperation {
    Send(SosDispatch),
}

/// How a send ended, stamped with the shell's clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SmsDelivery {
    pub result: Result<SmsReceipt, SosError>,
    pub at: UnixTimeMs,
}

impl Operation for SmsOperation {
    type Output = SmsDelivery;
}

pub struct Sms<Ev> {
    context: CapabilityContext<SmsOperation, Ev>,
}

impl<Ev> Capability<Ev> for Sms<Ev> {
    type Operation = SmsOperation;
    type MappedSelf<MappedEv> = Sms<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Sms::new(self.context.map_event(f))
    }
}

impl<Ev> Sms<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<SmsOperation, Ev>) -> Self {
        Self { context }
    }

    /// Hands the message to the shell; `callback` turns the outcome into an event.
    pub fn send<F>(&self, dispatch: SosDispatch, callback: F)
    where
        F: FnOnce(SmsDelivery) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let delivery = context.request_from_shell(SmsOperation::Send(dispatch)).await;
            context.update_app(callback(delivery));
        });
    }
}

#[cfg(feature = "http-sms")]
pub use http_gateway::HttpSmsGateway;

#[cfg(feature = "http-sms")]
mod http_gateway {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Serialize};
    use tracing::{info, instrument, warn};
    use url::Url;

    use super::{validate_message, SmsError, SmsGateway, SmsReceipt};
    use crate::config::{ConfigError, SmsGatewayConfig};
    use crate::model::PhoneNumber;

    #[derive(Serialize)]
    struct OutgoingSms<'a> {
        to: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<&'a str>,
        body: &'a str,
    }

    #[derive(Deserialize)]
    struct GatewayAccepted {
        #[serde(alias = "sid", alias = "messageId")]
        id: Option<String>,
    }

    /// JSON-over-HTTPS SMS gateway: `POST {endpoint}` with a bearer token.
    pub struct HttpSmsGateway {
        client: reqwest::Client,
        endpoint: Url,
        api_token: SecretString,
        sender_id: Option<String>,
    }

    impl HttpSmsGateway {
        pub fn new(config: &SmsGatewayConfig) -> Result<Self, ConfigError> {
            let endpoint = config.validate()?;
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| ConfigError::Validation(format!("HTTP client: {e}")))?;
            Ok(Self {
                client,
                endpoint,
                api_token: config.api_token.clone(),
                sender_id: config.sender_id.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl SmsGateway for HttpSmsGateway {
        #[instrument(skip(self, message), fields(endpoint = %self.endpoint.host_str().unwrap_or_default()))]
        async fn send(&self, to: &PhoneNumber, message: &str) -> Result<SmsReceipt, SmsError> {
            validate_message(message)?;
            let body = OutgoingSms {
                to: to.as_str(),
                from: self.sender_id.as_deref(),
                body: message,
            };

            let response = self
                .client
                .post(self.endpoint.clone())
                .bearer_auth(self.api_token.expose_secret())
                .json(&body)
                .send()
                .await
                .map_err(|e| SmsError::Connection {
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let bytes = response.bytes().await.unwrap_or_default();
                let error = SmsError::from_status(status.as_u16(), &bytes);
                warn!(status = status.as_u16(), "SMS gateway rejected message");
                return Err(error);
            }

            // The body only carries the provider id; an unreadable one is not a failure.
            let provider_id = response
                .json::<GatewayAccepted>()
                .await
                .ok()
                .and_then(|accepted| accepted.id);
            info!(?provider_id, "SMS accepted by gateway");
            Ok(SmsReceipt { provider_id })
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};
use url::Url;

use crate::capabilities::SmsReceipt;
use crate::error::SosError;
use crate::geo::{maps_link, Coordinate};
use crate::model::{Contact, PhoneNumber};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SosReason {
    NoResponse,
    UserRequestedHelp,
    ManualSos,
    CountdownUnavailable,
}

impl SosReason {
    fn describe(self) -> &'static str {
        match self {
            Self::NoResponse => "they did not answer a safety check",
            Self::UserRequestedHelp => "they answered a safety check saying they need help",
            Self::ManualSos => "they pressed the SOS button",
            Self::CountdownUnavailable => "a safety check could not be completed",
        }
    }
}

impl fmt::Display for SosReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoResponse => "no response",
            Self::UserRequestedHelp => "user requested help",
            Self::ManualSos => "manual SOS",
            Self::CountdownUnavailable => "countdown unavailable",
        })
    }
}

/// A composed SOS text ready to hand to the SMS gateway.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SosDispatch {
    pub attempt: u32,
    pub recipient: PhoneNumber,
    pub message: String,
    pub reason: SosReason,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeliveryState {
    NotAttempted,
    InFlight { attempt: u32 },
    Delivered { attempt: u32, receipt: SmsReceipt },
    Failed { attempt: u32, error: SosError },
}

/// At-most-once SOS per session.
///
/// The `help_sent` latch is set when a message is handed out for sending, before the
/// network call resolves, and is never cleared for the life of the session. A failed
/// delivery can only be re-sent through [`EmergencyNotifier::retry`].
#[derive(Debug, Clone)]
pub struct EmergencyNotifier {
    maps_base: Option<Url>,
    help_sent: bool,
    delivery: DeliveryState,
    dispatched: Option<SosDispatch>,
}

impl EmergencyNotifier {
    #[must_use]
    pub fn new(maps_base: Option<Url>) -> Self {
        Self {
            maps_base,
            help_sent: false,
            delivery: DeliveryState::NotAttempted,
            dispatched: None,
        }
    }

    pub fn send_sos(
        &mut self,
        contact: &Contact,
        last_known: Option<Coordinate>,
        reason: SosReason,
    ) -> Result<SosDispatch, SosError> {
        if self.help_sent {
            debug!(%reason, "SOS suppressed, already sent");
            return Err(SosError::AlreadySent);
        }
        let Some(recipient) = contact.phone.clone() else {
            warn!(%reason, "SOS requested but contact has no phone number");
            return Err(SosError::NoRecipient);
        };

        self.help_sent = true;
        let dispatch = SosDispatch {
            attempt: 1,
            recipient,
            message: compose_message(self.maps_base.as_ref(), contact, reason, last_known),
            reason,
        };
        self.delivery = DeliveryState::InFlight { attempt: 1 };
        self.dispatched = Some(dispatch.clone());
        Ok(dispatch)
    }

    /// Applies the gateway result for `attempt`. Results of superseded attempts are ignored.
    pub fn record_delivery(&mut self, attempt: u32, result: Result<SmsReceipt, SosError>) -> bool {
        if self.delivery != (DeliveryState::InFlight { attempt }) {
            return false;
        }
        self.delivery = match result {
            Ok(receipt) => DeliveryState::Delivered { attempt, receipt },
            Err(error) => DeliveryState::Failed { attempt, error },
        };
        true
    }

    /// Manual retry of a failed delivery. Never called automatically.
    pub fn retry(&mut self) -> Result<SosDispatch, SosError> {
        let attempt = match &self.delivery {
            DeliveryState::Failed { attempt, .. } => attempt + 1,
            DeliveryState::NotAttempted => return Err(SosError::NothingToRetry),
            DeliveryState::InFlight { .. } | DeliveryState::Delivered { .. } => {
                return Err(SosError::AlreadySent)
            }
        };
        let Some(previous) = self.dispatched.as_mut() else {
            return Err(SosError::NothingToRetry);
        };
        previous.attempt = attempt;
        self.delivery = DeliveryState::InFlight { attempt };
        Ok(previous.clone())
    }

    #[must_use]
    pub const fn help_sent(&self) -> bool {
        self.help_sent
    }

    #[must_use]
    pub const fn delivery(&self) -> &DeliveryState {
        &self.delivery
    }
}

fn compose_message(
    maps_base: Option<&Url>,
    contact: &Contact,
    reason: SosReason,
    last_known: Option<Coordinate>,
) -> String {
    let location = match (last_known, maps_base) {
        (Some(at), Some(base)) => format!(
            "Last known location: {:.6}, {:.6} {}",
            at.lat(),
            at.lng(),
            maps_link(base, at)
        ),
        (Some(at), None) => format!("Last known location: {:.6}, {:.6}", at.lat(), at.lng()),
        (None, _) => "Their location is currently unavailable.".to_string(),
    };
    format!(
        "SOS: Hi {}, the person you are walking with may need help ({}). {}",
        contact.name,
        reason.describe(),
        location
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> EmergencyNotifier {
        EmergencyNotifier::new(Some(Url::parse(crate::DEFAULT_MAPS_BASE_URL).unwrap()))
    }

    fn ann() -> Contact {
        Contact::new("Ann", Some("+15550100")).unwrap()
    }

    fn here() -> Option<Coordinate> {
        Some(Coordinate::new(51.5074, -0.1278).unwrap())
    }

    fn receipt() -> SmsReceipt {
        SmsReceipt { provider_id: Some("msg-1".into()) }
    }

    #[test]
    fn test_first_sos_dispatches_and_latches() {
        let mut n = notifier();
        let dispatch = n.send_sos(&ann(), here(), SosReason::NoResponse).unwrap();
        assert!(n.help_sent());
        assert_eq!(dispatch.attempt, 1);
        assert_eq!(dispatch.recipient.as_str(), "+15550100");
        assert!(dispatch.message.starts_with("SOS: Hi Ann"));
        assert!(dispatch.message.contains("51.507400, -0.127800"));
        assert!(dispatch.message.contains("https://www.google.com/maps/search/?api=1&query="));
        assert_eq!(n.delivery(), &DeliveryState::InFlight { attempt: 1 });
    }

    #[test]
    fn test_second_sos_is_already_sent() {
        let mut n = notifier();
        n.send_sos(&ann(), here(), SosReason::NoResponse).unwrap();
        assert_eq!(
            n.send_sos(&ann(), here(), SosReason::ManualSos),
            Err(SosError::AlreadySent)
        );
    }

    #[test]
    fn test_missing_phone_does_not_latch() {
        let mut n = notifier();
        let no_phone = Contact::new("Ann", None).unwrap();
        assert_eq!(
            n.send_sos(&no_phone, here(), SosReason::ManualSos),
            Err(SosError::NoRecipient)
        );
        assert!(!n.help_sent());
        assert!(n.send_sos(&ann(), here(), SosReason::ManualSos).is_ok());
    }

    #[test]
    fn test_unknown_location_message() {
        let mut n = notifier();
        let dispatch = n.send_sos(&ann(), None, SosReason::ManualSos).unwrap();
        assert!(dispatch.message.contains("location is currently unavailable"));
    }

    #[test]
    fn test_coordinates_without_maps_link() {
        let mut n = EmergencyNotifier::new(None);
        let dispatch = n.send_sos(&ann(), here(), SosReason::ManualSos).unwrap();
        assert!(dispatch.message.ends_with("Last known location: 51.507400, -0.127800"));
    }

    #[test]
    fn test_failure_keeps_latch() {
        let mut n = notifier();
        n.send_sos(&ann(), here(), SosReason::NoResponse).unwrap();
        assert!(n.record_delivery(1, Err(SosError::SendFailed("503".into()))));
        assert!(n.help_sent());
        assert_eq!(
            n.send_sos(&ann(), here(), SosReason::ManualSos),
            Err(SosError::AlreadySent)
        );
    }

    #[test]
    fn test_retry_only_after_failure() {
        let mut n = notifier();
        assert_eq!(n.retry(), Err(SosError::NothingToRetry));

        let first = n.send_sos(&ann(), here(), SosReason::NoResponse).unwrap();
        assert_eq!(n.retry(), Err(SosError::AlreadySent));

        n.record_delivery(1, Err(SosError::Timeout { timeout_ms: 15_000 }));
        let second = n.retry().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.message, first.message);
        assert_eq!(n.delivery(), &DeliveryState::InFlight { attempt: 2 });

        n.record_delivery(2, Ok(receipt()));
        assert_eq!(n.retry(), Err(SosError::AlreadySent));
    }

    #[test]
    fn test_stale_delivery_result_ignored() {
        let mut n = notifier();
        n.send_sos(&ann(), here(), SosReason::NoResponse).unwrap();
        n.record_delivery(1, Err(SosError::SendFailed("boom".into())));
        n.retry().unwrap();
        assert!(!n.record_delivery(1, Ok(receipt())));
        assert_eq!(n.delivery(), &DeliveryState::InFlight { attempt: 2 });
    }
}

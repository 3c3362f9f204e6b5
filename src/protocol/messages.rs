//! Inbound request and outbound result envelopes.
//!
//! Every inbound message carries a correlation id; the coordinator answers
//! with at most one [`ResultEnvelope`] bearing the same id. Page requests
//! also carry the requesting origin and the context the answer goes back to.
//!
//! ```json
//! {"type":"send-tokens","correlation_id":"7","origin":"https://shop.example",
//!  "source_context":"tab-12","coin_id":"X","amount":10,"recipient":"bob"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{SendPayload, SignMessagePayload};
use crate::signer::UnsignedEvent;
use crate::types::{ErrorKind, UserAction, VestibuleError};

/// Context id used for messages that do not name one
pub const DEFAULT_CONTEXT: &str = "native";

/// A request from a page context or the approval surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub correlation_id: String,

    /// Requesting origin (page requests only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Context the result is routed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,

    #[serde(flatten)]
    pub request: Request,
}

impl InboundMessage {
    pub fn context(&self) -> &str {
        self.source_context.as_deref().unwrap_or(DEFAULT_CONTEXT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    // Page requests
    Connect,
    Disconnect,
    GetActiveIdentity,
    GetBalances,
    SendTokens(SendPayload),
    SignMessage(SignMessagePayload),
    SignProtocolEvent { event: UnsignedEvent },
    ResolveName { name: String },
    CheckNameAvailable { name: String },
    GetNameBinding,

    // Approval surface commands
    Unlock { secret: String },
    Lock,
    ListPending,
    Approve { request_id: String },
    Reject { request_id: String },
    ClaimName { name: String },
    ReceiveTokens { payload: String },
    TokenHealth,
}

impl Request {
    /// Wire name of the request type
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::GetActiveIdentity => "get-active-identity",
            Self::GetBalances => "get-balances",
            Self::SendTokens(_) => "send-tokens",
            Self::SignMessage(_) => "sign-message",
            Self::SignProtocolEvent { .. } => "sign-protocol-event",
            Self::ResolveName { .. } => "resolve-name",
            Self::CheckNameAvailable { .. } => "check-name-available",
            Self::GetNameBinding => "get-name-binding",
            Self::Unlock { .. } => "unlock",
            Self::Lock => "lock",
            Self::ListPending => "list-pending",
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::ClaimName { .. } => "claim-name",
            Self::ReceiveTokens { .. } => "receive-tokens",
            Self::TokenHealth => "token-health",
        }
    }

    /// Whether the request comes from an untrusted page (and needs an origin)
    pub fn is_page_request(&self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::Disconnect
                | Self::GetActiveIdentity
                | Self::GetBalances
                | Self::SendTokens(_)
                | Self::SignMessage(_)
                | Self::SignProtocolEvent { .. }
                | Self::ResolveName { .. }
                | Self::CheckNameAvailable { .. }
                | Self::GetNameBinding
        )
    }
}

/// Serialized error carried in a result envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub user_action: UserAction,
}

impl From<&VestibuleError> for ErrorBody {
    fn from(err: &VestibuleError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            user_action: err.user_action(),
        }
    }
}

/// The one answer to an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResultEnvelope {
    pub fn ok(correlation_id: impl Into<String>, result: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(correlation_id: impl Into<String>, err: &VestibuleError) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: None,
            error: Some(err.into()),
        }
    }

    /// The user declined the request
    pub fn rejected(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: None,
            error: Some(ErrorBody {
                kind: ErrorKind::UserRejected,
                message: "Request rejected by user".into(),
                user_action: UserAction::Dismiss,
            }),
        }
    }

    pub fn from_result(correlation_id: impl Into<String>, result: crate::types::Result<Value>) -> Self {
        match result {
            Ok(value) => Self::ok(correlation_id, value),
            Err(e) => Self::err(correlation_id, &e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_page_request() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "type": "send-tokens",
            "correlation_id": "7",
            "origin": "https://shop.example",
            "source_context": "tab-12",
            "coin_id": "X",
            "amount": 10,
            "recipient": "bob"
        }))
        .unwrap();

        assert_eq!(msg.context(), "tab-12");
        assert!(msg.request.is_page_request());
        match msg.request {
            Request::SendTokens(send) => assert_eq!(send.amount, 10),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_parse_surface_command() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "type": "approve",
            "correlation_id": "s1",
            "request_id": "abc"
        }))
        .unwrap();
        assert_eq!(msg.context(), DEFAULT_CONTEXT);
        assert_eq!(msg.request.name(), "approve");
        assert!(!msg.request.is_page_request());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed = serde_json::from_value::<InboundMessage>(json!({
            "type": "format-disk",
            "correlation_id": "x"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_error_envelope_shape() {
        let envelope = ResultEnvelope::err(
            "r1",
            &VestibuleError::ApprovedButFailed {
                request_id: "r1".into(),
                reason: "engine offline".into(),
            },
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["kind"], "approved_but_failed");
        assert_eq!(json["error"]["user_action"], "check_settlement");
        assert!(json.get("result").is_none());

        let rejected = ResultEnvelope::rejected("r2");
        assert_eq!(rejected.error_kind(), Some(ErrorKind::UserRejected));
    }
}

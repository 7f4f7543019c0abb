//! Session message types.
//!
//! Inbound JSON is decoded once, at the transport boundary, into
//! [`InboundMessage`]; the dispatcher only matches on variants. Outbound
//! messages are either responses echoing a `requestID` or events carrying
//! `eventName`, `type: "event"` and a `transactionID`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    Authentication {
        #[serde(rename = "requestID")]
        request_id: String,
        payload: AuthPayload,
    },
    NewTransaction {
        #[serde(rename = "requestID")]
        request_id: String,
        payload: NewTransactionPayload,
    },
    ListApps {
        #[serde(rename = "requestID")]
        request_id: String,
    },
    LaunchFileInApp {
        #[serde(rename = "transactionID")]
        transaction_id: String,
        payload: LaunchPayload,
    },
    UploadFileInApp {
        #[serde(rename = "transactionID")]
        transaction_id: String,
        payload: UploadPayload,
    },
    RequestUploadToken {
        #[serde(rename = "transactionID")]
        transaction_id: String,
        payload: UploadTokenPayload,
    },
    #[serde(other)]
    Unsupported,
}

impl InboundMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    /// Self-hosted site, checked against the trust store.
    Server,
    /// Cloud site; trust is delegated to the bearer token's issuer.
    #[serde(alias = "cloud")]
    Jwt,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthPayload {
    #[serde(rename = "type")]
    pub provider: AuthProvider,
    #[serde(default)]
    pub payload: SiteInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SiteInfo {
    #[serde(rename = "siteTitle", default)]
    pub site_title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewTransactionPayload {
    #[serde(rename = "transactionType")]
    pub transaction_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LaunchPayload {
    #[serde(rename = "applicationID", default)]
    pub application_id: String,
    #[serde(rename = "fileURL")]
    pub file_url: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "uploadUrl", default)]
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadPayload {
    #[serde(rename = "fileID", default)]
    pub file_id: Value,
    #[serde(rename = "uploadUrl", default)]
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadTokenPayload {
    #[serde(alias = "uploadToken")]
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKind {
    AuthenticationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    FileDownloadStart,
    FileDownloaded,
    FileChangeDetected,
    FileDirectUploadStart,
    FileDirectUploadProgress,
    FileDirectUploadEnd,
    FileDirectUploadError,
    RequestUploadToken,
    FileUploadStart,
    FileUploadProgress,
    FileUploaded,
    FileUploadError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResponseKind>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "eventName")]
    pub event_name: EventName,
    #[serde(rename = "type")]
    kind: &'static str,
    pub payload: Value,
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
}

impl Event {
    pub fn new(event_name: EventName, transaction_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name,
            kind: "event",
            payload,
            transaction_id: transaction_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Response(Response),
    Event(Event),
}

impl OutboundMessage {
    pub fn response(request_id: impl Into<String>, payload: Value) -> Self {
        Self::Response(Response {
            request_id: request_id.into(),
            kind: None,
            payload,
        })
    }

    pub fn auth_status(request_id: impl Into<String>, status: AuthStatus) -> Self {
        Self::Response(Response {
            request_id: request_id.into(),
            kind: Some(ResponseKind::AuthenticationStatus),
            payload: serde_json::json!(status),
        })
    }

    pub fn event(name: EventName, transaction_id: impl Into<String>, payload: Value) -> Self {
        Self::Event(Event::new(name, transaction_id, payload))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

//! Request/response shapes of the collaboration surface.
//!
//! All payloads are JSON with camelCase field names:
//!
//! ```text
//! GetDocument {docName}                          → {doc, version, managerId}
//! PushEvents  {docName, version, steps, clientID} → {version, managerId}
//! PullEvents  {docName, version, clientID}        → {steps, version, managerId}
//! ```
//!
//! Responses travel in a uniform envelope so the transport never throws:
//!
//! ```text
//! {"status": "ok",    "body": <response>}
//! {"status": "error", "body": {"errorCode": 409, "message": "..."}}
//! ```
//!
//! Over WebSocket, requests are wrapped in a [`ClientFrame`] carrying a
//! request id, and the server answers with [`ServerFrame::Response`] or pushes
//! [`ServerFrame::Bump`] notifications.

use scribe_core::{Document, Step};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{CollabError, ErrorCode};

/// A step as stored in the instance log and returned by `PullEvents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct StepRecord<S: Step> {
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Version the document reached by applying this step
    pub version: u64,
    pub step: S,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDocumentRequest {
    pub doc_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct PushEventsRequest<S: Step> {
    pub doc_name: String,
    /// Version the steps were created against
    pub version: u64,
    pub steps: Vec<S>,
    #[serde(rename = "clientID")]
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullEventsRequest {
    pub doc_name: String,
    pub version: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
}

/// Any request the manager understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", bound = "")]
pub enum CollabRequest<S: Step> {
    GetDocument(GetDocumentRequest),
    PushEvents(PushEventsRequest<S>),
    PullEvents(PullEventsRequest),
}

impl<S: Step> CollabRequest<S> {
    pub fn doc_name(&self) -> &str {
        match self {
            Self::GetDocument(req) => &req.doc_name,
            Self::PushEvents(req) => &req.doc_name,
            Self::PullEvents(req) => &req.doc_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct GetDocumentResponse<D: Document> {
    pub doc: D,
    pub version: u64,
    pub manager_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEventsResponse {
    pub version: u64,
    pub manager_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct PullEventsResponse<S: Step> {
    pub steps: Vec<StepRecord<S>>,
    pub version: u64,
    pub manager_id: Uuid,
}

/// Successful body of any request, serialized without a tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, bound = "")]
pub enum CollabReply<S: Step> {
    Document(GetDocumentResponse<S::Doc>),
    Pushed(PushEventsResponse),
    Pulled(PullEventsResponse<S>),
}

/// Error branch of the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl From<CollabError> for ErrorBody {
    fn from(err: CollabError) -> Self {
        Self {
            error_code: err.error_code,
            message: err.message(),
            from: err.from,
        }
    }
}

impl From<ErrorBody> for CollabError {
    fn from(body: ErrorBody) -> Self {
        Self {
            error_code: body.error_code,
            body: Value::String(body.message),
            from: body.from,
        }
    }
}

/// Uniform response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "lowercase")]
pub enum CollabResponse<T> {
    Ok(T),
    Error(ErrorBody),
}

impl<T> CollabResponse<T> {
    pub fn into_result(self) -> Result<T, CollabError> {
        match self {
            Self::Ok(body) => Ok(body),
            Self::Error(body) => Err(body.into()),
        }
    }
}

impl<T> From<Result<T, CollabError>> for CollabResponse<T> {
    fn from(result: Result<T, CollabError>) -> Self {
        match result {
            Ok(body) => Self::Ok(body),
            Err(err) => Self::Error(err.into()),
        }
    }
}

/// Unwrap a JSON envelope, turning the error branch into a [`CollabError`].
///
/// A value that is not an envelope at all is reported as an internal error
/// from the transport, never as one of the protocol-level codes.
pub fn parse_collab_response<T: DeserializeOwned>(value: Value) -> Result<T, CollabError> {
    let response: CollabResponse<T> = serde_json::from_value(value).map_err(|e| {
        CollabError::internal(format!("malformed response: {e}")).from_origin("transport")
    })?;
    response.into_result()
}

/// Version-bump notification fanned out after every successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionBump {
    pub doc_name: String,
    pub version: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
}

/// Client → server WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct ClientFrame<S: Step> {
    pub id: u64,
    pub request: CollabRequest<S>,
}

impl<S: Step> ClientFrame<S> {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Server → client WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Envelope answering the request with the same id
    Response { id: u64, response: Value },
    /// A document this connection touched advanced
    Bump(VersionBump),
}

impl ServerFrame {
    pub fn response<T: Serialize>(id: u64, response: &CollabResponse<T>) -> Result<Self, ProtocolError> {
        let response = serde_json::to_value(response)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::Response { id, response })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Transport-level failures. They never reach the client's recovery policy
/// directly; they are mapped to `500` first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

impl From<ProtocolError> for CollabError {
    fn from(err: ProtocolError) -> Self {
        CollabError::internal(err.to_string()).from_origin("transport")
    }
}

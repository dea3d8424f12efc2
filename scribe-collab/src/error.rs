//! Error taxonomy shared by the manager and its clients.
//!
//! Every failure that crosses the request surface is one of five codes. The
//! client's recovery policy switches on [`ErrorCode`], never on message text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of collaboration error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    /// Malformed request or invalid version reference
    BadRequest,
    /// Unknown document
    NotFound,
    /// Steps cannot be rebased against concurrent history
    Conflict,
    /// Required history has been trimmed from the step log
    Gone,
    /// Unexpected failure, including transport failures
    Internal,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::Internal => 500,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::BadRequest => "bad request",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::Internal => "internal error",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            400 => Ok(Self::BadRequest),
            404 => Ok(Self::NotFound),
            409 => Ok(Self::Conflict),
            410 => Ok(Self::Gone),
            500 => Ok(Self::Internal),
            other => Err(format!("unknown collab error code {other}")),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

/// A typed collaboration error.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabError {
    pub error_code: ErrorCode,
    /// Diagnostic payload, usually a message string
    pub body: Value,
    /// Which hop produced the error (`"manager"`, `"transport"`, ...)
    pub from: Option<String>,
}

impl CollabError {
    pub fn new(error_code: ErrorCode, body: impl Into<Value>) -> Self {
        Self {
            error_code,
            body: body.into(),
            from: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message.into())
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Gone, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message.into())
    }

    /// Tag the error with its origin.
    pub fn from_origin(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Human-readable message extracted from the body.
    pub fn message(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Null => self.error_code.reason().to_string(),
            other => other.to_string(),
        }
    }

    /// Only internal failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        self.error_code == ErrorCode::Internal
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.from {
            Some(from) => write!(f, "{} ({from}): {}", self.error_code, self.message()),
            None => write!(f, "{}: {}", self.error_code, self.message()),
        }
    }
}

impl std::error::Error for CollabError {}

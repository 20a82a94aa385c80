use serde::{Deserialize, Serialize};

/// Body of a request or response as it crosses the handler boundary.
///
/// Codecs move `Payload`s; typed arguments and replies are converted at the
/// edges with `serde_json::{from_value, to_value}`.
pub type Payload = serde_json::Value;

/// Per-message metadata preceding every body on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// `"Service.Method"`
    pub service_method: String,
    /// Chosen by the client, unique among its in-flight calls.
    pub seq: u64,
    #[serde(default)]
    pub status: Status,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            status: Status::Ok,
        }
    }

    /// Copy of this header carrying `err` as its status.
    pub fn with_error(&self, err: RemoteError) -> Self {
        Self {
            service_method: self.service_method.clone(),
            seq: self.seq,
            status: Status::Error(err),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, Status::Error(_))
    }
}

/// Outcome slot of a header. Requests always carry `Ok`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Ok,
    Error(RemoteError),
}

/// Failure reported by the server for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No `.` separator in the service method name
    MalformedServiceMethod,
    ServiceNotFound,
    MethodNotFound,
    /// The request body could not be read
    InvalidRequest,
    /// The body was read but does not fit the method's argument type
    InvalidArgument,
    /// Returned by the handler itself
    Application,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::MalformedServiceMethod => "malformed service method",
            ErrorCode::ServiceNotFound => "service not found",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Application => "application error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(s)
    }
}

//! JSON-RPC error values.
//!
//! Every failure that crosses a protocol boundary in this workspace is an
//! [`Error`] with a JSON-RPC 2.0 error code. Subsystems that recover locally
//! (the MCP handler, the HTTP bridge) encode their failures as one of these;
//! transport- and pipeline-level faults propagate it up to tear the
//! conductor down.

use serde::{Deserialize, Serialize};

/// Invalid JSON was received, or a frame did not have a JSON-RPC 2.0 shape.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    /// JSON-RPC error code.
    pub code: i64,

    /// Human-readable error message.
    pub message: String,

    /// Optional structured data accompanying the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Error {
    /// Create an error with an explicit code and message.
    pub fn new(code: i64, message: impl ToString) -> Self {
        Error {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Error::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Error::new(INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found() -> Self {
        Error::new(METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params() -> Self {
        Error::new(INVALID_PARAMS, "Invalid params")
    }

    pub fn internal_error() -> Self {
        Error::new(INTERNAL_ERROR, "Internal error")
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    /// Convert an arbitrary displayable failure into an internal error.
    ///
    /// Shaped for `map_err`: `result.map_err(Error::into_internal_error)?`.
    pub fn into_internal_error(err: impl std::fmt::Display) -> Self {
        Error::internal_error().with_data(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)?;
        if let Some(data) = &self.data {
            write!(f, ": {data}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::parse_error().with_data(err.to_string())
    }
}

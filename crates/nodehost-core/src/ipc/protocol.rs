//! JSON-RPC 2.0 framing shared by the node and its sandboxes.
//!
//! One request or response per line. The method name is the action header
//! used for dispatch.

use crate::error::{ErrorCode, HostingError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 standard error codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    pub jsonrpc: String,
    pub id: u64,
    /// Action name.
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Error response carrying a hosting error code in `data`.
    pub fn hosting_error(id: u64, error: &HostingError) -> Self {
        let mut response = Self::error(id, error_codes::INTERNAL_ERROR, error.reply_message());
        if let Some(rpc) = response.error.as_mut() {
            rpc.data = serde_json::to_value(ErrorData {
                error_code: error.code(),
            })
            .ok();
        }
        response
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Convert into a hosting error, keeping the hosting code when present.
    pub fn into_hosting_error(self) -> HostingError {
        let code = self
            .data
            .and_then(|d| serde_json::from_value::<ErrorData>(d).ok())
            .map(|d| d.error_code)
            .unwrap_or(match self.code {
                error_codes::METHOD_NOT_FOUND => ErrorCode::OperationNotSupported,
                error_codes::INVALID_PARAMS | error_codes::INVALID_REQUEST => {
                    ErrorCode::InvalidArgument
                }
                _ => ErrorCode::OperationFailed,
            });
        HostingError::from_reply(code, self.message.clone()).unwrap_or(HostingError::Rpc {
            code: ErrorCode::OperationFailed,
            message: self.message,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorData {
    error_code: ErrorCode,
}

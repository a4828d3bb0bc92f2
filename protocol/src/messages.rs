//! Load, unload and status messages exchanged between managers.

use serde::Deserialize;
use serde::Serialize;

use crate::CODE_FAILED;
use crate::CODE_OK;
use crate::ErrorStack;
use crate::ResourceId;
use crate::UNASSIGNED_ID;

// ─────────────────────────────────────────────────────────────────────────────
// Load RPC
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol metadata attached to every load request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Where the server pushes status changes for this binding.
    pub status_address: String,
    /// Name of the manager issuing the request.
    pub caller_namespace: String,
}

/// Protocol metadata attached to every load response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub resource_id: ResourceId,
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "ErrorStack::is_empty")]
    pub error_stack: ErrorStack,
}

impl ResponseMeta {
    pub fn ok(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            code: CODE_OK,
            message: String::new(),
            error_stack: ErrorStack::default(),
        }
    }

    pub fn failed(resource_id: ResourceId, error_stack: ErrorStack) -> Self {
        let message = error_stack
            .root()
            .map(|frame| frame.message.clone())
            .unwrap_or_default();
        Self {
            resource_id,
            code: CODE_FAILED,
            message,
            error_stack,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Load RPC request: collaborator-owned payload wrapped with RMP metadata.
///
/// Deduplication compares `payload` only; `rmp` differs per caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub rmp: RequestMeta,
    pub payload: serde_json::Value,
}

/// Load RPC response. The RPC itself always succeeds; `rmp.code` carries
/// domain success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub rmp: ResponseMeta,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl LoadResponse {
    /// A FAILED response with no payload.
    pub fn failed(resource_id: ResourceId, error_stack: ErrorStack) -> Self {
        Self {
            rmp: ResponseMeta::failed(resource_id, error_stack),
            payload: serde_json::Value::Null,
        }
    }

    /// Copy of this response addressed to another binding.
    pub fn with_resource_id(&self, resource_id: ResourceId) -> Self {
        let mut response = self.clone();
        response.rmp.resource_id = resource_id;
        response
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unload RPC
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadRequest {
    pub server_name: String,
    /// External id minted by the server for the releasing caller.
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl UnloadResponse {
    pub fn ok() -> Self {
        Self {
            code: CODE_OK,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: CODE_FAILED,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status push
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Failed,
}

/// Asynchronous status change pushed from a server's owner to bound callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub resource_id: ResourceId,
    pub status_code: StatusCode,
    #[serde(default)]
    pub message: String,
    /// Filled in by the server when the message is fanned out.
    #[serde(default)]
    pub server_name: String,
    /// Filled in by the server when the message is fanned out.
    #[serde(default)]
    pub manager_name: String,
}

impl StatusMessage {
    /// A status change raised by an owner about one of its resources.
    pub fn new(
        resource_id: ResourceId,
        status_code: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_id,
            status_code,
            message: message.into(),
            server_name: String::new(),
            manager_name: String::new(),
        }
    }

    pub fn failed(resource_id: ResourceId, message: impl Into<String>) -> Self {
        Self::new(resource_id, StatusCode::Failed, message)
    }

    pub fn is_failure(&self) -> bool {
        self.status_code == StatusCode::Failed
    }
}

impl Default for StatusMessage {
    fn default() -> Self {
        Self::new(UNASSIGNED_ID, StatusCode::Ok, "")
    }
}

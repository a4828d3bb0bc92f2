//! Error types for resource management operations.

use rmp_protocol::ErrorStack;
use rmp_protocol::ResourceId;
use thiserror::Error;

/// Failures of the underlying call transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no endpoint bound at {address}")]
    Unreachable { address: String },

    #[error("endpoint {address} dropped the call before replying")]
    Dropped { address: String },

    #[error("endpoint {address} is closed")]
    Closed { address: String },

    #[error("endpoint {address} is already bound")]
    AlreadyBound { address: String },
}

/// Error type for resource manager, client and server operations.
#[derive(Debug, Error)]
pub enum RmpError {
    /// The remote call could not be delivered. Not recoverable by retrying
    /// the same request against the same endpoint.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The remote server answered with a FAILED code.
    #[error("{server} failed to load resource:\n{stack}")]
    Application { server: String, stack: ErrorStack },

    #[error("payload (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("resource {0} is not held by this manager")]
    UnknownResource(ResourceId),

    #[error("server {0} is already registered")]
    DuplicateServer(String),

    /// A nested call completed after the resource it was made for had been
    /// unloaded; the nested binding has already been released.
    #[error("resource {parent} on {server} was unloaded while its dependency was loading")]
    Orphaned { server: String, parent: ResourceId },

    #[error("manager {0} has shut down")]
    ManagerShutDown(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RmpError {
    /// Whether the calling component may reasonably decide to retry.
    ///
    /// Application failures carry the remote error stack and leave the
    /// protocol state clean; everything else points at a broken link or a
    /// programming error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RmpError::Application { .. } | RmpError::Orphaned { .. })
    }

    /// Remote error stack, when the server provided one.
    pub fn error_stack(&self) -> Option<&ErrorStack> {
        match self {
            RmpError::Application { stack, .. } => Some(stack),
            _ => None,
        }
    }
}

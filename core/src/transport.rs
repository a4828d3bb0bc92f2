//! Seam between the protocol state machine and the call transport.
//!
//! The transport is assumed to deliver matched request/response pairs
//! reliably. Outbound calls go through [`Transport`]; inbound RPCs reach a
//! resource server through [`ServerEndpoint`] and status pushes reach a
//! manager through [`StatusSink`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rmp_protocol::LoadRequest;
use rmp_protocol::LoadResponse;
use rmp_protocol::StatusMessage;
use rmp_protocol::UnloadRequest;
use rmp_protocol::UnloadResponse;

use crate::error::TransportError;

/// A load that joined a request already being satisfied by another caller.
pub type JoinedLoad = Pin<Box<dyn Future<Output = LoadResponse> + Send>>;

/// Answer of a server to one load RPC.
pub enum LoadAnswer {
    Ready(LoadResponse),
    /// Resolves once the in-flight load finishes. Transports must not await
    /// it on a worker that could be needed to finish that load.
    Joined(JoinedLoad),
}

impl From<LoadResponse> for LoadAnswer {
    fn from(response: LoadResponse) -> Self {
        Self::Ready(response)
    }
}

/// Inbound side of one resource server.
#[async_trait]
pub trait ServerEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Load RPC entry point. Always answers; domain failure travels inside
    /// the response.
    async fn load(&self, request: LoadRequest) -> LoadAnswer;

    async fn unload(&self, request: UnloadRequest) -> UnloadResponse;
}

/// Inbound side of a manager's status channel.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn deliver(&self, status: StatusMessage);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start serving load/unload RPCs for `endpoint` under `manager`.
    async fn bind_server(
        &self,
        manager: &str,
        endpoint: Arc<dyn ServerEndpoint>,
    ) -> Result<(), TransportError>;

    /// Start accepting status pushes at `address`.
    async fn bind_status(
        &self,
        address: &str,
        sink: Arc<dyn StatusSink>,
    ) -> Result<(), TransportError>;

    /// Stop serving every endpoint bound by `manager`.
    async fn unbind_manager(&self, manager: &str);

    async fn load(
        &self,
        manager: &str,
        server: &str,
        request: LoadRequest,
    ) -> Result<LoadResponse, TransportError>;

    async fn unload(
        &self,
        manager: &str,
        request: UnloadRequest,
    ) -> Result<UnloadResponse, TransportError>;

    async fn push_status(&self, address: &str, status: StatusMessage)
    -> Result<(), TransportError>;
}

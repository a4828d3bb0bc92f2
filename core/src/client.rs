//! Resource client: the caller side of one (manager, server) pair.
//!
//! Deduplicates structurally-equal requests, hands every caller its own
//! internal id, and releases the remote binding once the last caller has
//! unloaded.

use std::sync::Arc;

use rmp_protocol::CODE_FAILED;
use rmp_protocol::ErrorStack;
use rmp_protocol::LoadRequest;
use rmp_protocol::LoadResponse;
use rmp_protocol::RequestMeta;
use rmp_protocol::ResourceId;
use rmp_protocol::UnloadRequest;
use rmp_protocol::status_address;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::RmpError;
use crate::ids::IdAllocator;
use crate::query::ClientQuery;
use crate::query::Unbind;
use crate::transport::Transport;

/// One caller binding held by a client, as reported by
/// [`crate::ResourceManager::client_bindings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBinding {
    pub resource_id: ResourceId,
    /// `"<manager>/<server>"` the resource was requested from.
    pub target: String,
    pub label: String,
    pub failed: bool,
}

pub struct ResourceClient {
    /// `"<manager>/<server>"` of the remote server.
    name: String,
    owner: String,
    target_manager: String,
    target_server: String,
    transport: Arc<dyn Transport>,
    internal_ids: Arc<IdAllocator>,
    queries: Mutex<Vec<ClientQuery>>,
}

impl ResourceClient {
    pub(crate) fn new(
        owner: &str,
        target_manager: &str,
        target_server: &str,
        transport: Arc<dyn Transport>,
        internal_ids: Arc<IdAllocator>,
    ) -> Self {
        let name = format!("{target_manager}/{target_server}");
        tracing::debug!(manager = owner, client = %name, "created resource client");
        Self {
            name,
            owner: owner.to_string(),
            target_manager: target_manager.to_string(),
            target_server: target_server.to_string(),
            transport,
            internal_ids,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Obtain a binding on the resource described by `request`.
    ///
    /// The returned response carries a freshly minted internal id in
    /// `rmp.resource_id`. The query lock is never held across the remote
    /// call, so a load callback may call back into this same client.
    pub async fn call(&self, request: Value, label: &str) -> Result<LoadResponse, RmpError> {
        {
            let mut queries = self.queries.lock().await;
            if let Some(query) = queries.iter_mut().find(|q| q.matches(&request)) {
                let resource_id = self.internal_ids.generate();
                query.bind(resource_id, label);
                tracing::debug!(
                    manager = %self.owner,
                    client = %self.name,
                    resource_id,
                    "existing request, using stored response"
                );
                return Ok(query.response().with_resource_id(resource_id));
            }
        }

        tracing::debug!(manager = %self.owner, client = %self.name, "new request, calling server");
        let load_request = LoadRequest {
            rmp: RequestMeta {
                status_address: status_address(&self.owner),
                caller_namespace: self.owner.clone(),
            },
            payload: request.clone(),
        };
        let response = match self
            .transport
            .load(&self.target_manager, &self.target_server, load_request)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(
                    manager = %self.owner,
                    client = %self.name,
                    "load call failed: {err}"
                );
                return Err(err.into());
            }
        };

        if !response.rmp.is_ok() {
            let mut stack = response.rmp.error_stack;
            if stack.is_empty() {
                stack = ErrorStack::from_message(CODE_FAILED, &self.name, response.rmp.message);
            }
            return Err(RmpError::Application {
                server: self.name.clone(),
                stack: stack.forward(&self.owner, format!("call to {} failed", self.name)),
            });
        }

        let resource_id = self.internal_ids.generate();
        let external_id = response.rmp.resource_id;
        let raced = {
            let mut queries = self.queries.lock().await;
            match queries.iter_mut().find(|q| q.matches(&request)) {
                Some(existing) => {
                    // An equal call completed while ours was in flight.
                    existing.bind(resource_id, label);
                    Some(existing.response().with_resource_id(resource_id))
                }
                None => {
                    let mut query = ClientQuery::new(request, response.clone());
                    query.bind(resource_id, label);
                    queries.push(query);
                    None
                }
            }
        };

        if let Some(reply) = raced {
            self.send_unload(external_id).await;
            return Ok(reply);
        }

        tracing::debug!(
            manager = %self.owner,
            client = %self.name,
            resource_id,
            external_id,
            "new query stored"
        );
        Ok(response.with_resource_id(resource_id))
    }

    /// Release one binding. Returns `false` if this client does not hold it.
    pub async fn unload_resource(&self, resource_id: ResourceId) -> bool {
        let released = {
            let mut queries = self.queries.lock().await;
            let Some(pos) = queries.iter().position(|q| q.holds(resource_id)) else {
                return false;
            };
            match queries[pos].unbind(resource_id) {
                Unbind::Remaining(0) => Some(queries.remove(pos).external_id()),
                Unbind::Remaining(_) | Unbind::NotBound => None,
            }
        };

        if let Some(external_id) = released {
            tracing::debug!(
                manager = %self.owner,
                client = %self.name,
                resource_id,
                external_id,
                "last binding released, unloading"
            );
            self.send_unload(external_id).await;
        }
        true
    }

    /// Discard every query, issuing one unload RPC each.
    pub async fn unload_resources(&self) {
        let released: Vec<ResourceId> = {
            let mut queries = self.queries.lock().await;
            queries.drain(..).map(|q| q.external_id()).collect()
        };
        tracing::info!(
            manager = %self.owner,
            client = %self.name,
            queries = released.len(),
            "unloading all resources"
        );
        for external_id in released {
            self.send_unload(external_id).await;
        }
    }

    /// Apply a status push for `external_id` and return the bindings it
    /// concerns. A failure flags the query; it releases nothing.
    pub async fn apply_status(
        &self,
        external_id: ResourceId,
        failed: bool,
    ) -> Vec<(ResourceId, String)> {
        let mut queries = self.queries.lock().await;
        let Some(query) = queries
            .iter_mut()
            .find(|q| !q.is_failed() && q.external_id() == external_id)
        else {
            return Vec::new();
        };
        if failed {
            query.mark_failed();
        }
        query
            .bindings()
            .iter()
            .map(|(id, label)| (*id, label.clone()))
            .collect()
    }

    /// Mark the query bound under `external_id` as failed.
    pub async fn set_failed_flag(&self, external_id: ResourceId) -> bool {
        !self.apply_status(external_id, true).await.is_empty()
    }

    /// `None` if this client does not hold `resource_id`.
    pub async fn has_failed(&self, resource_id: ResourceId) -> Option<bool> {
        let queries = self.queries.lock().await;
        queries
            .iter()
            .find(|q| q.holds(resource_id))
            .map(ClientQuery::is_failed)
    }

    pub async fn holds(&self, resource_id: ResourceId) -> bool {
        let queries = self.queries.lock().await;
        queries.iter().any(|q| q.holds(resource_id))
    }

    pub async fn query_count(&self) -> usize {
        self.queries.lock().await.len()
    }

    pub async fn bindings(&self) -> Vec<ClientBinding> {
        let queries = self.queries.lock().await;
        queries
            .iter()
            .flat_map(|q| {
                q.bindings().iter().map(|(id, label)| ClientBinding {
                    resource_id: *id,
                    target: self.name.clone(),
                    label: label.clone(),
                    failed: q.is_failed(),
                })
            })
            .collect()
    }

    async fn send_unload(&self, external_id: ResourceId) {
        let request = UnloadRequest {
            server_name: self.target_server.clone(),
            resource_id: external_id,
        };
        match self.transport.unload(&self.target_manager, request).await {
            Ok(response) if response.is_ok() => {}
            Ok(response) => tracing::warn!(
                manager = %self.owner,
                client = %self.name,
                external_id,
                "server refused unload: {}",
                response.message
            ),
            Err(err) => tracing::error!(
                manager = %self.owner,
                client = %self.name,
                external_id,
                "unload call failed: {err}"
            ),
        }
    }
}

//! Resource server: the serving side of one load operation.
//!
//! Deduplicates structurally-equal requests so the owner's load callback
//! runs at most once per distinct request, counts the callers bound to each
//! result, and tears the resource down (owner unload, then cascade over
//! nested dependencies) when the last caller leaves.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use rmp_protocol::CODE_FAILED;
use rmp_protocol::ErrorStack;
use rmp_protocol::LoadRequest;
use rmp_protocol::LoadResponse;
use rmp_protocol::ResourceId;
use rmp_protocol::ResponseMeta;
use rmp_protocol::StatusMessage;
use rmp_protocol::UNASSIGNED_ID;
use rmp_protocol::UnloadRequest;
use rmp_protocol::UnloadResponse;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::sync::watch;

use crate::ids::IdAllocator;
use crate::manager::LoadContext;
use crate::manager::ManagerShared;
use crate::manager::ResourceManager;
use crate::query::LoadWaiter;
use crate::query::Reply;
use crate::query::ServerQuery;
use crate::query::Unbind;
use crate::transport::LoadAnswer;
use crate::transport::ServerEndpoint;
use crate::transport::Transport;

/// Capability an owning component implements for each server it hosts.
///
/// `load` runs at most once per distinct request; `unload` runs once when
/// the last caller bound to that request has released it.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + PartialEq + Debug + Clone + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static;

    /// Instantiate the resource. Nested acquisitions made through
    /// [`LoadContext::call`] become dependencies of this resource.
    async fn load(
        &self,
        ctx: &LoadContext,
        request: &Self::Request,
    ) -> Result<Self::Response, ErrorStack>;

    async fn unload(
        &self,
        resource_id: ResourceId,
        request: &Self::Request,
        response: &Self::Response,
    );
}

#[async_trait]
impl<H: ResourceHandler> ResourceHandler for Arc<H> {
    type Request = H::Request;
    type Response = H::Response;

    async fn load(
        &self,
        ctx: &LoadContext,
        request: &Self::Request,
    ) -> Result<Self::Response, ErrorStack> {
        (**self).load(ctx, request).await
    }

    async fn unload(
        &self,
        resource_id: ResourceId,
        request: &Self::Request,
        response: &Self::Response,
    ) {
        (**self).unload(resource_id, request, response).await;
    }
}

/// Outcome of fanning a status message out to bound callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusDelivery {
    pub attempted: usize,
    pub failed: usize,
}

/// Server operations the owning manager needs beyond the RPC surface.
#[async_trait]
pub(crate) trait ManagedServer: Send + Sync {
    /// Record `resource_id` as a dependency of the query minted `parent`.
    async fn register_internal_client(
        &self,
        parent: ResourceId,
        label: &str,
        resource_id: ResourceId,
    ) -> bool;

    async fn notify_clients(&self, status: StatusMessage) -> StatusDelivery;

    /// Whether one of this server's queries holds `resource_id` as an
    /// internal binding.
    async fn owns(&self, resource_id: ResourceId) -> bool;

    async fn query_count(&self) -> usize;
}

pub struct ResourceServer<H: ResourceHandler> {
    name: String,
    manager_name: String,
    manager: Weak<ManagerShared>,
    handler: H,
    transport: Arc<dyn Transport>,
    internal_ids: Arc<IdAllocator>,
    external_ids: IdAllocator,
    queries: Mutex<Vec<ServerQuery<H::Request, H::Response>>>,
}

impl<H: ResourceHandler> ResourceServer<H> {
    pub(crate) fn new(name: &str, manager: &Arc<ManagerShared>, handler: H) -> Self {
        tracing::info!(manager = %manager.name, server = name, "resource server constructed");
        Self {
            name: name.to_string(),
            manager_name: manager.name.clone(),
            manager: Arc::downgrade(manager),
            handler,
            transport: Arc::clone(&manager.transport),
            internal_ids: Arc::clone(&manager.internal_ids),
            external_ids: IdAllocator::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    fn manager(&self) -> Option<ResourceManager> {
        self.manager.upgrade().map(ResourceManager::from_shared)
    }

    fn origin(&self) -> String {
        format!("{}/{}", self.manager_name, self.name)
    }

    fn failure(&self, message: impl Into<String>) -> ErrorStack {
        ErrorStack::from_message(CODE_FAILED, &self.origin(), message)
    }

    /// Store the callback outcome into its query, or clean up if the query
    /// was unloaded while the callback ran. Returns the cached response.
    async fn finish_load(
        &self,
        resource_id: ResourceId,
        request: &H::Request,
        outcome: Result<H::Response, ErrorStack>,
    ) -> LoadResponse {
        let outcome = outcome.and_then(|response| match serde_json::to_value(&response) {
            Ok(payload) => Ok((response, payload)),
            Err(err) => Err(self.failure(format!("response is not serializable: {err}"))),
        });

        let mut queries = self.queries.lock().await;
        let position = queries.iter().position(|q| q.resource_id() == resource_id);
        match (position, outcome) {
            (Some(pos), Ok((response, payload))) => {
                let wire = LoadResponse {
                    rmp: ResponseMeta::ok(resource_id),
                    payload,
                };
                queries[pos].satisfy(response, wire.clone());
                wire
            }
            (Some(pos), Err(stack)) => {
                let query = queries.remove(pos);
                drop(queries);
                tracing::warn!(
                    manager = %self.manager_name,
                    server = %self.name,
                    resource_id,
                    "load callback failed:\n{stack}"
                );
                self.cascade(query.dependencies()).await;
                LoadResponse::failed(
                    resource_id,
                    stack.forward(&self.name, "load callback failed"),
                )
            }
            (None, outcome) => {
                drop(queries);
                tracing::warn!(
                    manager = %self.manager_name,
                    server = %self.name,
                    resource_id,
                    "query was unloaded while the load callback ran"
                );
                if let Ok((response, _)) = outcome {
                    self.handler.unload(resource_id, request, &response).await;
                }
                LoadResponse::failed(
                    resource_id,
                    self.failure("resource was unloaded while loading"),
                )
            }
        }
    }

    async fn teardown(&self, query: ServerQuery<H::Request, H::Response>) {
        tracing::info!(
            manager = %self.manager_name,
            server = %self.name,
            resource_id = query.resource_id(),
            "last caller released, unloading"
        );
        match query.response() {
            Some(response) => {
                self.handler
                    .unload(query.resource_id(), query.request(), response)
                    .await;
            }
            // The in-flight load notices the missing query and cleans up.
            None => debug_assert!(query.is_pending()),
        }
        self.cascade(query.dependencies()).await;
    }

    /// Release resources acquired as dependencies of a torn-down query.
    async fn cascade(&self, dependencies: Vec<ResourceId>) {
        if dependencies.is_empty() {
            return;
        }
        let Some(manager) = self.manager() else {
            tracing::warn!(
                server = %self.name,
                "manager gone, {} dependencies left loaded",
                dependencies.len()
            );
            return;
        };
        for resource_id in dependencies {
            tracing::debug!(server = %self.name, resource_id, "cascade unload");
            if let Err(err) = manager.unload_client_resource(resource_id).await {
                tracing::warn!(server = %self.name, resource_id, "cascade unload failed: {err}");
            }
        }
    }
}

/// Response for a caller that joined a pending query, once the owner's
/// callback has finished.
async fn wait_for_load(
    mut waiter: LoadWaiter,
    external_id: ResourceId,
    origin: String,
) -> LoadResponse {
    let message = match waiter.wait_for(Option::is_some).await {
        Ok(response) => match response.as_ref() {
            Some(response) => return response.with_resource_id(external_id),
            None => "load produced no response",
        },
        Err(_) => "load callback ended without a response",
    };
    LoadResponse::failed(
        external_id,
        ErrorStack::from_message(CODE_FAILED, &origin, message),
    )
}

#[async_trait]
impl<H: ResourceHandler> ServerEndpoint for ResourceServer<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, request: LoadRequest) -> LoadAnswer {
        let external_id = self.external_ids.generate();
        let status_address = request.rmp.status_address;
        tracing::info!(
            manager = %self.manager_name,
            server = %self.name,
            caller = %request.rmp.caller_namespace,
            external_id,
            "got load request"
        );

        let typed: H::Request = match serde_json::from_value(request.payload) {
            Ok(typed) => typed,
            Err(err) => {
                return LoadResponse::failed(
                    UNASSIGNED_ID,
                    self.failure(format!("malformed request: {err}")),
                )
                .into();
            }
        };

        let (resource_id, done) = {
            let mut queries = self.queries.lock().await;
            if let Some(query) = queries.iter_mut().find(|q| q.matches(&typed)) {
                query.bind_external(external_id, &status_address);
                let reply = query.reply_for(external_id);
                drop(queries);
                tracing::debug!(server = %self.name, external_id, "existing query, linking caller");
                return match reply {
                    Reply::Ready(response) => LoadAnswer::Ready(response),
                    Reply::Wait(waiter) => LoadAnswer::Joined(Box::pin(wait_for_load(
                        waiter,
                        external_id,
                        self.origin(),
                    ))),
                };
            }

            let resource_id = self.internal_ids.generate();
            let (done, waiter) = watch::channel(None);
            let mut query = ServerQuery::pending(typed.clone(), resource_id, waiter);
            query.bind_external(external_id, &status_address);
            queries.push(query);
            (resource_id, done)
        };
        tracing::debug!(server = %self.name, resource_id, external_id, "new query");

        let outcome = match self.manager() {
            Some(manager) => {
                let ctx = LoadContext::new(manager, &self.name, resource_id);
                self.handler.load(&ctx, &typed).await
            }
            None => Err(self.failure("manager has shut down")),
        };

        let response = self.finish_load(resource_id, &typed, outcome).await;
        done.send_replace(Some(response.clone()));
        response.with_resource_id(external_id).into()
    }

    async fn unload(&self, request: UnloadRequest) -> UnloadResponse {
        let external_id = request.resource_id;
        let released = {
            let mut queries = self.queries.lock().await;
            let Some(pos) = queries.iter().position(|q| q.has_external(external_id)) else {
                tracing::warn!(
                    manager = %self.manager_name,
                    server = %self.name,
                    external_id,
                    "unload for unknown external id"
                );
                return UnloadResponse::failed(format!(
                    "{}: no resource bound to external id {external_id}",
                    self.name
                ));
            };
            match queries[pos].unbind_external(external_id) {
                Unbind::Remaining(0) => Some(queries.remove(pos)),
                Unbind::Remaining(remaining) => {
                    tracing::debug!(server = %self.name, external_id, remaining, "caller unbound");
                    None
                }
                Unbind::NotBound => None,
            }
        };

        if let Some(query) = released {
            self.teardown(query).await;
        }
        UnloadResponse::ok()
    }
}

#[async_trait]
impl<H: ResourceHandler> ManagedServer for ResourceServer<H> {
    async fn register_internal_client(
        &self,
        parent: ResourceId,
        label: &str,
        resource_id: ResourceId,
    ) -> bool {
        let mut queries = self.queries.lock().await;
        match queries.iter_mut().find(|q| q.resource_id() == parent) {
            Some(query) => {
                tracing::debug!(server = %self.name, parent, resource_id, "dependency registered");
                query.bind_internal(resource_id, label)
            }
            None => false,
        }
    }

    async fn notify_clients(&self, status: StatusMessage) -> StatusDelivery {
        let targets = {
            let queries = self.queries.lock().await;
            queries
                .iter()
                .find(|q| q.holds_internal(status.resource_id))
                .map(ServerQuery::external_bindings)
                .unwrap_or_default()
        };

        let mut delivery = StatusDelivery::default();
        for (external_id, address) in targets {
            let mut message = status.clone();
            message.resource_id = external_id;
            message.server_name = self.name.clone();
            message.manager_name = self.manager_name.clone();
            delivery.attempted += 1;
            tracing::info!(server = %self.name, external_id, %address, "sending status");
            if let Err(err) = self.transport.push_status(&address, message).await {
                delivery.failed += 1;
                tracing::warn!(server = %self.name, external_id, "status delivery failed: {err}");
            }
        }
        delivery
    }

    async fn owns(&self, resource_id: ResourceId) -> bool {
        let queries = self.queries.lock().await;
        queries.iter().any(|q| q.holds_internal(resource_id))
    }

    async fn query_count(&self) -> usize {
        self.queries.lock().await.len()
    }
}

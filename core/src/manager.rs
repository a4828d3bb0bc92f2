//! Per-component façade over the resource clients and servers.
//!
//! A [`ResourceManager`] creates one [`ResourceClient`] per remote
//! (manager, server) pair on demand, hosts the component's own
//! [`ResourceServer`]s, and routes inbound status pushes back to the owner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use rmp_protocol::ResourceId;
use rmp_protocol::StatusMessage;
use rmp_protocol::status_address;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::client::ClientBinding;
use crate::client::ResourceClient;
use crate::error::RmpError;
use crate::ids::IdAllocator;
use crate::query::SELF_LABEL;
use crate::server::ManagedServer;
use crate::server::ResourceHandler;
use crate::server::ResourceServer;
use crate::server::StatusDelivery;
use crate::transport::ServerEndpoint;
use crate::transport::StatusSink;
use crate::transport::Transport;

/// Owner-level status handler. Invoked once per internal binding affected
/// by an inbound status push, with `resource_id` rewritten to that binding.
pub type StatusCallback = Arc<dyn Fn(StatusMessage) + Send + Sync>;

/// A typed response together with the internal id of the caller's binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<Resp> {
    pub resource_id: ResourceId,
    pub response: Resp,
}

type ClientKey = (String, String);

pub(crate) struct ManagerShared {
    pub(crate) name: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) internal_ids: Arc<IdAllocator>,
    clients: Mutex<BTreeMap<ClientKey, Arc<ResourceClient>>>,
    servers: Mutex<BTreeMap<String, Arc<dyn ManagedServer>>>,
    status_cb: Mutex<Option<StatusCallback>>,
    shut_down: AtomicBool,
}

/// Cheaply cloneable handle; all clones share the same protocol state.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

impl ResourceManager {
    /// Create a manager and start accepting status pushes at
    /// `"<name>/status"` on `transport`.
    pub async fn new(name: &str, transport: Arc<dyn Transport>) -> Result<Self, RmpError> {
        let shared = Arc::new(ManagerShared {
            name: name.to_string(),
            transport: Arc::clone(&transport),
            internal_ids: Arc::new(IdAllocator::new()),
            clients: Mutex::new(BTreeMap::new()),
            servers: Mutex::new(BTreeMap::new()),
            status_cb: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        let route = Arc::new(StatusRoute {
            manager: Arc::downgrade(&shared),
        });
        transport.bind_status(&status_address(name), route).await?;
        tracing::info!(manager = name, "resource manager started");
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn ensure_running(&self) -> Result<(), RmpError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(RmpError::ManagerShutDown(self.shared.name.clone()));
        }
        Ok(())
    }

    /// Register a server named `name`, served by `handler`.
    pub async fn add_server<H: ResourceHandler>(
        &self,
        name: &str,
        handler: H,
    ) -> Result<(), RmpError> {
        self.ensure_running()?;
        let server = {
            let mut servers = self.shared.servers.lock().await;
            if servers.contains_key(name) {
                return Err(RmpError::DuplicateServer(name.to_string()));
            }
            let server = Arc::new(ResourceServer::new(name, &self.shared, handler));
            let managed: Arc<dyn ManagedServer> = Arc::clone(&server) as Arc<dyn ManagedServer>;
            servers.insert(name.to_string(), managed);
            server
        };

        let endpoint: Arc<dyn ServerEndpoint> = server;
        if let Err(err) = self
            .shared
            .transport
            .bind_server(&self.shared.name, endpoint)
            .await
        {
            self.shared.servers.lock().await.remove(name);
            return Err(err.into());
        }
        tracing::info!(manager = %self.shared.name, server = name, "server registered");
        Ok(())
    }

    pub async fn register_status_cb<F>(&self, callback: F)
    where
        F: Fn(StatusMessage) + Send + Sync + 'static,
    {
        *self.shared.status_cb.lock().await = Some(Arc::new(callback));
    }

    /// Acquire a binding on `request` from `server_name` hosted by
    /// `manager_name`, on behalf of the owning component itself.
    ///
    /// Bindings made this way are never released by cascade, even when the
    /// call is issued from inside a load callback. Use [`LoadContext::call`]
    /// to acquire a dependency of the resource being loaded.
    pub async fn call<Req, Resp>(
        &self,
        manager_name: &str,
        server_name: &str,
        request: &Req,
    ) -> Result<Loaded<Resp>, RmpError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned + Send,
    {
        self.call_attributed(manager_name, server_name, request, None)
            .await
    }

    async fn call_attributed<Req, Resp>(
        &self,
        manager_name: &str,
        server_name: &str,
        request: &Req,
        parent: Option<(&str, ResourceId)>,
    ) -> Result<Loaded<Resp>, RmpError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned + Send,
    {
        self.ensure_running()?;
        let payload = serde_json::to_value(request)?;
        let client = self.client_for(manager_name, server_name).await;
        let label = parent.map_or(SELF_LABEL, |(server, _)| server);

        let response = client.call(payload, label).await?;
        let resource_id = response.rmp.resource_id;

        if let Some((server, parent_id)) = parent {
            let registered = match self.server(server).await {
                Some(owner) => {
                    owner
                        .register_internal_client(parent_id, server, resource_id)
                        .await
                }
                None => false,
            };
            if !registered {
                tracing::warn!(
                    manager = %self.shared.name,
                    server,
                    parent = parent_id,
                    resource_id,
                    "parent resource vanished during nested call, releasing"
                );
                client.unload_resource(resource_id).await;
                return Err(RmpError::Orphaned {
                    server: server.to_string(),
                    parent: parent_id,
                });
            }
        }

        match serde_json::from_value(response.payload) {
            Ok(response) => Ok(Loaded {
                resource_id,
                response,
            }),
            Err(err) => {
                client.unload_resource(resource_id).await;
                Err(err.into())
            }
        }
    }

    /// Release one binding on whichever client holds `resource_id`.
    pub async fn unload_client_resource(&self, resource_id: ResourceId) -> Result<(), RmpError> {
        for client in self.clients().await {
            if client.unload_resource(resource_id).await {
                return Ok(());
            }
        }
        tracing::warn!(manager = %self.shared.name, resource_id, "unload of unknown resource");
        Err(RmpError::UnknownResource(resource_id))
    }

    /// Push an owner-originated status change for a resource served by one
    /// of this manager's servers to every caller bound to it.
    pub async fn send_status(
        &self,
        resource_id: ResourceId,
        mut status: StatusMessage,
    ) -> Result<StatusDelivery, RmpError> {
        let servers: Vec<Arc<dyn ManagedServer>> =
            self.shared.servers.lock().await.values().cloned().collect();
        for server in servers {
            if server.owns(resource_id).await {
                status.resource_id = resource_id;
                return Ok(server.notify_clients(status).await);
            }
        }
        Err(RmpError::UnknownResource(resource_id))
    }

    /// Whether the client binding `resource_id` is flagged failed. Unknown
    /// ids report `false`.
    pub async fn has_failed(&self, resource_id: ResourceId) -> bool {
        for client in self.clients().await {
            if let Some(failed) = client.has_failed(resource_id).await {
                return failed;
            }
        }
        false
    }

    pub async fn client_bindings(&self) -> Vec<ClientBinding> {
        let mut bindings = Vec::new();
        for client in self.clients().await {
            bindings.extend(client.bindings().await);
        }
        bindings
    }

    /// Number of live queries on server `name`, or `None` if no such server.
    pub async fn server_query_count(&self, name: &str) -> Option<usize> {
        match self.server(name).await {
            Some(server) => Some(server.query_count().await),
            None => None,
        }
    }

    pub async fn has_server(&self, name: &str) -> bool {
        self.shared.servers.lock().await.contains_key(name)
    }

    /// Release every resource this component acquired and stop serving.
    ///
    /// Later calls and server registrations fail with
    /// [`RmpError::ManagerShutDown`].
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(manager = %self.shared.name, "shutting down");
        let clients: Vec<Arc<ResourceClient>> = {
            let mut clients = self.shared.clients.lock().await;
            std::mem::take(&mut *clients).into_values().collect()
        };
        for client in clients {
            client.unload_resources().await;
        }
        self.shared
            .transport
            .unbind_manager(&self.shared.name)
            .await;
        self.shared.servers.lock().await.clear();
    }

    async fn handle_status(&self, status: StatusMessage) {
        let key = (status.manager_name.clone(), status.server_name.clone());
        let client = self.shared.clients.lock().await.get(&key).cloned();
        let Some(client) = client else {
            tracing::warn!(
                manager = %self.shared.name,
                from = %format!("{}/{}", key.0, key.1),
                "status from a server this manager never called"
            );
            return;
        };

        let failed = status.is_failure();
        let bindings = client.apply_status(status.resource_id, failed).await;
        if bindings.is_empty() {
            tracing::debug!(
                manager = %self.shared.name,
                client = %client.name(),
                external_id = status.resource_id,
                "status for a released resource"
            );
            return;
        }
        tracing::info!(
            manager = %self.shared.name,
            client = %client.name(),
            external_id = status.resource_id,
            failed,
            "status received"
        );

        let callback = self.shared.status_cb.lock().await.clone();
        for (resource_id, label) in bindings {
            let mut local = status.clone();
            local.resource_id = resource_id;
            if let Some(callback) = &callback {
                callback(local.clone());
            }

            // A failed dependency fails the resource it was acquired for.
            if failed
                && label != SELF_LABEL
                && let Some(server) = self.server(&label).await
            {
                let delivery = server.notify_clients(local).await;
                tracing::debug!(
                    manager = %self.shared.name,
                    server = %label,
                    resource_id,
                    attempted = delivery.attempted,
                    failed = delivery.failed,
                    "dependency failure forwarded"
                );
            }
        }
    }

    async fn client_for(&self, manager_name: &str, server_name: &str) -> Arc<ResourceClient> {
        let mut clients = self.shared.clients.lock().await;
        let key = (manager_name.to_string(), server_name.to_string());
        let client = clients.entry(key).or_insert_with(|| {
            Arc::new(ResourceClient::new(
                &self.shared.name,
                manager_name,
                server_name,
                Arc::clone(&self.shared.transport),
                Arc::clone(&self.shared.internal_ids),
            ))
        });
        Arc::clone(client)
    }

    async fn clients(&self) -> Vec<Arc<ResourceClient>> {
        self.shared.clients.lock().await.values().cloned().collect()
    }

    async fn server(&self, name: &str) -> Option<Arc<dyn ManagedServer>> {
        self.shared.servers.lock().await.get(name).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load attribution
// ─────────────────────────────────────────────────────────────────────────────

/// Handed to [`ResourceHandler::load`] for the duration of one callback.
pub struct LoadContext {
    manager: ResourceManager,
    server_name: String,
    resource_id: ResourceId,
}

impl LoadContext {
    pub(crate) fn new(manager: ResourceManager, server_name: &str, resource_id: ResourceId) -> Self {
        Self {
            manager,
            server_name: server_name.to_string(),
            resource_id,
        }
    }

    /// Internal id minted for the request being loaded. Pass it to
    /// [`ResourceManager::send_status`] to notify the requesters.
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    /// Acquire a dependency of the resource being loaded. It is released
    /// automatically when that resource is unloaded.
    pub async fn call<Req, Resp>(
        &self,
        manager_name: &str,
        server_name: &str,
        request: &Req,
    ) -> Result<Loaded<Resp>, RmpError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned + Send,
    {
        self.manager
            .call_attributed(
                manager_name,
                server_name,
                request,
                Some((self.server_name.as_str(), self.resource_id)),
            )
            .await
    }
}

/// Status sink bound at the manager's status address.
struct StatusRoute {
    manager: Weak<ManagerShared>,
}

#[async_trait]
impl StatusSink for StatusRoute {
    async fn deliver(&self, status: StatusMessage) {
        match self.manager.upgrade() {
            Some(shared) => ResourceManager::from_shared(shared).handle_status(status).await,
            None => tracing::debug!("status pushed to a dropped manager"),
        }
    }
}

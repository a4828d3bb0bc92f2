//! Per-request bookkeeping records kept by clients and servers.

use std::collections::BTreeMap;

use rmp_protocol::LoadResponse;
use rmp_protocol::ResourceId;
use serde_json::Value;
use tokio::sync::watch;

/// Caller label of a binding made by the owning component itself, outside
/// any load callback. Such bindings are never unloaded by cascade.
pub const SELF_LABEL: &str = "";

/// Result of removing one binding from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unbind {
    NotBound,
    Remaining(usize),
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

/// One distinct request issued by a resource client and the bindings its
/// callers hold on the result.
#[derive(Debug)]
pub(crate) struct ClientQuery {
    request: Value,
    /// Response as received; `rmp.resource_id` is the server's external id.
    response: LoadResponse,
    bindings: BTreeMap<ResourceId, String>,
    failed: bool,
}

impl ClientQuery {
    pub(crate) fn new(request: Value, response: LoadResponse) -> Self {
        Self {
            request,
            response,
            bindings: BTreeMap::new(),
            failed: false,
        }
    }

    /// Failed queries never match, so the next equal request goes remote.
    pub(crate) fn matches(&self, request: &Value) -> bool {
        !self.failed && self.request == *request
    }

    pub(crate) fn external_id(&self) -> ResourceId {
        self.response.rmp.resource_id
    }

    pub(crate) fn response(&self) -> &LoadResponse {
        &self.response
    }

    pub(crate) fn bind(&mut self, resource_id: ResourceId, label: &str) -> bool {
        if self.bindings.contains_key(&resource_id) {
            tracing::error!(resource_id, "internal id bound twice to the same query");
            return false;
        }
        self.bindings.insert(resource_id, label.to_string());
        true
    }

    pub(crate) fn unbind(&mut self, resource_id: ResourceId) -> Unbind {
        match self.bindings.remove(&resource_id) {
            Some(_) => Unbind::Remaining(self.bindings.len()),
            None => Unbind::NotBound,
        }
    }

    pub(crate) fn holds(&self, resource_id: ResourceId) -> bool {
        self.bindings.contains_key(&resource_id)
    }

    pub(crate) fn bindings(&self) -> &BTreeMap<ResourceId, String> {
        &self.bindings
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

/// Completion signal of a pending load, shared by every caller that bound
/// to the query before the owner's callback returned.
pub(crate) type LoadWaiter = watch::Receiver<Option<LoadResponse>>;

#[derive(Debug)]
enum QueryState<Resp> {
    Pending(LoadWaiter),
    Satisfied { response: Resp, wire: LoadResponse },
}

/// How a newly bound caller obtains its response.
pub(crate) enum Reply {
    Ready(LoadResponse),
    Wait(LoadWaiter),
}

/// One distinct request satisfied (or being satisfied) by a resource server.
#[derive(Debug)]
pub(crate) struct ServerQuery<Req, Resp> {
    request: Req,
    resource_id: ResourceId,
    state: QueryState<Resp>,
    /// Internal id -> caller label. Holds the owner's own binding under
    /// `SELF_LABEL` plus every nested dependency acquired during the load.
    internal: BTreeMap<ResourceId, String>,
    /// External id -> status delivery address of the bound caller.
    external: BTreeMap<ResourceId, String>,
}

impl<Req: PartialEq, Resp: Clone> ServerQuery<Req, Resp> {
    pub(crate) fn pending(request: Req, resource_id: ResourceId, waiter: LoadWaiter) -> Self {
        let mut internal = BTreeMap::new();
        internal.insert(resource_id, SELF_LABEL.to_string());
        Self {
            request,
            resource_id,
            state: QueryState::Pending(waiter),
            internal,
            external: BTreeMap::new(),
        }
    }

    pub(crate) fn matches(&self, request: &Req) -> bool {
        self.request == *request
    }

    pub(crate) fn request(&self) -> &Req {
        &self.request
    }

    /// Internal id minted for this request.
    pub(crate) fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state, QueryState::Pending(_))
    }

    pub(crate) fn satisfy(&mut self, response: Resp, wire: LoadResponse) {
        self.state = QueryState::Satisfied { response, wire };
    }

    /// Owner response, once the load callback has returned.
    pub(crate) fn response(&self) -> Option<&Resp> {
        match &self.state {
            QueryState::Satisfied { response, .. } => Some(response),
            QueryState::Pending(_) => None,
        }
    }

    pub(crate) fn reply_for(&self, external_id: ResourceId) -> Reply {
        match &self.state {
            QueryState::Satisfied { wire, .. } => Reply::Ready(wire.with_resource_id(external_id)),
            QueryState::Pending(waiter) => Reply::Wait(waiter.clone()),
        }
    }

    pub(crate) fn bind_external(&mut self, external_id: ResourceId, status_address: &str) {
        self.external.insert(external_id, status_address.to_string());
    }

    pub(crate) fn unbind_external(&mut self, external_id: ResourceId) -> Unbind {
        match self.external.remove(&external_id) {
            Some(_) => Unbind::Remaining(self.external.len()),
            None => Unbind::NotBound,
        }
    }

    pub(crate) fn has_external(&self, external_id: ResourceId) -> bool {
        self.external.contains_key(&external_id)
    }

    pub(crate) fn external_bindings(&self) -> Vec<(ResourceId, String)> {
        self.external
            .iter()
            .map(|(id, address)| (*id, address.clone()))
            .collect()
    }

    pub(crate) fn bind_internal(&mut self, resource_id: ResourceId, label: &str) -> bool {
        if self.internal.contains_key(&resource_id) {
            tracing::error!(resource_id, "internal id bound twice to the same query");
            return false;
        }
        self.internal.insert(resource_id, label.to_string());
        true
    }

    pub(crate) fn holds_internal(&self, resource_id: ResourceId) -> bool {
        self.internal.contains_key(&resource_id)
    }

    /// Internal bindings subject to cascade unload.
    pub(crate) fn dependencies(&self) -> Vec<ResourceId> {
        self.internal
            .iter()
            .filter(|(_, label)| label.as_str() != SELF_LABEL)
            .map(|(id, _)| *id)
            .collect()
    }
}

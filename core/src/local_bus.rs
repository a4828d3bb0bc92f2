//! In-process [`Transport`] connecting managers that live in one runtime.
//!
//! Every bound server gets its own pool of worker tasks draining a bounded
//! job queue, so a load callback that calls further servers (including
//! servers of its own manager) never waits on the queue it is running from.
//! Callers that join a load already in flight wait on their own task, never
//! on a pool worker. Status pushes are delivered inline on the pushing task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rmp_protocol::LoadRequest;
use rmp_protocol::LoadResponse;
use rmp_protocol::StatusMessage;
use rmp_protocol::UnloadRequest;
use rmp_protocol::UnloadResponse;
use tokio::sync::Mutex;
use tokio::sync::oneshot;

use crate::config::BusConfig;
use crate::error::TransportError;
use crate::transport::LoadAnswer;
use crate::transport::ServerEndpoint;
use crate::transport::StatusSink;
use crate::transport::Transport;

enum Job {
    Load {
        request: LoadRequest,
        reply: oneshot::Sender<LoadResponse>,
    },
    Unload {
        request: UnloadRequest,
        reply: oneshot::Sender<UnloadResponse>,
    },
}

struct ServerQueue {
    jobs: async_channel::Sender<Job>,
}

type ServerKey = (String, String);

pub struct LocalBus {
    config: BusConfig,
    servers: Mutex<HashMap<ServerKey, ServerQueue>>,
    sinks: Mutex<HashMap<String, Arc<dyn StatusSink>>>,
}

impl LocalBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            servers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Servers currently bound, as `"<manager>/<server>"`, sorted.
    pub async fn bound_servers(&self) -> Vec<String> {
        let servers = self.servers.lock().await;
        let mut names: Vec<String> = servers
            .keys()
            .map(|(manager, server)| format!("{manager}/{server}"))
            .collect();
        names.sort();
        names
    }

    async fn queue(
        &self,
        manager: &str,
        server: &str,
    ) -> Result<async_channel::Sender<Job>, TransportError> {
        let servers = self.servers.lock().await;
        servers
            .get(&(manager.to_string(), server.to_string()))
            .map(|queue| queue.jobs.clone())
            .ok_or_else(|| TransportError::Unreachable {
                address: format!("{manager}/{server}"),
            })
    }

    async fn submit<T>(
        &self,
        manager: &str,
        server: &str,
        job: Job,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, TransportError> {
        let address = format!("{manager}/{server}");
        let jobs = self.queue(manager, server).await?;
        if jobs.send(job).await.is_err() {
            return Err(TransportError::Closed { address });
        }
        reply.await.map_err(|_| TransportError::Dropped { address })
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn run_worker(endpoint: Arc<dyn ServerEndpoint>, jobs: async_channel::Receiver<Job>) {
    while let Ok(job) = jobs.recv().await {
        match job {
            Job::Load { request, reply } => match endpoint.load(request).await {
                LoadAnswer::Ready(response) => answer(endpoint.name(), reply, response),
                LoadAnswer::Joined(joined) => {
                    let server = endpoint.name().to_string();
                    tokio::spawn(async move {
                        let response = joined.await;
                        answer(&server, reply, response);
                    });
                }
            },
            Job::Unload { request, reply } => {
                let response = endpoint.unload(request).await;
                if reply.send(response).is_err() {
                    tracing::debug!(server = endpoint.name(), "unload caller went away");
                }
            }
        }
    }
    tracing::debug!(server = endpoint.name(), "worker exiting");
}

fn answer(server: &str, reply: oneshot::Sender<LoadResponse>, response: LoadResponse) {
    if reply.send(response).is_err() {
        tracing::debug!(server, "load caller went away");
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn bind_server(
        &self,
        manager: &str,
        endpoint: Arc<dyn ServerEndpoint>,
    ) -> Result<(), TransportError> {
        let key = (manager.to_string(), endpoint.name().to_string());
        let mut servers = self.servers.lock().await;
        if servers.contains_key(&key) {
            return Err(TransportError::AlreadyBound {
                address: format!("{}/{}", key.0, key.1),
            });
        }

        let (tx, rx) = async_channel::bounded(self.config.queue_capacity);
        for _ in 0..self.config.workers_per_server {
            tokio::spawn(run_worker(Arc::clone(&endpoint), rx.clone()));
        }
        tracing::info!(
            manager,
            server = endpoint.name(),
            workers = self.config.workers_per_server,
            "server bound"
        );
        servers.insert(key, ServerQueue { jobs: tx });
        Ok(())
    }

    async fn bind_status(
        &self,
        address: &str,
        sink: Arc<dyn StatusSink>,
    ) -> Result<(), TransportError> {
        let mut sinks = self.sinks.lock().await;
        if sinks.contains_key(address) {
            return Err(TransportError::AlreadyBound {
                address: address.to_string(),
            });
        }
        sinks.insert(address.to_string(), sink);
        Ok(())
    }

    async fn unbind_manager(&self, manager: &str) {
        {
            let mut servers = self.servers.lock().await;
            servers.retain(|(owner, server), queue| {
                if owner != manager {
                    return true;
                }
                tracing::info!(manager, server = %server, "server unbound");
                queue.jobs.close();
                false
            });
        }
        self.sinks
            .lock()
            .await
            .remove(&rmp_protocol::status_address(manager));
    }

    async fn load(
        &self,
        manager: &str,
        server: &str,
        request: LoadRequest,
    ) -> Result<LoadResponse, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.submit(manager, server, Job::Load { request, reply }, rx)
            .await
    }

    async fn unload(
        &self,
        manager: &str,
        request: UnloadRequest,
    ) -> Result<UnloadResponse, TransportError> {
        let server = request.server_name.clone();
        let (reply, rx) = oneshot::channel();
        self.submit(manager, &server, Job::Unload { request, reply }, rx)
            .await
    }

    async fn push_status(&self, address: &str, status: StatusMessage) -> Result<(), TransportError> {
        let sink = self.sinks.lock().await.get(address).cloned();
        match sink {
            Some(sink) => {
                sink.deliver(status).await;
                Ok(())
            }
            None => Err(TransportError::Unreachable {
                address: address.to_string(),
            }),
        }
    }
}

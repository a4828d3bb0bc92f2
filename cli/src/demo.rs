//! Demo components: a process manager that "launches" driver executables
//! and a sensor manager whose sensors each need a driver process.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use rmp_core::LoadContext;
use rmp_core::ResourceHandler;
use rmp_core::protocol::CODE_FAILED;
use rmp_core::protocol::ErrorStack;
use rmp_core::protocol::ResourceId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;

pub const PROCESS_MANAGER: &str = "process_manager";
pub const LOAD_PROCESS: &str = "load_process";
pub const SENSOR_MANAGER: &str = "sensor_manager";
pub const START_SENSOR: &str = "start_sensor";

/// Error code a driver launch reports when the executable is refused.
const EXEC_FAILED: i32 = 2;

/// Owner callback log shared by every demo component.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub async fn push(&self, event: String) {
        tracing::debug!("{event}");
        self.0.lock().await.push(event);
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.0.lock().await.clone()
    }

    pub async fn count_prefix(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .await
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub executable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub pid: u32,
}

pub struct ProcessLauncher {
    log: EventLog,
    next_pid: AtomicU32,
    /// Executables that refuse to start.
    broken: Vec<String>,
    launched: Mutex<Vec<(String, ResourceId)>>,
}

impl ProcessLauncher {
    pub fn new(log: &EventLog, broken: Vec<String>) -> Self {
        Self {
            log: log.clone(),
            next_pid: AtomicU32::new(4100),
            broken,
            launched: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ResourceHandler for ProcessLauncher {
    type Request = LaunchRequest;
    type Response = LaunchResponse;

    async fn load(
        &self,
        ctx: &LoadContext,
        request: &LaunchRequest,
    ) -> Result<LaunchResponse, ErrorStack> {
        if self.broken.contains(&request.executable) {
            self.log
                .push(format!("refuse {}", request.executable))
                .await;
            return Err(ErrorStack::from_message(
                EXEC_FAILED,
                PROCESS_MANAGER,
                format!("{}: exec format error", request.executable),
            ));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.launched
            .lock()
            .await
            .push((request.executable.clone(), ctx.resource_id()));
        self.log
            .push(format!("launch {} pid={pid}", request.executable))
            .await;
        Ok(LaunchResponse { pid })
    }

    async fn unload(
        &self,
        _resource_id: ResourceId,
        request: &LaunchRequest,
        response: &LaunchResponse,
    ) {
        self.launched
            .lock()
            .await
            .retain(|(executable, _)| executable != &request.executable);
        self.log
            .push(format!("kill {} pid={}", request.executable, response.pid))
            .await;
    }
}

/// Resource id under which `executable` is currently served, if running.
pub async fn running_process(
    launcher: &Arc<ProcessLauncher>,
    executable: &str,
) -> Option<ResourceId> {
    launcher
        .launched
        .lock()
        .await
        .iter()
        .find(|(name, _)| name == executable)
        .map(|(_, id)| *id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRequest {
    pub sensor_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorResponse {
    pub topic: String,
    pub driver_pid: u32,
}

pub struct SensorStarter {
    log: EventLog,
}

impl SensorStarter {
    pub fn new(log: &EventLog) -> Self {
        Self { log: log.clone() }
    }
}

#[async_trait]
impl ResourceHandler for SensorStarter {
    type Request = SensorRequest;
    type Response = SensorResponse;

    async fn load(
        &self,
        ctx: &LoadContext,
        request: &SensorRequest,
    ) -> Result<SensorResponse, ErrorStack> {
        self.log
            .push(format!("start sensor {}", request.sensor_type))
            .await;
        let driver = LaunchRequest {
            executable: format!("{}_driver", request.sensor_type),
        };
        let launched = ctx
            .call::<_, LaunchResponse>(PROCESS_MANAGER, LOAD_PROCESS, &driver)
            .await
            .map_err(|err| {
                let stack = match err.error_stack() {
                    Some(stack) => stack.clone(),
                    None => ErrorStack::from_message(CODE_FAILED, SENSOR_MANAGER, err.to_string()),
                };
                stack.forward(
                    SENSOR_MANAGER,
                    format!("sensor {} has no driver", request.sensor_type),
                )
            })?;
        Ok(SensorResponse {
            topic: format!("/{}/data", request.sensor_type),
            driver_pid: launched.response.pid,
        })
    }

    async fn unload(
        &self,
        _resource_id: ResourceId,
        request: &SensorRequest,
        _response: &SensorResponse,
    ) {
        self.log
            .push(format!("stop sensor {}", request.sensor_type))
            .await;
    }
}

//! End-to-end protocol scenarios run against the in-process bus.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use rmp_core::Loaded;
use rmp_core::LocalBus;
use rmp_core::ResourceManager;
use rmp_core::RmpConfig;
use rmp_core::StatusDelivery;
use rmp_core::Transport;
use rmp_core::protocol::StatusMessage;

use crate::demo::EventLog;
use crate::demo::LOAD_PROCESS;
use crate::demo::PROCESS_MANAGER;
use crate::demo::ProcessLauncher;
use crate::demo::SENSOR_MANAGER;
use crate::demo::START_SENSOR;
use crate::demo::SensorRequest;
use crate::demo::SensorResponse;
use crate::demo::SensorStarter;
use crate::demo::running_process;

struct Demo {
    transport: Arc<dyn Transport>,
    log: EventLog,
    launcher: Arc<ProcessLauncher>,
    process: ResourceManager,
    sensors: ResourceManager,
}

impl Demo {
    async fn start(config: &RmpConfig, broken: &[&str]) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(LocalBus::new(config.bus.clone()));
        let log = EventLog::default();
        let launcher = Arc::new(ProcessLauncher::new(
            &log,
            broken.iter().map(ToString::to_string).collect(),
        ));

        let process = ResourceManager::new(PROCESS_MANAGER, Arc::clone(&transport)).await?;
        process
            .add_server(LOAD_PROCESS, Arc::clone(&launcher))
            .await?;
        let sensors = ResourceManager::new(SENSOR_MANAGER, Arc::clone(&transport)).await?;
        sensors
            .add_server(START_SENSOR, SensorStarter::new(&log))
            .await?;

        Ok(Self {
            transport,
            log,
            launcher,
            process,
            sensors,
        })
    }

    async fn consumer(&self, name: &str) -> anyhow::Result<ResourceManager> {
        Ok(ResourceManager::new(name, Arc::clone(&self.transport)).await?)
    }

    async fn stop(&self) {
        self.sensors.shutdown().await;
        self.process.shutdown().await;
    }
}

async fn start_sensor(
    consumer: &ResourceManager,
    sensor_type: &str,
) -> anyhow::Result<Loaded<SensorResponse>> {
    let request = SensorRequest {
        sensor_type: sensor_type.to_string(),
    };
    consumer
        .call(SENSOR_MANAGER, START_SENSOR, &request)
        .await
        .with_context(|| format!("{} could not start {sensor_type}", consumer.name()))
}

// ─────────────────────────────────────────────────────────────────────────────
// dedup
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupReport {
    pub consumers: usize,
    pub sensor_starts: usize,
    pub driver_launches: usize,
    pub sensor_stops: usize,
    pub driver_kills: usize,
}

impl fmt::Display for DedupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "consumers requesting camera: {}", self.consumers)?;
        writeln!(f, "sensor starts:   {}", self.sensor_starts)?;
        writeln!(f, "driver launches: {}", self.driver_launches)?;
        writeln!(f, "sensor stops:    {}", self.sensor_stops)?;
        write!(f, "driver kills:    {}", self.driver_kills)
    }
}

/// `consumers` components request the same camera concurrently, then all
/// release it.
pub async fn dedup(config: &RmpConfig, consumers: usize) -> anyhow::Result<DedupReport> {
    if consumers == 0 {
        bail!("at least one consumer is required");
    }
    let demo = Demo::start(config, &[]).await?;

    let mut tasks = Vec::with_capacity(consumers);
    for i in 0..consumers {
        let consumer = demo.consumer(&format!("consumer_{i}")).await?;
        tasks.push(tokio::spawn(async move {
            let loaded = start_sensor(&consumer, "camera").await;
            (consumer, loaded)
        }));
    }

    let mut held = Vec::with_capacity(consumers);
    for task in tasks {
        let (consumer, loaded) = task.await.context("consumer task panicked")?;
        let loaded = loaded?;
        tracing::info!(
            consumer = consumer.name(),
            resource_id = loaded.resource_id,
            topic = %loaded.response.topic,
            "camera acquired"
        );
        held.push((consumer, loaded.resource_id));
    }

    let sensor_starts = demo.log.count_prefix("start sensor").await;
    let driver_launches = demo.log.count_prefix("launch").await;
    for (consumer, resource_id) in &held {
        consumer.unload_client_resource(*resource_id).await?;
    }

    let report = DedupReport {
        consumers,
        sensor_starts,
        driver_launches,
        sensor_stops: demo.log.count_prefix("stop sensor").await,
        driver_kills: demo.log.count_prefix("kill").await,
    };
    demo.stop().await;
    Ok(report)
}

// ─────────────────────────────────────────────────────────────────────────────
// cascade
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    pub events: Vec<String>,
}

impl fmt::Display for CascadeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:>2}. {event}", i + 1)?;
        }
        Ok(())
    }
}

/// A navigation component starts two sensors, each of which launches its
/// driver, then releases them one by one.
pub async fn cascade(config: &RmpConfig) -> anyhow::Result<CascadeReport> {
    let demo = Demo::start(config, &[]).await?;
    let navigation = demo.consumer("navigation").await?;

    let camera = start_sensor(&navigation, "camera").await?;
    let lidar = start_sensor(&navigation, "lidar").await?;
    navigation
        .unload_client_resource(camera.resource_id)
        .await?;
    navigation
        .unload_client_resource(lidar.resource_id)
        .await?;

    let events = demo.log.snapshot().await;
    demo.stop().await;
    Ok(CascadeReport { events })
}

// ─────────────────────────────────────────────────────────────────────────────
// failure
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub load_error: String,
    pub recoverable: bool,
    pub delivery: StatusDelivery,
    pub flagged: usize,
    pub consumers: usize,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "thermal start failed (recoverable: {}):", self.recoverable)?;
        writeln!(f, "{}", self.load_error)?;
        writeln!(
            f,
            "camera driver crash: {} of {} deliveries failed",
            self.delivery.failed, self.delivery.attempted
        )?;
        write!(
            f,
            "consumers seeing a failed camera: {}/{}",
            self.flagged, self.consumers
        )
    }
}

/// A sensor whose driver refuses to start, then a running driver that
/// crashes under two consumers.
pub async fn failure(config: &RmpConfig) -> anyhow::Result<FailureReport> {
    let demo = Demo::start(config, &["thermal_driver"]).await?;
    let planner = demo.consumer("planner").await?;
    let (load_error, recoverable) = match planner
        .call::<_, SensorResponse>(
            SENSOR_MANAGER,
            START_SENSOR,
            &SensorRequest {
                sensor_type: "thermal".to_string(),
            },
        )
        .await
    {
        Ok(_) => bail!("thermal sensor started with a broken driver"),
        Err(err) => {
            let detail = match err.error_stack() {
                Some(stack) => stack.to_string(),
                None => err.to_string(),
            };
            (detail, err.is_recoverable())
        }
    };

    let mut held = Vec::new();
    for name in ["planner", "recorder"] {
        let consumer = if name == "planner" {
            planner.clone()
        } else {
            demo.consumer(name).await?
        };
        let loaded = start_sensor(&consumer, "camera").await?;
        held.push((consumer, loaded.resource_id));
    }

    let Some(driver) = running_process(&demo.launcher, "camera_driver").await else {
        bail!("camera driver is not running");
    };
    let delivery = demo
        .process
        .send_status(driver, StatusMessage::failed(driver, "camera_driver crashed"))
        .await?;

    let mut flagged = 0;
    for (consumer, resource_id) in &held {
        if consumer.has_failed(*resource_id).await {
            flagged += 1;
        }
    }

    for (consumer, _) in &held {
        consumer.shutdown().await;
    }
    demo.stop().await;
    Ok(FailureReport {
        load_error,
        recoverable,
        delivery,
        flagged,
        consumers: held.len(),
    })
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rmp_core::BusConfig;
use rmp_core::LoadContext;
use rmp_core::Loaded;
use rmp_core::LocalBus;
use rmp_core::ResourceHandler;
use rmp_core::ResourceManager;
use rmp_core::RmpError;
use rmp_core::Transport;
use rmp_core::protocol::ErrorStack;
use rmp_core::protocol::ResourceId;

use super::support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_releases_everything_the_component_acquired() {
    let world = World::with_driver(Driver::Dependency).await;
    let x = world.consumer("x").await;

    for sensor in ["camera", "lidar"] {
        let _: Loaded<SensorResponse> = x
            .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of(sensor))
            .await
            .unwrap();
    }
    let _: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap();

    x.shutdown().await;

    assert_eq!(world.journal.count("unload sensor camera"), 1);
    assert_eq!(world.journal.count("unload sensor lidar"), 1);
    assert_eq!(world.journal.count("unload process camera_driver"), 1);
    assert_eq!(world.journal.count("unload process lidar_driver"), 1);
    assert_eq!(world.sensors.server_query_count(START_SENSOR).await, Some(0));
    assert!(x.client_bindings().await.is_empty());

    let err = x
        .call::<_, SensorResponse>(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap_err();
    assert!(matches!(err, RmpError::ManagerShutDown(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shut_down_servers_become_unreachable() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;

    world.sensors.shutdown().await;
    assert!(!world.sensors.has_server(START_SENSOR).await);
    assert_eq!(world.sensors.server_query_count(START_SENSOR).await, None);

    let err = x
        .call::<_, SensorResponse>(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap_err();
    assert!(matches!(err, RmpError::Transport(_)));
}

#[tokio::test]
async fn server_names_are_unique_per_manager() {
    let world = World::with_driver(Driver::None).await;
    assert!(world.sensors.has_server(START_SENSOR).await);

    let err = world
        .sensors
        .add_server(
            START_SENSOR,
            SensorHandler {
                journal: world.journal.clone(),
                driver: Driver::None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RmpError::DuplicateServer(_)));
}

#[tokio::test]
async fn manager_names_are_unique_per_bus() {
    let bus: Arc<dyn Transport> = Arc::new(LocalBus::default());
    let first = ResourceManager::new("sensor_manager", Arc::clone(&bus)).await;
    assert!(first.is_ok());
    let second = ResourceManager::new("sensor_manager", bus).await;
    assert!(matches!(second, Err(RmpError::Transport(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_pools_still_serve_nested_calls() {
    let bus: Arc<dyn Transport> = Arc::new(LocalBus::new(BusConfig {
        workers_per_server: 1,
        queue_capacity: 1,
    }));
    let journal = Journal::default();

    let process = ResourceManager::new(PROCESS_MANAGER, Arc::clone(&bus))
        .await
        .unwrap();
    process
        .add_server(LOAD_PROCESS, ProcessHandler::new(&journal))
        .await
        .unwrap();
    let sensors = ResourceManager::new(SENSOR_MANAGER, Arc::clone(&bus))
        .await
        .unwrap();
    sensors
        .add_server(
            START_SENSOR,
            SensorHandler {
                journal: journal.clone(),
                driver: Driver::Dependency,
            },
        )
        .await
        .unwrap();

    let x = ResourceManager::new("x", bus).await.unwrap();
    let camera: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap();
    assert_eq!(camera.response.driver_pid, Some(1000));

    x.unload_client_resource(camera.resource_id).await.unwrap();
    assert_eq!(journal.count("unload process camera_driver"), 1);
}

const COUNTDOWN: &str = "countdown";

/// Loading `n` takes a moment and then loads `n - 1` from the same server.
struct Countdown {
    journal: Journal,
}

#[async_trait]
impl ResourceHandler for Countdown {
    type Request = u32;
    type Response = u32;

    async fn load(&self, ctx: &LoadContext, depth: &u32) -> Result<u32, ErrorStack> {
        self.journal.record(format!("load countdown {depth}"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        if *depth == 0 {
            return Ok(0);
        }
        let nested = ctx
            .call::<_, u32>(ctx.manager().name(), COUNTDOWN, &(depth - 1))
            .await
            .map_err(|err| ErrorStack::from_message(1, COUNTDOWN, err.to_string()))?;
        Ok(nested.response + 1)
    }

    async fn unload(&self, _resource_id: ResourceId, depth: &u32, _response: &u32) {
        self.journal.record(format!("unload countdown {depth}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callers_joining_a_pending_load_leave_workers_for_nested_calls() {
    let bus: Arc<dyn Transport> = Arc::new(LocalBus::default());
    let journal = Journal::default();
    let planner = ResourceManager::new("planner", Arc::clone(&bus))
        .await
        .unwrap();
    planner
        .add_server(
            COUNTDOWN,
            Countdown {
                journal: journal.clone(),
            },
        )
        .await
        .unwrap();

    // As many equal callers as the default pool has workers.
    let mut handles = Vec::new();
    for i in 0..BusConfig::default().workers_per_server {
        let consumer = ResourceManager::new(&format!("consumer_{i}"), Arc::clone(&bus))
            .await
            .unwrap();
        handles.push(tokio::spawn(async move {
            let loaded = consumer.call::<_, u32>("planner", COUNTDOWN, &1u32).await;
            (consumer, loaded)
        }));
    }

    let mut held = Vec::new();
    for handle in handles {
        let (consumer, loaded) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("equal callers of a re-entrant load never completed")
            .unwrap();
        let loaded = loaded.unwrap();
        assert_eq!(loaded.response, 1);
        held.push((consumer, loaded.resource_id));
    }
    assert_eq!(journal.count("load countdown 1"), 1);
    assert_eq!(journal.count("load countdown 0"), 1);

    for (consumer, resource_id) in &held {
        consumer.unload_client_resource(*resource_id).await.unwrap();
    }
    assert_eq!(
        journal.events()[2..].to_vec(),
        vec![
            "unload countdown 1".to_string(),
            "unload countdown 0".to_string(),
        ]
    );
}

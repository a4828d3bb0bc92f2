use std::collections::HashSet;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rmp_core::Loaded;

use super::support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equal_requests_from_different_callers_load_once() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;
    let y = world.consumer("y").await;

    let from_x: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap();
    let from_y: Loaded<SensorResponse> = y
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap();

    assert_eq!(world.journal.count("load sensor camera"), 1);
    assert_eq!(from_x.response, from_y.response);
    assert_eq!(from_x.response.topic, "/camera/data");
    assert_eq!(world.sensors.server_query_count(START_SENSOR).await, Some(1));

    x.unload_client_resource(from_x.resource_id).await.unwrap();
    assert_eq!(world.journal.count("unload sensor camera"), 0);
    y.unload_client_resource(from_y.resource_id).await.unwrap();
    assert_eq!(world.journal.count("unload sensor camera"), 1);
    assert_eq!(world.sensors.server_query_count(START_SENSOR).await, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_calls_from_one_caller_hit_the_client_cache() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let loaded: Loaded<SensorResponse> = x
            .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("lidar"))
            .await
            .unwrap();
        ids.push(loaded.resource_id);
    }

    assert_eq!(world.bus.loads(), 1);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(x.client_bindings().await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_requests_get_distinct_resources() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;

    let camera: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap();
    let lidar: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("lidar"))
        .await
        .unwrap();

    assert_eq!(world.bus.loads(), 2);
    assert_ne!(camera.response, lidar.response);
    assert_eq!(world.sensors.server_query_count(START_SENSOR).await, Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_equal_requests_wait_for_the_pending_load() {
    let journal = Journal::default();
    let world = World::new(
        ProcessHandler::new(&journal).with_delay(Duration::from_millis(100)),
        Driver::None,
    )
    .await;
    let x = world.consumer("x").await;
    let request = ProcessRequest {
        executable: "camera_driver".to_string(),
    };

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let x = x.clone();
            let request = request.clone();
            tokio::spawn(async move {
                x.call::<_, ProcessResponse>(PROCESS_MANAGER, LOAD_PROCESS, &request)
                    .await
            })
        })
        .collect();

    let mut loaded = Vec::new();
    for handle in handles {
        loaded.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(journal.count("load process camera_driver"), 1);
    let pids: HashSet<u32> = loaded.iter().map(|l| l.response.pid).collect();
    assert_eq!(pids.len(), 1);
    let ids: HashSet<_> = loaded.iter().map(|l| l.resource_id).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(world.process.server_query_count(LOAD_PROCESS).await, Some(1));
    // The client keeps one remote binding and releases each redundant one.
    assert_eq!(world.bus.unloads(), world.bus.loads() - 1);

    for l in &loaded {
        x.unload_client_resource(l.resource_id).await.unwrap();
    }
    assert_eq!(world.bus.unloads(), world.bus.loads());
    assert_eq!(journal.count("unload process camera_driver"), 1);
    assert_eq!(world.process.server_query_count(LOAD_PROCESS).await, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_of_n_unloads_triggers_teardown() {
    let world = World::with_driver(Driver::None).await;
    let mut holders = Vec::new();
    for i in 0..5 {
        let consumer = world.consumer(&format!("consumer_{i}")).await;
        let loaded: Loaded<SensorResponse> = consumer
            .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("imu"))
            .await
            .unwrap();
        holders.push((consumer, loaded.resource_id));
    }

    let (last, last_id) = holders.pop().unwrap();
    for (consumer, resource_id) in &holders {
        consumer.unload_client_resource(*resource_id).await.unwrap();
        assert_eq!(world.journal.count("unload sensor imu"), 0);
    }
    last.unload_client_resource(last_id).await.unwrap();
    assert_eq!(world.journal.count("load sensor imu"), 1);
    assert_eq!(world.journal.count("unload sensor imu"), 1);
}

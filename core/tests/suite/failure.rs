use std::time::Duration;

use pretty_assertions::assert_eq;
use rmp_core::Loaded;
use rmp_core::RmpError;
use rmp_core::Transport;
use rmp_core::protocol::UnloadRequest;

use super::support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn application_failure_is_recoverable_and_leaves_no_query() {
    let journal = Journal::default();
    let world = World::new(ProcessHandler::new(&journal).failing(), Driver::None).await;
    let x = world.consumer("x").await;

    let err = x
        .call::<_, ProcessResponse>(
            PROCESS_MANAGER,
            LOAD_PROCESS,
            &ProcessRequest {
                executable: "missing".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert!(err.is_recoverable());
    let stack = err.error_stack().unwrap();
    assert_eq!(stack.root().unwrap().message, "cannot exec missing");
    assert_eq!(stack.root().unwrap().code, 2);
    assert_eq!(world.process.server_query_count(LOAD_PROCESS).await, Some(0));
    assert!(x.client_bindings().await.is_empty());
    // The owner never saw a successful load, so it is not asked to unload.
    assert_eq!(journal.count("unload process missing"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nested_failure_surfaces_the_whole_stack() {
    let journal = Journal::default();
    let world = World::new(ProcessHandler::new(&journal).failing(), Driver::Dependency).await;
    let x = world.consumer("x").await;

    let err = x
        .call::<_, SensorResponse>(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap_err();

    let RmpError::Application { server, stack } = &err else {
        panic!("expected an application failure, got {err}");
    };
    assert_eq!(server, &format!("{SENSOR_MANAGER}/{START_SENSOR}"));
    assert_eq!(stack.root().unwrap().subsystem, PROCESS_MANAGER);
    assert!(stack.len() >= 3, "stack too short:\n{stack}");
    assert!(
        stack
            .frames()
            .iter()
            .any(|frame| frame.message == "driver did not start")
    );

    assert_eq!(world.sensors.server_query_count(START_SENSOR).await, Some(0));
    assert_eq!(world.process.server_query_count(LOAD_PROCESS).await, Some(0));
    assert!(world.sensors.client_bindings().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_server_is_a_hard_error() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;

    let err = x
        .call::<_, SensorResponse>("nobody", START_SENSOR, &SensorRequest::of("camera"))
        .await
        .unwrap_err();
    assert!(matches!(err, RmpError::Transport(_)));
    assert!(!err.is_recoverable());
    assert!(x.client_bindings().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unload_racing_a_pending_load_fails_the_caller_and_releases_the_resource() {
    let journal = Journal::default();
    let world = World::new(
        ProcessHandler::new(&journal).with_delay(Duration::from_millis(200)),
        Driver::None,
    )
    .await;
    let x = world.consumer("x").await;

    let pending = tokio::spawn({
        let x = x.clone();
        async move {
            x.call::<_, ProcessResponse>(
                PROCESS_MANAGER,
                LOAD_PROCESS,
                &ProcessRequest {
                    executable: "slow".to_string(),
                },
            )
            .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The first caller of a fresh server is always external id 1.
    let released = world
        .bus
        .unload(
            PROCESS_MANAGER,
            UnloadRequest {
                server_name: LOAD_PROCESS.to_string(),
                resource_id: 1,
            },
        )
        .await
        .unwrap();
    assert!(released.is_ok());
    assert_eq!(world.process.server_query_count(LOAD_PROCESS).await, Some(0));

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(
        journal.events(),
        vec!["load process slow".to_string(), "unload process slow".to_string()]
    );
    assert!(x.client_bindings().await.is_empty());
}

#[tokio::test]
async fn stale_unload_is_answered_with_failure() {
    let world = World::with_driver(Driver::None).await;
    let response = world
        .bus
        .unload(
            SENSOR_MANAGER,
            UnloadRequest {
                server_name: START_SENSOR.to_string(),
                resource_id: 42,
            },
        )
        .await
        .unwrap();
    assert!(!response.is_ok());
    assert!(response.message.contains("42"));
}

#[tokio::test]
async fn unloading_an_unknown_binding_is_an_error() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;
    let err = x.unload_client_resource(7).await.unwrap_err();
    assert!(matches!(err, RmpError::UnknownResource(7)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payload_of_the_wrong_shape_is_rejected_by_the_server() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;

    let err = x
        .call::<_, SensorResponse>(
            SENSOR_MANAGER,
            START_SENSOR,
            &serde_json::json!({ "executable": "camera_driver" }),
        )
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(world.journal.events(), Vec::<String>::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn released_resource_is_loaded_afresh() {
    let world = World::with_driver(Driver::None).await;
    let x = world.consumer("x").await;

    let first: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("radar"))
        .await
        .unwrap();
    x.unload_client_resource(first.resource_id).await.unwrap();
    let second: Loaded<SensorResponse> = x
        .call(SENSOR_MANAGER, START_SENSOR, &SensorRequest::of("radar"))
        .await
        .unwrap();

    assert_eq!(world.journal.count("load sensor radar"), 2);
    assert_eq!(first.response, second.response);
    assert_ne!(first.resource_id, second.resource_id);
}

use std::sync::Arc;
use std::time::Duration;

use svcql_core::cache::{ExecutorCache, WindowKey};
use svcql_core::execution::QueryOrchestrator;
use svcql_core::protocol::{ControlCommand, send_control_command, serve_control_request};
use svcql_core::protocol::control::write_string_async;
use svcql_core::streaming::WindowConfig;
use svcql_core::testutil;

async fn send(cache: &Arc<ExecutorCache>, command: &ControlCommand) -> Option<bool> {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let cache = cache.clone();
    let serve = tokio::spawn(async move { serve_control_request(&cache, &mut server).await });
    let reply = send_control_command(&mut client, command).await.unwrap();
    serve.await.unwrap().unwrap();
    reply
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_running_stream_query() {
    let cache = Arc::new(ExecutorCache::default());
    let window = WindowConfig::rows(10_000);
    let orchestrator = QueryOrchestrator::builder(
        "SELECT * FROM sales",
        testutil::sales_stream_service(),
        cache.clone(),
    )
    .id("long_running")
    .source_graph(testutil::sales_stream_graph(Duration::from_millis(2)))
    .window(window)
    .build()
    .unwrap();
    let manager = orchestrator.window_manager().unwrap().clone();

    let running = orchestrator.clone();
    let query = tokio::task::spawn_blocking(move || running.execute_binary(Vec::new()));
    let key = WindowKey::new(manager.key().clone(), window);
    while cache.window(&key).map(|p| p.subscriber_count()) != Some(1) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let errors = ControlCommand::Errors("long_running".to_string());
    assert_eq!(Some(false), send(&cache, &errors).await);

    let stop = ControlCommand::Stop("long_running".to_string());
    assert_eq!(Some(true), send(&cache, &stop).await);
    query.await.unwrap().unwrap();
    assert!(cache.executor("long_running").is_none());

    // Gone from the cache, so both commands now report false.
    assert_eq!(Some(false), send(&cache, &stop).await);
    assert_eq!(Some(false), send(&cache, &errors).await);

    cache.remove_window_manager(manager.key());
}

#[tokio::test]
async fn unknown_verb_gets_no_reply() {
    let cache = Arc::new(ExecutorCache::default());
    let (mut client, mut server) = tokio::io::duplex(1024);
    let serve_cache = cache.clone();
    let serve = tokio::spawn(async move {
        let reply = serve_control_request(&serve_cache, &mut server).await;
        drop(server);
        reply
    });

    write_string_async(&mut client, "[ restart q1 ]").await.unwrap();
    assert_eq!(None, serve.await.unwrap().unwrap());
}

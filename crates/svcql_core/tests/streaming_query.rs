use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use svcql_core::cache::{ExecutorCache, WindowKey};
use svcql_core::execution::QueryOrchestrator;
use svcql_core::graph::ExecutionGraph;
use svcql_core::protocol::RowStreamReader;
use svcql_core::streaming::WindowConfig;
use svcql_core::testutil;
use svcql_core::types::{Row, ScalarValue};

fn stream_query(
    sql: &str,
    cache: &Arc<ExecutorCache>,
    window: WindowConfig,
) -> Arc<QueryOrchestrator> {
    QueryOrchestrator::builder(sql, testutil::sales_stream_service(), cache.clone())
        .source_graph(testutil::sales_stream_graph(Duration::from_millis(2)))
        .window(window)
        .build()
        .unwrap()
}

fn feed_query(
    cache: &Arc<ExecutorCache>,
    feed: &Arc<dyn ExecutionGraph>,
    window: WindowConfig,
) -> Arc<QueryOrchestrator> {
    QueryOrchestrator::builder("SELECT * FROM sales", testutil::sales_stream_service(), cache.clone())
        .source_graph(feed.clone())
        .window(window)
        .build()
        .unwrap()
}

fn wait_for_subscriber(cache: &ExecutorCache, orchestrator: &QueryOrchestrator, window: WindowConfig) {
    let key = WindowKey::new(orchestrator.window_manager().unwrap().key().clone(), window);
    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.window(&key).map(|p| p.subscriber_count()) != Some(1) {
        assert!(Instant::now() < deadline, "query never subscribed to its window");
        thread::sleep(Duration::from_millis(5));
    }
}

fn rows(orchestrator: &QueryOrchestrator) -> Vec<Row> {
    let bytes = orchestrator.execute_binary(Vec::new()).unwrap();
    let mut reader = RowStreamReader::new(bytes.as_slice());
    reader.read_preamble().unwrap();
    reader.read_to_end().unwrap().rows
}

#[test]
fn queries_share_stream_and_window() {
    let cache = Arc::new(ExecutorCache::default());
    let first = stream_query("SELECT region, amount FROM sales", &cache, WindowConfig::rows(4));
    let second = stream_query("SELECT amount FROM sales", &cache, WindowConfig::rows(4));

    let manager = first.window_manager().unwrap().clone();
    assert!(Arc::ptr_eq(&manager, second.window_manager().unwrap()));
    assert!(Arc::ptr_eq(manager.source_graph(), second.source_graph()));
    assert_eq!(1, cache.window_manager_count());

    assert_eq!(4, rows(&first).len());
    // The second query picks up the window the first one received.
    let second_rows = rows(&second);
    assert_eq!(4, second_rows.len());
    assert_eq!(1, cache.window_count());

    // Finishing a query leaves the shared stream running.
    assert!(manager.source_graph().is_running());

    cache.remove_window_manager(manager.key());
    manager.source_graph().wait_until_finished().unwrap();
    assert_eq!(0, cache.window_count());
}

#[test]
fn parameters_select_separate_streams() {
    let cache = Arc::new(ExecutorCache::default());
    let eu = stream_query(
        "SELECT region, amount FROM sales WHERE PARAMETER('region') = 'EU'",
        &cache,
        WindowConfig::rows(3),
    );
    let all = stream_query("SELECT region FROM sales", &cache, WindowConfig::rows(3));
    assert!(!Arc::ptr_eq(
        eu.window_manager().unwrap(),
        all.window_manager().unwrap()
    ));
    assert_eq!(2, cache.window_manager_count());

    let eu_rows = rows(&eu);
    assert_eq!(3, eu_rows.len());
    for row in &eu_rows {
        assert_eq!(ScalarValue::from("EU"), row[0]);
    }

    for orchestrator in [&eu, &all] {
        let manager = orchestrator.window_manager().unwrap().clone();
        cache.remove_window_manager(manager.key());
    }
    assert_eq!(0, cache.window_manager_count());
}

#[test]
fn window_limit_and_sql_filter() {
    let cache = Arc::new(ExecutorCache::default());
    let orchestrator = stream_query(
        "SELECT amount FROM sales WHERE amount >= 20",
        &cache,
        WindowConfig::rows(8).with_limit(4),
    );
    let rows = rows(&orchestrator);
    // Four rows of the cycle hold one US and one EU row above the bar.
    assert_eq!(2, rows.len());
    for row in rows {
        assert!(matches!(row[0], ScalarValue::Integer(n) if n >= 20));
    }

    let manager = orchestrator.window_manager().unwrap().clone();
    cache.remove_window_manager(manager.key());
}

#[test]
fn stopping_stream_query_leaves_source_running() {
    let cache = Arc::new(ExecutorCache::default());
    let window = WindowConfig::rows(10_000);
    let orchestrator = stream_query("SELECT * FROM sales", &cache, window);
    let manager = orchestrator.window_manager().unwrap().clone();

    let running = orchestrator.clone();
    let handle = thread::spawn(move || running.execute_binary(Vec::new()));
    wait_for_subscriber(&cache, &orchestrator, window);
    orchestrator.stop();
    let bytes = handle.join().unwrap().unwrap();

    // The stopped query no longer waits on the publisher.
    let key = WindowKey::new(manager.key().clone(), window);
    assert_eq!(Some(0), cache.window(&key).map(|p| p.subscriber_count()));

    let mut reader = RowStreamReader::new(bytes.as_slice());
    reader.read_preamble().unwrap();
    let result = reader.read_to_end().unwrap();
    assert!(result.schema.is_some());
    assert!(result.rows.is_empty());
    assert!(orchestrator.generated_graph().is_stopped());
    assert!(manager.source_graph().is_running());
    cache.remove_window_manager(manager.key());
}

#[test]
fn finished_stream_releases_waiting_query() {
    let cache = Arc::new(ExecutorCache::default());
    let feed = testutil::sales_feed_graph(16);
    let window = WindowConfig::rows(10);
    let orchestrator = feed_query(&cache, &feed, window);

    let running = orchestrator.clone();
    let handle = thread::spawn(move || rows(&running));
    wait_for_subscriber(&cache, &orchestrator, window);

    feed.row_producer(testutil::SALES_STEP).unwrap().finish();
    assert!(handle.join().unwrap().is_empty());
    assert!(orchestrator.generated_graph().is_finished());
}

#[test]
fn finished_stream_replaced_for_new_queries() {
    let cache = Arc::new(ExecutorCache::default());

    let first_feed = testutil::sales_feed_graph(16);
    let first = feed_query(&cache, &first_feed, WindowConfig::rows(2));
    let running = first.clone();
    let handle = thread::spawn(move || rows(&running));
    wait_for_subscriber(&cache, &first, WindowConfig::rows(2));
    let producer = first_feed.row_producer(testutil::SALES_STEP).unwrap();
    for row in testutil::sales_rows() {
        assert!(producer.put_row_wait(row, Duration::from_secs(1)).unwrap());
    }
    assert_eq!(2, handle.join().unwrap().len());

    producer.finish();
    first_feed.wait_until_finished().unwrap();

    // A window config the finished stream never published.
    let second_feed = testutil::sales_feed_graph(16);
    let second = feed_query(&cache, &second_feed, WindowConfig::rows(3));
    assert!(!Arc::ptr_eq(
        first.window_manager().unwrap(),
        second.window_manager().unwrap()
    ));
    assert!(Arc::ptr_eq(&second_feed, second.source_graph()));
    assert!(second_feed.is_running());

    let running = second.clone();
    let handle = thread::spawn(move || rows(&running));
    wait_for_subscriber(&cache, &second, WindowConfig::rows(3));
    let producer = second_feed.row_producer(testutil::SALES_STEP).unwrap();
    for row in testutil::sales_rows() {
        assert!(producer.put_row_wait(row, Duration::from_secs(1)).unwrap());
    }
    assert_eq!(3, handle.join().unwrap().len());

    cache.remove_window_manager(second.window_manager().unwrap().key());
}

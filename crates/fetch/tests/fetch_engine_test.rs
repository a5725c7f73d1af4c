//! End-to-end fetch scenarios against the in-memory store
//!
//! Run with: cargo test -p corral-fetch --test fetch_engine_test

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use corral_fetch::prelude::*;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn engine_over(
    store: &Arc<InMemoryQueueStore>,
    config: &FetchConfig,
    control: &FetchControl,
) -> (Arc<FetchEngine>, mpsc::UnboundedReceiver<UnitOfWork>) {
    let store: Arc<dyn QueueStore> = store.clone();
    let strategy = select_strategy(config, store, None);
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = FetchEngine::new(strategy, Arc::new(tx), control.signal()).with_id("it");
    (Arc::new(engine), rx)
}

/// Records the message of every event emitted while installed
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<String>>>);

impl CapturedLogs {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    fn starting_with(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|message| message.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl<S: tracing::Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.0.lock().push(visitor.0);
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

// ============================================
// Immediate queue fetch
// ============================================

#[tokio::test(start_paused = true)]
async fn test_weighted_empty_queue_yields_to_lighter_queue() {
    let store = Arc::new(InMemoryQueueStore::new());
    store.push("queue:b", &names(&["job-b"])).await.unwrap();
    let config = FetchConfig::new(names(&["a", "a", "b"]));
    assert!(!config.strict);
    let control = FetchControl::new();
    let (engine, mut rx) = engine_over(&store, &config, &control);

    engine.fetch();

    let unit = rx.recv().await.unwrap();
    assert_eq!(unit.queue_name(), "b");
    assert_eq!(unit.payload(), "job-b");
    control.mark_fetching_done();
}

#[tokio::test]
async fn test_strict_mode_prefers_first_queue() {
    let store = Arc::new(InMemoryQueueStore::new());
    store.push("queue:a", &names(&["a1", "a2"])).await.unwrap();
    store.push("queue:b", &names(&["b1", "b2"])).await.unwrap();
    let config = FetchConfig::new(names(&["a", "b"]));
    let control = FetchControl::new();
    let (engine, mut rx) = engine_over(&store, &config, &control);

    for expected in ["a1", "a2", "b1", "b2"] {
        let outcome = engine.fetch_once().await;
        assert!(matches!(outcome, CycleOutcome::Assigned { .. }));
        assert_eq!(rx.recv().await.unwrap().payload(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_cycle_is_bounded_by_timeout() {
    let store = Arc::new(InMemoryQueueStore::new());
    let config = FetchConfig::default();
    let control = FetchControl::new();
    let (engine, _rx) = engine_over(&store, &config, &control);
    let started = Instant::now();

    let outcome = engine.fetch_once().await;

    assert_eq!(
        outcome,
        CycleOutcome::Empty {
            retry_in: Duration::ZERO,
            recovered_after: None
        }
    );
    assert!(started.elapsed() <= TIMEOUT);
}

#[tokio::test]
async fn test_bulk_requeue_regroups_into_one_push_per_queue() {
    let store = Arc::new(InMemoryQueueStore::new());
    let dyn_store: Arc<dyn QueueStore> = store.clone();
    let strategy = select_strategy(&FetchConfig::default(), dyn_store, None);

    let items = vec![
        UnitOfWork::new("queue:mail", "m1"),
        UnitOfWork::new("queue:reports", "r1"),
        UnitOfWork::new("queue:mail", "m2"),
        UnitOfWork::new("queue:sms", "s1"),
        UnitOfWork::new("queue:mail", "m3"),
        UnitOfWork::new("queue:reports", "r2"),
    ];

    let summary = strategy.bulk_requeue(items).await;

    assert_eq!(summary.pushes, 3);
    assert_eq!(summary.requeued, 6);
    assert_eq!(store.push_calls(), 3);
    assert_eq!(store.queue_contents("queue:mail"), names(&["m1", "m2", "m3"]));
    assert_eq!(store.queue_contents("queue:reports"), names(&["r1", "r2"]));
    assert_eq!(store.queue_contents("queue:sms"), names(&["s1"]));
}

// ============================================
// Scheduled fetch
// ============================================

#[tokio::test]
async fn test_scheduled_engine_promotes_only_due_entries() {
    let store = Arc::new(InMemoryQueueStore::new());
    let now = corral_fetch::persistence::unix_now();
    store
        .add_scored("schedule", now - 10.0, r#"{"queue":"mail","id":1}"#)
        .await
        .unwrap();
    store
        .add_scored("schedule", now + 3600.0, r#"{"queue":"mail","id":2}"#)
        .await
        .unwrap();
    let config = FetchConfig::default().with_poll_schedule(true);
    let control = FetchControl::new();
    let (engine, mut rx) = engine_over(&store, &config, &control);

    assert!(matches!(engine.fetch_once().await, CycleOutcome::Assigned { .. }));
    let unit = rx.recv().await.unwrap();
    assert_eq!(unit.queue_key(), "queue:mail");
    assert_eq!(unit.payload(), r#"{"queue":"mail","id":1}"#);

    let outcome = engine.fetch_once().await;
    assert_eq!(outcome.next_fetch_in(), Some(TIMEOUT));
    assert_eq!(store.scored_entries("schedule").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_scheduled_engines_share_one_due_entry() {
    let store = Arc::new(InMemoryQueueStore::new());
    let now = corral_fetch::persistence::unix_now();
    store
        .add_scored("schedule", now - 1.0, r#"{"queue":"solo"}"#)
        .await
        .unwrap();
    let config = FetchConfig::default().with_poll_schedule(true);
    let control = FetchControl::new();
    let (first, mut first_rx) = engine_over(&store, &config, &control);
    let (second, mut second_rx) = engine_over(&store, &config, &control);

    let (a, b) = tokio::join!(first.fetch_once(), second.fetch_once());

    let assigned = [a, b]
        .iter()
        .filter(|o| matches!(o, CycleOutcome::Assigned { .. }))
        .count();
    assert_eq!(assigned, 1);
    let delivered = usize::from(first_rx.try_recv().is_ok()) + usize::from(second_rx.try_recv().is_ok());
    assert_eq!(delivered, 1);
}

// ============================================
// Outages and shutdown
// ============================================

#[tokio::test(start_paused = true)]
async fn test_outage_of_three_cycles_reports_one_down_and_one_recovery() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let store = Arc::new(InMemoryQueueStore::new());
    let config = FetchConfig::default();
    let control = FetchControl::new();
    let (engine, _rx) = engine_over(&store, &config, &control);

    store.set_available(false);
    let mut outages_started = 0;
    for _ in 0..3 {
        if let CycleOutcome::BackedOff { newly_down } = engine.fetch_once().await {
            outages_started += usize::from(newly_down);
        } else {
            panic!("expected backoff while the store is down");
        }
    }
    assert_eq!(outages_started, 1);

    store.set_available(true);
    store.push("queue:default", &names(&["after"])).await.unwrap();

    let outcome = engine.fetch_once().await;
    assert!(matches!(outcome, CycleOutcome::Assigned { .. }));
    assert!(outcome.recovered_after().unwrap() >= TIMEOUT * 3);
    assert!(engine.down_since().is_none());

    assert_eq!(logs.starting_with("Store is down").len(), 1);
    let recovered = logs.starting_with("Store recovered after");
    assert_eq!(recovered.len(), 1);
    let seconds: f64 = recovered[0]
        .trim_start_matches("Store recovered after ")
        .trim_end_matches(" seconds")
        .parse()
        .unwrap();
    assert!(seconds >= 3.0, "recovered after {seconds}");
}

#[tokio::test(start_paused = true)]
async fn test_engine_stops_after_fetching_done() {
    let store = Arc::new(InMemoryQueueStore::new());
    let config = FetchConfig::default();
    let control = FetchControl::new();
    let (engine, mut rx) = engine_over(&store, &config, &control);

    engine.fetch();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    control.mark_fetching_done();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Pushed after the in-flight pop has timed out; nobody takes it.
    store.push("queue:default", &names(&["late"])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(store.queue_len("queue:default"), 1);
    assert_eq!(engine.fetch_once().await, CycleOutcome::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_during_blocked_pop_is_swallowed() {
    let store = Arc::new(InMemoryQueueStore::new());
    let config = FetchConfig::default();
    let control = FetchControl::new();
    let (engine, _rx) = engine_over(&store, &config, &control);

    let cycle = engine.fetch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.close();

    assert_eq!(cycle.await.unwrap(), CycleOutcome::Terminated);
    assert!(engine.down_since().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pool_shutdown_keeps_unprocessed_work() {
    let store = Arc::new(InMemoryQueueStore::new());
    store
        .push("queue:default", &names(&["one", "two", "three"]))
        .await
        .unwrap();
    let config = FetchConfig::default()
        .with_concurrency(3)
        .with_shutdown_timeout(Duration::from_millis(100));
    let dyn_store: Arc<dyn QueueStore> = store.clone();
    let pool = FetcherPool::from_store(dyn_store, config);
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    pool.start(move |_unit| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            std::future::pending::<WorkOutcome>().await
        }
    })
    .unwrap();

    for _ in 0..3 {
        started_rx.recv().await.unwrap();
    }
    assert_eq!(store.queue_len("queue:default"), 0);

    let result = pool.shutdown().await;

    assert!(matches!(
        result,
        Err(FetcherPoolError::ShutdownTimeout { requeued: 3 })
    ));
    let mut back = store.queue_contents("queue:default");
    back.sort();
    assert_eq!(back, names(&["one", "three", "two"]));
}

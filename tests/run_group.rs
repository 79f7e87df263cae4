//! Run group termination protocol, end to end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use baton::lifecycle::{
    BoxError, FnActor, ListenerActor, RunGroup, Serve, ServeError, ServeFuture, Shutdown, ShutdownSignal,
};
use baton::net::{ListenAddress, Listener};
use baton::HttpServer;
use tracing::instrument::WithSubscriber;

mod common;

/// Serves nothing and fails after a short delay, like a listener whose socket died.
struct DyingListener;

impl Serve for DyingListener {
    fn serve(self: Box<Self>, _listener: Listener, _shutdown: ShutdownSignal) -> ServeFuture {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(ServeError::Other("listener socket closed unexpectedly".into()))
        })
    }
}

#[tokio::test]
async fn failing_listener_takes_down_its_sibling() {
    let a = Listener::bind(&ListenAddress::tcp("127.0.0.1:0")).unwrap();
    let b = Listener::bind(&ListenAddress::tcp("127.0.0.1:0")).unwrap();
    let b_addr = b.tcp_addr().unwrap();

    let server = HttpServer::new("b", Router::new().route("/", get(|| async { "b" })));
    let mut group = RunGroup::new();
    group.add(ListenerActor::new("a", a, DyingListener));
    group.add(ListenerActor::new("b", b, server).with_shutdown_deadline(Duration::from_secs(5)));

    let err = tokio::time::timeout(Duration::from_secs(10), group.run())
        .await
        .expect("group should terminate")
        .unwrap_err();

    assert_eq!(err.actor, "a");
    assert!(matches!(err.downcast_ref::<ServeError>(), Some(ServeError::Other(_))));
    // B was interrupted and released its socket.
    assert!(tokio::net::TcpStream::connect(b_addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_other_actor_is_interrupted_exactly_once() {
    const ACTORS: usize = 5;
    let interrupts: Vec<Arc<AtomicUsize>> = (0..ACTORS).map(|_| Arc::default()).collect();
    let finished = Arc::new(AtomicUsize::new(0));
    let mut group = RunGroup::new();

    for (i, count) in interrupts.iter().enumerate() {
        let count = Arc::clone(count);
        let finished = Arc::clone(&finished);

        if i == 2 {
            group.add_fn(
                "failing",
                move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("boom".into())
                },
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
            );
            continue;
        }

        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        group.add_fn(
            format!("worker-{i}"),
            move || async move {
                signal.wait().await;
                // Slow teardown: the group must still wait for it.
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move |cause| {
                assert_eq!(cause.actor(), "failing");
                assert!(!cause.is_clean());
                count.fetch_add(1, Ordering::SeqCst);
                shutdown.trigger();
            },
        );
    }

    let err = group.run().await.unwrap_err();
    assert_eq!(err.actor, "failing");
    assert_eq!(err.source.to_string(), "boom");
    assert_eq!(finished.load(Ordering::SeqCst), ACTORS);
    for (i, count) in interrupts.iter().enumerate() {
        let expected = if i == 2 { 0 } else { 1 };
        assert_eq!(count.load(Ordering::SeqCst), expected, "actor {i}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_actor_is_interrupted() {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);

    let mut group = RunGroup::new();
    group.add(FnActor::blocking(
        "spinner",
        move || {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        },
        move |_| stop.store(true, Ordering::SeqCst),
    ));
    group.add_fn(
        "timer",
        || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        },
        |_| {},
    );

    let result = tokio::time::timeout(Duration::from_secs(5), group.run())
        .await
        .expect("blocking actor should honour its interrupt");
    assert!(result.is_ok());
}

#[tokio::test]
async fn final_log_line_names_the_failing_actor() {
    let logs = common::LogCapture::default();
    let dispatch = logs.dispatch("debug");

    let mut group = RunGroup::new();
    group.add_fn("database", || async { Err::<(), BoxError>("connection refused".into()) }, |_| {});
    let idle = Shutdown::new();
    let mut signal = idle.subscribe();
    group.add_fn(
        "idle",
        move || async move {
            signal.wait().await;
            tracing::info!("Idle actor released");
            Ok(())
        },
        move |_| {
            idle.trigger();
        },
    );

    let err = group.run().with_subscriber(dispatch).await.unwrap_err();
    assert_eq!(err.actor, "database");

    let lines = logs.lines();
    let last = lines.last().expect("the group logs its outcome");
    assert_eq!(last["fields"]["actor"], "database");
    assert_eq!(last["level"], "ERROR");
    assert!(last["fields"]["error"].as_str().unwrap().contains("connection refused"));

    // Actor tasks log through the same dispatcher.
    assert!(lines
        .iter()
        .any(|line| line["fields"]["message"] == "Idle actor released"));
}

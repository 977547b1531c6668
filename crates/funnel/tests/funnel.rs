#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use fleetwatch_funnel::{
    handler_fn, AggregatedStore, ChangeRecord, EventKind, Funnel, FunnelError, ResourceKind,
    RetryQueue,
};

fn rec(key: &str) -> ChangeRecord {
    ChangeRecord::new("east", ResourceKind::Pods, EventKind::Add, key)
}

/// A funnel with no cluster subscriptions, driven through its queue.
fn bare_funnel(max_retries: u32) -> Arc<Funnel> {
    Arc::new(Funnel::from_parts(
        Arc::new(RetryQueue::new(max_retries)),
        AggregatedStore::new(),
        Vec::new(),
    ))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_receives_records_in_order() {
    let funnel = bare_funnel(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    funnel.add_event_handler(handler_fn(move |record: ChangeRecord| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(record.key.clone());
            anyhow::Ok(())
        }
    }));

    let runner = tokio::spawn({
        let funnel = Arc::clone(&funnel);
        async move { funnel.run().await }
    });

    funnel.queue().push(rec("ns/a"));
    funnel.queue().push(rec("ns/b"));
    wait_until("both records handled", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec!["ns/a", "ns/b"]);

    funnel.stop();
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should exit after stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_handler_is_redelivered_then_dropped() {
    let funnel = bare_funnel(2);
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    funnel.add_event_handler(handler_fn(move |_record: ChangeRecord| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("downstream unavailable"))
        }
    }));

    let runner = tokio::spawn({
        let funnel = Arc::clone(&funnel);
        async move { funnel.run().await }
    });

    funnel.queue().push(rec("ns/a"));
    // Two allowed requeues: the initial delivery plus two redeliveries.
    wait_until("three attempts", || attempts.load(Ordering::SeqCst) == 3).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(funnel.queue().is_empty());

    funnel.stop();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn no_handler_drains_the_queue() {
    let funnel = bare_funnel(2);
    let runner = tokio::spawn({
        let funnel = Arc::clone(&funnel);
        async move { funnel.run().await }
    });

    funnel.queue().push(rec("ns/a"));
    funnel.queue().push(rec("ns/b"));
    wait_until("queue drained", || funnel.queue().is_empty()).await;

    funnel.stop();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn newest_handler_wins_mid_run() {
    let funnel = bare_funnel(2);
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&first);
    funnel.add_event_handler(handler_fn(move |record: ChangeRecord| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(record.key.clone());
            anyhow::Ok(())
        }
    }));

    let runner = tokio::spawn({
        let funnel = Arc::clone(&funnel);
        async move { funnel.run().await }
    });

    funnel.queue().push(rec("ns/a"));
    wait_until("first handler saw the record", || {
        first.lock().unwrap().len() == 1
    })
    .await;

    let sink = Arc::clone(&second);
    funnel.add_event_handler(handler_fn(move |record: ChangeRecord| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(record.key.clone());
            anyhow::Ok(())
        }
    }));

    funnel.queue().push(rec("ns/b"));
    wait_until("second handler saw the record", || {
        second.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(*first.lock().unwrap(), vec!["ns/a"]);
    assert_eq!(*second.lock().unwrap(), vec!["ns/b"]);

    funnel.stop();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn run_is_one_shot() {
    let funnel = bare_funnel(2);
    let runner = tokio::spawn({
        let funnel = Arc::clone(&funnel);
        async move { funnel.run().await }
    });

    // Proves the first run owns the consumer loop before stopping it.
    funnel.queue().push(rec("ns/a"));
    wait_until("consumer active", || funnel.queue().is_empty()).await;
    funnel.stop();
    timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let again = funnel.run().await;
    assert!(matches!(again, Err(FunnelError::AlreadyRan)));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_unblocks_an_idle_run() {
    let funnel = bare_funnel(2);
    let runner = tokio::spawn({
        let funnel = Arc::clone(&funnel);
        async move { funnel.run().await }
    });
    sleep(Duration::from_millis(20)).await;
    funnel.stop();
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should exit promptly after stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn manual_pop_requeue_finish_drive() {
    let funnel = bare_funnel(1);
    funnel.queue().push(rec("ns/a"));
    let got = funnel.pop().await.unwrap();
    funnel.requeue(got).unwrap();
    let got = funnel.pop().await.unwrap();
    funnel.finish(&got);
    assert!(funnel.queue().is_empty());
    funnel.set_max_retries(5);
    assert_eq!(funnel.queue().max_retries(), 5);
}

//! Fleetwatch retry queue: the single hand-off point between watch producers
//! and the consumer, with per-record bounded retry and backoff.

#![forbid(unsafe_code)]

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use fleetwatch_core::{ChangeRecord, RecordIdentity};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Errors surfaced by the retry queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been closed; no further records will be delivered.
    #[error("queue is closed")]
    Closed,
    /// The record was requeued more times than allowed and has been dropped.
    /// This is the only outcome that permanently loses an event.
    #[error("record dropped after {retries} retries")]
    MaxRetriesExceeded { retries: u32 },
}

/// Per-record exponential backoff: `base * 2^failures`, capped at `max`.
/// Defaults to a 1 ms base doubling up to a 1000 s ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next delivery attempt after `failures` prior requeues.
    pub fn delay(&self, failures: u32) -> Duration {
        // f64 math sidesteps Duration overflow for large exponents.
        let secs = self.base.as_secs_f64() * 2f64.powi(failures.min(1024) as i32);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_secs(1000))
    }
}

struct Delayed {
    due: Instant,
    seq: u64,
    record: ChangeRecord,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<ChangeRecord>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    /// Identities currently queued, ready or delayed.
    pending: HashSet<RecordIdentity>,
    /// Identities handed to the consumer and not yet settled.
    in_flight: HashSet<RecordIdentity>,
    /// Latest record pushed while its identity was in flight.
    deferred: HashMap<RecordIdentity, ChangeRecord>,
    /// Requeue counts per identity; a fresh push starts at zero.
    retries: HashMap<RecordIdentity, u32>,
    seq: u64,
    closed: bool,
}

impl Inner {
    fn release(&mut self, record: ChangeRecord) {
        self.pending.insert(record.identity());
        self.ready.push_back(record);
    }
}

/// Multi-producer, single-consumer delivery queue with bounded retry.
///
/// Producers `push` change records; the consumer `pop`s them one at a time
/// and settles each with `finish` or `requeue`. An identity is pending at
/// most once and in flight at most once: pushes for an identity already
/// queued coalesce into the waiting entry, pushes for one in flight are
/// deferred and redelivered once the attempt settles.
pub struct RetryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_retries: AtomicU32,
    backoff: ExponentialBackoff,
}

impl RetryQueue {
    pub fn new(max_retries: u32) -> Self {
        Self::with_backoff(max_retries, ExponentialBackoff::default())
    }

    pub fn with_backoff(max_retries: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            max_retries: AtomicU32::new(max_retries),
            backoff,
        }
    }

    /// Enqueue a record for delivery. Never blocks beyond the internal lock;
    /// a no-op once the queue is closed.
    pub fn push(&self, record: ChangeRecord) {
        let id = record.identity();
        let mut q = self.inner.lock().unwrap();
        if q.closed {
            return;
        }
        if q.pending.contains(&id) {
            counter!("queue_coalesced_total", 1u64);
            return;
        }
        if q.in_flight.contains(&id) {
            q.deferred.insert(id, record);
            counter!("queue_deferred_total", 1u64);
            return;
        }
        q.pending.insert(id);
        q.ready.push_back(record);
        counter!("queue_pushed_total", 1u64);
        update_depth(&q);
        drop(q);
        self.notify.notify_one();
    }

    /// Wait for and take the oldest deliverable record. A delayed record only
    /// becomes deliverable once its backoff elapses. The returned record is
    /// invisible to other `pop` calls until settled via `finish` or `requeue`.
    ///
    /// Fails with [`QueueError::Closed`], permanently, after [`close`].
    ///
    /// [`close`]: RetryQueue::close
    pub async fn pop(&self) -> Result<ChangeRecord, QueueError> {
        loop {
            let next_due = {
                let mut q = self.inner.lock().unwrap();
                if q.closed {
                    // Chain the wakeup so every parked popper sees the close.
                    self.notify.notify_one();
                    return Err(QueueError::Closed);
                }
                let now = Instant::now();
                while q.delayed.peek().map_or(false, |Reverse(d)| d.due <= now) {
                    if let Some(Reverse(d)) = q.delayed.pop() {
                        q.ready.push_back(d.record);
                    }
                }
                if let Some(record) = q.ready.pop_front() {
                    let id = record.identity();
                    q.pending.remove(&id);
                    q.in_flight.insert(id);
                    update_depth(&q);
                    return Ok(record);
                }
                q.delayed.peek().map(|Reverse(d)| d.due)
            };
            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Give a failed record another chance. While its retry counter is below
    /// the configured maximum the record is rescheduled with escalated
    /// backoff; otherwise all of its state is cleared, any deferred duplicate
    /// is released as a fresh record, and the drop is reported.
    pub fn requeue(&self, record: ChangeRecord) -> Result<(), QueueError> {
        let id = record.identity();
        let max = self.max_retries.load(AtomicOrdering::Relaxed);
        let mut q = self.inner.lock().unwrap();
        q.in_flight.remove(&id);
        if q.closed {
            return Err(QueueError::Closed);
        }
        let count = q.retries.get(&id).copied().unwrap_or(0);
        if count >= max {
            q.retries.remove(&id);
            warn!(
                cluster = %record.cluster,
                kind = %record.kind,
                event = %record.event,
                key = %record.key,
                retries = count,
                "record dropped: retries exhausted"
            );
            counter!("queue_exhausted_total", 1u64);
            if let Some(next) = q.deferred.remove(&id) {
                q.release(next);
                update_depth(&q);
                drop(q);
                self.notify.notify_one();
            }
            return Err(QueueError::MaxRetriesExceeded { retries: count });
        }
        // A deferred duplicate collapses into the retry itself.
        q.deferred.remove(&id);
        q.retries.insert(id.clone(), count + 1);
        q.seq += 1;
        let entry = Delayed {
            due: Instant::now() + self.backoff.delay(count),
            seq: q.seq,
            record,
        };
        q.pending.insert(id);
        q.delayed.push(Reverse(entry));
        counter!("queue_requeued_total", 1u64);
        update_depth(&q);
        drop(q);
        self.notify.notify_one();
        Ok(())
    }

    /// Mark a popped record fully processed: clears its retry counter, drops
    /// the in-flight mark and releases any deferred duplicate. Idempotent.
    pub fn finish(&self, record: &ChangeRecord) {
        let id = record.identity();
        let mut q = self.inner.lock().unwrap();
        q.retries.remove(&id);
        let was_in_flight = q.in_flight.remove(&id);
        if q.closed || !was_in_flight {
            return;
        }
        if let Some(next) = q.deferred.remove(&id) {
            q.release(next);
            update_depth(&q);
            drop(q);
            self.notify.notify_one();
        }
    }

    /// Change the retry bound. Takes effect immediately, including for
    /// records currently in flight.
    pub fn set_max_retries(&self, max: u32) {
        self.max_retries.store(max, AtomicOrdering::Relaxed);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(AtomicOrdering::Relaxed)
    }

    /// Shut the queue down: everything still queued is dropped, `push`
    /// becomes a no-op and every current and future `pop` fails with
    /// [`QueueError::Closed`].
    pub fn close(&self) {
        {
            let mut q = self.inner.lock().unwrap();
            if q.closed {
                return;
            }
            q.closed = true;
            q.ready.clear();
            q.delayed.clear();
            q.pending.clear();
            q.deferred.clear();
            q.retries.clear();
            update_depth(&q);
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of queued records (ready plus delayed), excluding in-flight.
    pub fn len(&self) -> usize {
        let q = self.inner.lock().unwrap();
        q.ready.len() + q.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// How many times this record's identity has been requeued so far.
    pub fn retry_count(&self, record: &ChangeRecord) -> u32 {
        let q = self.inner.lock().unwrap();
        q.retries.get(&record.identity()).copied().unwrap_or(0)
    }
}

fn update_depth(q: &Inner) {
    gauge!("queue_depth", (q.ready.len() + q.delayed.len()) as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_escalates_and_caps() {
        let b = ExponentialBackoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(1));
        assert_eq!(b.delay(1), Duration::from_millis(2));
        assert_eq!(b.delay(10), Duration::from_millis(1024));
        assert_eq!(b.delay(19), Duration::from_millis(524_288));
        assert_eq!(b.delay(20), Duration::from_secs(1000));
        assert_eq!(b.delay(4000), Duration::from_secs(1000));
    }

    #[test]
    fn backoff_custom_base_and_cap() {
        let b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(4));
        assert_eq!(b.delay(0), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(3), Duration::from_secs(4));
    }
}

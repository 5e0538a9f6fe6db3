//! Polling-based live observation of the append-only event log.
//!
//! Backends have no native push support, so watching is implemented as a
//! background poll loop per subscriber: read everything after the cursor,
//! dispatch callbacks in ascending cursor order, advance, sleep, repeat.
//! Each subscriber polls and dispatches on its own task, so one slow callback
//! never delays delivery to others.
//!
//! ## Delivery contract
//!
//! - Callbacks for a given run are invoked in strict cursor order, never out
//!   of order and never duplicated for a given (run, cursor) pair under
//!   normal operation. At-least-once delivery applies across poll-loop
//!   restarts; subscribers must be idempotent.
//! - Callback errors degrade only the failing subscriber: after
//!   [`WatcherConfig::max_callback_failures`] consecutive failures it is
//!   unregistered. Poll-loop (backend) errors stop the subscriber entirely
//!   and are logged at error level.
//! - Cancellation is cooperative: a stop flag checked each iteration, so
//!   teardown never kills a backend connection mid-query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use strata_core::{Error, Result, RunId};

use super::{EventCallback, EventCursor, EventRecord, WatchHandle};

/// Read access the watcher needs from an event log backend.
///
/// Kept separate from the full store trait so backend internals can hand the
/// watcher a reader without a reference cycle through themselves.
#[async_trait]
pub trait EventCursorReader: Send + Sync + 'static {
    /// Returns up to `limit` records of `run_id` with cursor strictly greater
    /// than `cursor`, ascending.
    async fn read_after(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        limit: usize,
    ) -> Result<Vec<EventRecord>>;
}

/// Tuning knobs for the polling loop.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Sleep between polls.
    pub poll_interval: Duration,
    /// Maximum records fetched per poll.
    pub batch_limit: usize,
    /// How long to keep polling after a terminal run event with no new
    /// events before the subscriber stops itself.
    pub grace_period: Duration,
    /// Consecutive callback failures after which a subscriber is
    /// unregistered.
    pub max_callback_failures: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_limit: 1000,
            grace_period: Duration::from_secs(30),
            max_callback_failures: 5,
        }
    }
}

struct Subscription {
    stop: Arc<AtomicBool>,
}

type SubscriberMap = Arc<Mutex<HashMap<(RunId, u64), Subscription>>>;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("watcher lock poisoned")
}

/// Background polling loop turning the event log into a live event stream.
pub struct PollingEventWatcher {
    reader: Arc<dyn EventCursorReader>,
    config: WatcherConfig,
    subscribers: SubscriberMap,
    next_token: AtomicU64,
    disposed: AtomicBool,
}

impl PollingEventWatcher {
    /// Creates a watcher polling the given reader.
    #[must_use]
    pub fn new(reader: Arc<dyn EventCursorReader>, config: WatcherConfig) -> Self {
        Self {
            reader,
            config,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    /// Registers a subscriber for events of `run_id` after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the watcher is disposed.
    pub fn watch(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        callback: EventCallback,
    ) -> Result<WatchHandle> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::backend("event watcher is disposed"));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut subs = self.subscribers.lock().map_err(poison_err)?;
            subs.insert(
                (run_id, token),
                Subscription { stop: stop.clone() },
            );
        }

        tokio::spawn(poll_loop(
            self.reader.clone(),
            self.config.clone(),
            self.subscribers.clone(),
            run_id,
            token,
            cursor,
            callback,
            stop,
        ));
        tracing::debug!(%run_id, token, %cursor, "event watch registered");
        Ok(WatchHandle(token))
    }

    /// Deregisters a subscriber. No-op for unknown handles.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the watcher lock is poisoned.
    pub fn end_watch(&self, run_id: RunId, handle: WatchHandle) -> Result<()> {
        let mut subs = self.subscribers.lock().map_err(poison_err)?;
        if let Some(sub) = subs.remove(&(run_id, handle.0)) {
            sub.stop.store(true, Ordering::Release);
            tracing::debug!(%run_id, token = handle.0, "event watch ended");
        }
        Ok(())
    }

    /// Stops all subscribers and rejects further registrations.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the watcher lock is poisoned.
    pub fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        let mut subs = self.subscribers.lock().map_err(poison_err)?;
        for sub in subs.values() {
            sub.stop.store(true, Ordering::Release);
        }
        subs.clear();
        Ok(())
    }

    /// Number of live subscriptions, for tests and diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the watcher lock is poisoned.
    pub fn subscriber_count(&self) -> Result<usize> {
        Ok(self.subscribers.lock().map_err(poison_err)?.len())
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    reader: Arc<dyn EventCursorReader>,
    config: WatcherConfig,
    subscribers: SubscriberMap,
    run_id: RunId,
    token: u64,
    mut cursor: EventCursor,
    callback: EventCallback,
    stop: Arc<AtomicBool>,
) {
    let mut terminal_seen: Option<Instant> = None;
    let mut consecutive_failures: u32 = 0;

    'outer: while !stop.load(Ordering::Acquire) {
        match reader.read_after(run_id, cursor, config.batch_limit).await {
            Ok(records) if records.is_empty() => {
                if let Some(at) = terminal_seen {
                    if at.elapsed() >= config.grace_period {
                        tracing::debug!(%run_id, token, "run terminal and grace period elapsed; stopping watch");
                        break;
                    }
                }
            }
            Ok(records) => {
                for record in records {
                    if stop.load(Ordering::Acquire) {
                        break 'outer;
                    }
                    cursor = record.cursor;
                    if record.entry.event_type.is_run_terminal() {
                        terminal_seen = Some(Instant::now());
                    }
                    match callback(record) {
                        Ok(()) => consecutive_failures = 0,
                        Err(err) => {
                            consecutive_failures += 1;
                            tracing::warn!(
                                %run_id,
                                token,
                                consecutive_failures,
                                error = %err,
                                "event watch callback failed"
                            );
                            if consecutive_failures >= config.max_callback_failures {
                                tracing::error!(
                                    %run_id,
                                    token,
                                    "unregistering event watch after repeated callback failures"
                                );
                                break 'outer;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                // Backend errors stop this subscriber; the caller re-registers
                // if it wants to resume from its last cursor.
                tracing::error!(%run_id, token, error = %err, "event watch poll failed; stopping watch");
                break;
            }
        }
        tokio::time::sleep(config.poll_interval).await;
    }

    if let Ok(mut subs) = subscribers.lock() {
        subs.remove(&(run_id, token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLogEntry, EventType};
    use std::sync::atomic::AtomicUsize;
    use std::sync::RwLock;

    /// Reader over a fixed, externally appendable record list.
    #[derive(Default)]
    struct VecReader {
        records: RwLock<Vec<EventRecord>>,
    }

    impl VecReader {
        fn push(&self, run_id: RunId, cursor: u64, event_type: EventType) {
            self.records.write().unwrap().push(EventRecord {
                cursor: EventCursor::new(cursor),
                entry: EventLogEntry::new(run_id, event_type, "test"),
            });
        }
    }

    #[async_trait]
    impl EventCursorReader for VecReader {
        async fn read_after(
            &self,
            run_id: RunId,
            cursor: EventCursor,
            limit: usize,
        ) -> Result<Vec<EventRecord>> {
            Ok(self
                .records
                .read()
                .unwrap()
                .iter()
                .filter(|r| r.entry.run_id == run_id && r.cursor > cursor)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(5),
            batch_limit: 100,
            grace_period: Duration::from_millis(50),
            max_callback_failures: 3,
        }
    }

    #[tokio::test]
    async fn delivers_in_cursor_order_and_stops_on_end_watch() {
        let reader = Arc::new(VecReader::default());
        let watcher = PollingEventWatcher::new(reader.clone(), fast_config());
        let run_id = RunId::generate();

        for cursor in 1..=3 {
            reader.push(run_id, cursor, EventType::StepStarted);
        }

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let handle = watcher
            .watch(
                run_id,
                EventCursor::START,
                Arc::new(move |record| {
                    seen_cb.lock().unwrap().push(record.cursor.value());
                    Ok(())
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        watcher.end_watch(run_id, handle).unwrap();
        reader.push(run_id, 4, EventType::StepSucceeded);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn end_watch_on_unregistered_handle_is_noop() {
        let reader = Arc::new(VecReader::default());
        let watcher = PollingEventWatcher::new(reader, fast_config());
        watcher
            .end_watch(RunId::generate(), WatchHandle(999))
            .unwrap();
    }

    #[tokio::test]
    async fn stops_after_terminal_event_and_grace_period() {
        let reader = Arc::new(VecReader::default());
        let watcher = PollingEventWatcher::new(reader.clone(), fast_config());
        let run_id = RunId::generate();
        reader.push(run_id, 1, EventType::RunStarted);
        reader.push(run_id, 2, EventType::RunSuccess);

        let _handle = watcher
            .watch(run_id, EventCursor::START, Arc::new(|_| Ok(())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(watcher.subscriber_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_callback_failures_unregister_subscriber() {
        let reader = Arc::new(VecReader::default());
        let watcher = PollingEventWatcher::new(reader.clone(), fast_config());
        let run_id = RunId::generate();
        for cursor in 1..=4 {
            reader.push(run_id, cursor, EventType::StepStarted);
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let _handle = watcher
            .watch(
                run_id,
                EventCursor::START,
                Arc::new(move |_| {
                    calls_cb.fetch_add(1, Ordering::Relaxed);
                    Err("subscriber bug".into())
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher.subscriber_count().unwrap(), 0);
        // Stopped at the failure threshold, not after draining the batch.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let reader = Arc::new(VecReader::default());
        let watcher = PollingEventWatcher::new(reader.clone(), fast_config());
        let run_id = RunId::generate();
        for cursor in 1..=2 {
            reader.push(run_id, cursor, EventType::StepStarted);
        }

        let healthy: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let healthy_cb = healthy.clone();
        let _h1 = watcher
            .watch(
                run_id,
                EventCursor::START,
                Arc::new(move |record| {
                    healthy_cb.lock().unwrap().push(record.cursor.value());
                    Ok(())
                }),
            )
            .unwrap();
        let _h2 = watcher
            .watch(
                run_id,
                EventCursor::START,
                Arc::new(|_| Err("always failing".into())),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*healthy.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn dispose_stops_everything_and_rejects_new_watches() {
        let reader = Arc::new(VecReader::default());
        let watcher = PollingEventWatcher::new(reader.clone(), fast_config());
        let run_id = RunId::generate();
        let _handle = watcher
            .watch(run_id, EventCursor::START, Arc::new(|_| Ok(())))
            .unwrap();

        watcher.dispose().unwrap();
        assert_eq!(watcher.subscriber_count().unwrap(), 0);
        assert!(watcher
            .watch(run_id, EventCursor::START, Arc::new(|_| Ok(())))
            .is_err());
    }
}

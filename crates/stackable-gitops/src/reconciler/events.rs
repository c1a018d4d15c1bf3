//! Event publishing for the control loop.
//!
//! The loop is event-driven, not a fixed poll: periodic publishers (resync,
//! reimport, status, namespace events) and a backoff-driven retry publisher
//! are multiplexed into one funnel, and the subscriber handles one event at
//! a time. No two runs ever execute concurrently.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, backoff::Backoff};

/// The kinds of events a subscriber can receive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventType {
    /// Force a full re-apply, even if no changes were detected.
    SyncWithReimport,
    /// Poll the source for a new commit.
    Sync,
    /// Republish the sync status with the current remediator errors.
    Status,
    /// Re-sync if the namespace controller requested it.
    NamespaceResync,
    /// Retry after an error, a conflict, or a pending watch update.
    RetrySync,
}

/// What the subscriber decided about the retry schedule.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventResult {
    /// The run succeeded or detected a source change; restart the retry
    /// backoff from its initial delay.
    pub reset_retry_backoff: bool,
    /// A run was attempted and failed; move the retry backoff one step
    /// further out.
    pub trigger_retry_backoff: bool,
}

/// Handles events, one at a time.
#[async_trait]
pub trait Subscriber: Send {
    async fn handle(&mut self, event: EventType) -> EventResult;
}

/// A step-limited exponential backoff for the retry publisher. The delay
/// grows per step, the total duration is unbounded by design: GitOps
/// convergence has no deadline.
#[derive(Debug)]
pub struct RetryBackoff {
    inner: ExponentialBackoff,
    initial_interval: Duration,
    step_limit: u32,
    remaining_steps: u32,
}

impl RetryBackoff {
    pub fn new(initial_interval: Duration, step_limit: u32) -> Self {
        Self {
            inner: Self::strategy(initial_interval),
            initial_interval,
            step_limit,
            remaining_steps: step_limit,
        }
    }

    fn strategy(initial_interval: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// The next retry delay, or `None` once the step limit is exhausted.
    pub fn next_step(&mut self) -> Option<Duration> {
        if self.remaining_steps == 0 {
            return None;
        }
        self.remaining_steps -= 1;
        self.inner.next_backoff()
    }

    /// Restarts from the initial delay with the full step budget.
    pub fn reset(&mut self) {
        self.inner = Self::strategy(self.initial_interval);
        self.remaining_steps = self.step_limit;
    }
}

/// The set of periodic publishers feeding one subscriber.
pub struct PublishingGroup {
    /// How often to poll the source for a new commit.
    pub sync_period: Duration,
    /// How often to force a re-apply without a new commit.
    pub resync_period: Duration,
    /// How often to republish the sync status while not syncing.
    pub status_update_period: Duration,
    /// How often to check for namespace events, if enabled.
    pub namespace_event_period: Option<Duration>,
    pub retry_backoff: RetryBackoff,
}

impl PublishingGroup {
    /// Multiplexes the publishers into the subscriber until the shutdown
    /// future resolves.
    pub async fn funnel<S>(mut self, subscriber: &mut S, shutdown: impl Future<Output = ()>)
    where
        S: Subscriber,
    {
        let start = tokio::time::Instant::now();
        let mut sync_timer = tokio::time::interval_at(start + self.sync_period, self.sync_period);
        let mut resync_timer =
            tokio::time::interval_at(start + self.resync_period, self.resync_period);
        let mut status_timer = tokio::time::interval_at(
            start + self.status_update_period,
            self.status_update_period,
        );
        let namespace_period = self
            .namespace_event_period
            .unwrap_or_else(|| Duration::from_secs(3600));
        let mut namespace_timer =
            tokio::time::interval_at(start + namespace_period, namespace_period);
        let namespace_enabled = self.namespace_event_period.is_some();

        let mut retry_delay = self.retry_backoff.next_step();
        let mut retry_deadline = start + retry_delay.unwrap_or_default();

        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                () = &mut shutdown => break,
                _ = resync_timer.tick() => EventType::SyncWithReimport,
                _ = sync_timer.tick() => EventType::Sync,
                _ = status_timer.tick() => EventType::Status,
                _ = namespace_timer.tick(), if namespace_enabled => EventType::NamespaceResync,
                () = tokio::time::sleep_until(retry_deadline), if retry_delay.is_some() => {
                    EventType::RetrySync
                }
            };

            let result = subscriber.handle(event).await;
            if result.reset_retry_backoff {
                self.retry_backoff.reset();
                retry_delay = self.retry_backoff.next_step();
            } else if result.trigger_retry_backoff {
                retry_delay = self.retry_backoff.next_step();
                if retry_delay.is_none() {
                    tracing::warn!("retry budget exhausted, waiting for a new commit or resync");
                }
            }
            // Re-arm the retry timer whenever it fired or the delay changed.
            if event == EventType::RetrySync
                || result.reset_retry_backoff
                || result.trigger_retry_backoff
            {
                retry_deadline = tokio::time::Instant::now() + retry_delay.unwrap_or_default();
            }
        }
        tracing::debug!("event funnel stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    struct CountingSubscriber {
        syncs: usize,
        resyncs: usize,
        shutdown: Option<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl Subscriber for CountingSubscriber {
        async fn handle(&mut self, event: EventType) -> EventResult {
            match event {
                EventType::Sync => {
                    self.syncs += 1;
                    if self.syncs == 3 {
                        if let Some(tx) = self.shutdown.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                EventType::SyncWithReimport => self.resyncs += 1,
                _ => {}
            }
            EventResult::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn funnel_dispatches_until_shutdown() {
        let (tx, rx) = oneshot::channel();
        let mut subscriber = CountingSubscriber {
            syncs: 0,
            resyncs: 0,
            shutdown: Some(tx),
        };
        let group = PublishingGroup {
            sync_period: Duration::from_millis(10),
            resync_period: Duration::from_secs(3600),
            status_update_period: Duration::from_secs(3600),
            namespace_event_period: None,
            retry_backoff: RetryBackoff::new(Duration::from_secs(600), 12),
        };

        group
            .funnel(&mut subscriber, async {
                let _ = rx.await;
            })
            .await;

        // Three reimport polls got through, nothing else was due yet.
        assert_eq!(subscriber.syncs, 3);
        assert_eq!(subscriber.resyncs, 0);
    }

    #[test]
    fn retry_backoff_is_step_limited() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(10), 3);
        assert!(backoff.next_step().is_some());
        assert!(backoff.next_step().is_some());
        assert!(backoff.next_step().is_some());
        assert!(backoff.next_step().is_none());

        backoff.reset();
        assert!(backoff.next_step().is_some());
    }

    #[test]
    fn retry_delays_grow() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(100), 12);
        let first = backoff.next_step().expect("first step");
        let mut last = first;
        for _ in 0..5 {
            last = backoff.next_step().expect("more steps");
        }
        // The backoff is randomized, but after several steps the delay must
        // have clearly grown beyond the initial interval.
        assert!(last > first);
    }
}

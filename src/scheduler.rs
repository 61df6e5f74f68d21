// Scheduler: the handle producers hold. Starts and stops the dispatch loop and
// exposes submission plus the owner throttle and outstanding-count queries.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::{
    dispatch::{Command, DispatchLoop, DispatchPolicy, Pending, Shared},
    executor::Executor,
    owner_throttle::ThrottleMode,
    retry_policy::RetryConfig,
    scheduled_item::{ItemState, Outcome, ScheduledItem},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler is stopped")]
    Stopped,

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub dispatch: DispatchPolicy,
    pub retry: RetryConfig,
    pub throttle: ThrottleMode,
    pub call_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchPolicy::TimerPerEarliest,
            retry: RetryConfig::default(),
            throttle: ThrottleMode::Sticky,
            call_timeout_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(raw: &str) -> Result<Self, SchedulerError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        // a zero delay would let a retry become due inside the drain that produced it
        if self.retry.retry_delay_ms == 0 {
            return Err(SchedulerError::Config(
                "retry.retry_delay_ms must be positive".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        if let DispatchPolicy::FixedTick { tick_ms: 0 } = self.dispatch {
            return Err(SchedulerError::Config(
                "dispatch.tick_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Deferred request scheduler.
///
/// Submission is fire-and-forget: `submit` only fails for rejected input or a
/// stopped scheduler, never because of the eventual call. Use `submit_tracked`
/// to get the terminal outcome of one item.
pub struct Scheduler {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<usize>>>,
    default_max_attempts: u32,
}

impl Scheduler {
    /// Spawns the dispatch loop on the current tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let shared = Arc::new(Shared::new(config.throttle));
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let dispatch = DispatchLoop::new(
            config.dispatch,
            &config.retry,
            config.call_timeout(),
            executor,
            shared.clone(),
        );
        let worker = tokio::spawn(dispatch.run(rx, shutdown_rx));

        info!(
            policy = ?config.dispatch,
            throttle = ?config.throttle,
            retry_delay_ms = config.retry.retry_delay_ms,
            max_attempts = config.retry.max_attempts,
            "scheduler started"
        );

        Ok(Self {
            shared,
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            default_max_attempts: config.retry.max_attempts,
        })
    }

    pub fn submit(&self, item: ScheduledItem) -> Result<(), SchedulerError> {
        self.send(item, None)
    }

    pub fn submit_tracked(
        &self,
        item: ScheduledItem,
    ) -> Result<oneshot::Receiver<Outcome>, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.send(item, Some(tx))?;
        Ok(rx)
    }

    fn send(
        &self,
        mut item: ScheduledItem,
        notify: Option<oneshot::Sender<Outcome>>,
    ) -> Result<(), SchedulerError> {
        if self.tx.is_closed() {
            return Err(SchedulerError::Stopped);
        }

        let max_attempts = *item.max_attempts.get_or_insert(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(SchedulerError::InvalidItem(format!(
                "{}: max_attempts must be at least 1",
                item.id
            )));
        }
        if item.attempt_count >= max_attempts {
            return Err(SchedulerError::InvalidItem(format!(
                "{}: attempt_count {} leaves no attempts out of {}",
                item.id, item.attempt_count, max_attempts
            )));
        }

        let owner = item.owner_id.clone();
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let owner_generation = owner.as_deref().map(|o| self.shared.owners.acquire(o));

        debug!(
            id = %item.id,
            owner = ?owner,
            state = ?ItemState::Created,
            "request submitted"
        );
        if self
            .tx
            .send(Command::Submit(Pending::new(item, notify, owner_generation)))
            .is_err()
        {
            // loop went away between the check above and the send
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            if let (Some(owner), Some(generation)) = (&owner, owner_generation) {
                self.shared.owners.release(owner, generation);
            }
            return Err(SchedulerError::Stopped);
        }

        Ok(())
    }

    pub fn is_owner_scheduled(&self, owner_id: &str) -> bool {
        self.shared.owners.contains(owner_id)
    }

    pub fn remove_owner(&self, owner_id: &str) {
        if self.shared.owners.remove(owner_id) {
            debug!(owner = owner_id, "owner removed from throttle set");
        }
    }

    // Items submitted and not yet succeeded or exhausted
    pub fn outstanding_count(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn throttle_mode(&self) -> ThrottleMode {
        self.shared.owners.mode()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stops the dispatch loop and waits for it to exit. Pending items are
    /// discarded; returns how many. Calling it again returns 0.
    pub async fn stop(&self) -> usize {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();

        match worker {
            Some(handle) => match handle.await {
                Ok(discarded) => discarded,
                Err(e) => {
                    error!(error = %e, "dispatch loop terminated abnormally");
                    0
                }
            },
            None => 0,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock_executor::{MockExecutor, MockReply};
    use crate::executor::TransportError;
    use crate::scheduled_item::Method;
    use rand::seq::SliceRandom;
    use tokio::time::Instant;
    use tokio_test::assert_err;

    fn config(retry_delay_ms: u64, max_attempts: u32) -> SchedulerConfig {
        SchedulerConfig {
            retry: RetryConfig {
                retry_delay_ms,
                max_attempts,
            },
            ..Default::default()
        }
    }

    fn item(target: &str, at: Instant) -> ScheduledItem {
        ScheduledItem::new(target, Method::Post, target).eligible_at(at)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_in_eligible_time_order() {
        let mock = Arc::new(MockExecutor::new());
        let scheduler = Scheduler::start(SchedulerConfig::default(), mock.clone()).unwrap();
        let t = Instant::now();

        scheduler.submit(item("/t100", t + Duration::from_millis(100))).unwrap();
        scheduler.submit(item("/t50", t + Duration::from_millis(50))).unwrap();
        let last = scheduler.submit_tracked(item("/t0", t)).unwrap();
        last.await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let calls = mock.calls();
        let order: Vec<&str> = calls.iter().map(|c| c.target.as_str()).collect();
        assert_eq!(order, vec!["/t0", "/t50", "/t100"]);
        assert!(calls[1].at >= t + Duration::from_millis(50));
        assert!(calls[2].at >= t + Duration::from_millis(100));
        assert_eq!(scheduler.outstanding_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shuffled_submissions_come_out_sorted() {
        let mock = Arc::new(MockExecutor::new());
        let scheduler = Scheduler::start(SchedulerConfig::default(), mock.clone()).unwrap();
        let t = Instant::now();

        let mut offsets: Vec<u64> = (0..50).map(|i| i * 10).collect();
        offsets.shuffle(&mut rand::thread_rng());
        for ms in &offsets {
            scheduler
                .submit(item(&format!("/{ms:04}"), t + Duration::from_millis(*ms)))
                .unwrap();
        }
        assert_eq!(scheduler.outstanding_count(), 50);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let seen: Vec<String> = mock.calls().into_iter().map(|c| c.target).collect();
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen.len(), 50);
        assert_eq!(seen, sorted);
        assert_eq!(scheduler.outstanding_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_item_attempted_exactly_max_attempts() {
        let mock = Arc::new(MockExecutor::failing());
        let scheduler = Scheduler::start(config(10_000, 5), mock.clone()).unwrap();

        let outcome = scheduler
            .submit_tracked(item("/down", Instant::now()).with_max_attempts(3))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(outcome.state, ItemState::Exhausted);
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.last_error,
            Some(TransportError::Rejected { status_code: 503, .. })
        ));

        let calls = mock.calls_for("/down");
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(10_000));
        }

        // nothing is resubmitted a 4th time
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.call_count(), 3);
        assert_eq!(scheduler.outstanding_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_without_ceiling_uses_config_default() {
        let mock = Arc::new(MockExecutor::failing());
        let scheduler = Scheduler::start(config(1_000, 4), mock.clone()).unwrap();

        let outcome = scheduler
            .submit_tracked(item("/down", Instant::now()))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 4);
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_count_unchanged_by_retries() {
        let mock = Arc::new(MockExecutor::new());
        mock.script("/flaky", vec![MockReply::Reject(500), MockReply::NetworkError]);
        let scheduler = Scheduler::start(config(1_000, 5), mock.clone()).unwrap();
        let t = Instant::now();

        assert_eq!(scheduler.outstanding_count(), 0);
        let flaky = scheduler.submit_tracked(item("/flaky", t)).unwrap();
        let slow = scheduler
            .submit_tracked(item("/slow", t + Duration::from_secs(30)))
            .unwrap();
        assert_eq!(scheduler.outstanding_count(), 2);

        // two retries happen before /flaky succeeds at t+2s
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(mock.calls_for("/flaky").len(), 2);
        assert_eq!(scheduler.outstanding_count(), 2);

        let outcome = flaky.await.unwrap();
        assert_eq!(outcome.state, ItemState::Succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(scheduler.outstanding_count(), 1);

        slow.await.unwrap();
        assert_eq!(scheduler.outstanding_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_stays_throttled_until_removed() {
        let mock = Arc::new(MockExecutor::new());
        let scheduler = Scheduler::start(SchedulerConfig::default(), mock.clone()).unwrap();

        assert!(!scheduler.is_owner_scheduled("u1"));
        let done = scheduler
            .submit_tracked(item("/fetch", Instant::now()).with_owner("u1"))
            .unwrap();
        assert!(scheduler.is_owner_scheduled("u1"));
        assert!(!scheduler.is_owner_scheduled("u2"));

        done.await.unwrap();
        assert_eq!(scheduler.outstanding_count(), 0);
        // sticky: finishing all of u1's work does not clear it
        assert!(scheduler.is_owner_scheduled("u1"));

        scheduler.remove_owner("u1");
        assert!(!scheduler.is_owner_scheduled("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ref_counted_owner_released_on_last_terminal() {
        let mock = Arc::new(MockExecutor::failing());
        let scheduler = Scheduler::start(
            SchedulerConfig {
                throttle: ThrottleMode::RefCounted,
                ..config(1_000, 2)
            },
            mock.clone(),
        )
        .unwrap();
        let t = Instant::now();

        let first = scheduler.submit_tracked(item("/a", t).with_owner("u1")).unwrap();
        let second = scheduler
            .submit_tracked(item("/b", t + Duration::from_secs(10)).with_owner("u1"))
            .unwrap();

        assert_eq!(first.await.unwrap().state, ItemState::Exhausted);
        assert!(scheduler.is_owner_scheduled("u1"));

        second.await.unwrap();
        assert!(!scheduler.is_owner_scheduled("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ref_counted_resubmit_after_remove_not_released_by_old_items() {
        let mock = Arc::new(MockExecutor::new());
        let scheduler = Scheduler::start(
            SchedulerConfig {
                throttle: ThrottleMode::RefCounted,
                ..Default::default()
            },
            mock.clone(),
        )
        .unwrap();
        let t = Instant::now();

        let old = scheduler
            .submit_tracked(item("/old", t + Duration::from_secs(1)).with_owner("u1"))
            .unwrap();
        scheduler.remove_owner("u1");
        let new = scheduler
            .submit_tracked(item("/new", t + Duration::from_secs(100)).with_owner("u1"))
            .unwrap();

        assert_eq!(old.await.unwrap().state, ItemState::Succeeded);
        assert_eq!(scheduler.outstanding_count(), 1);
        assert!(scheduler.is_owner_scheduled("u1"));

        assert_eq!(new.await.unwrap().state, ItemState::Succeeded);
        assert!(!scheduler.is_owner_scheduled("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_executor_does_not_stop_the_loop() {
        let mock = Arc::new(MockExecutor::new());
        mock.script("/boom", vec![MockReply::Panic]);
        let scheduler = Scheduler::start(config(500, 3), mock.clone()).unwrap();
        let t = Instant::now();

        let boom = scheduler.submit_tracked(item("/boom", t)).unwrap();
        let fine = scheduler.submit_tracked(item("/fine", t)).unwrap();

        assert_eq!(fine.await.unwrap().state, ItemState::Succeeded);
        let outcome = boom.await.unwrap();
        assert_eq!(outcome.state, ItemState::Succeeded);
        assert_eq!(outcome.attempts, 2);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_and_retries() {
        let mock = Arc::new(MockExecutor::new());
        mock.script("/hang", vec![MockReply::Hang]);
        let scheduler = Scheduler::start(
            SchedulerConfig {
                call_timeout_ms: 2_000,
                ..config(1_000, 3)
            },
            mock.clone(),
        )
        .unwrap();

        let outcome = scheduler
            .submit_tracked(item("/hang", Instant::now()))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.state, ItemState::Succeeded);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_tick_drains_on_tick_boundary() {
        let mock = Arc::new(MockExecutor::new());
        let scheduler = Scheduler::start(
            SchedulerConfig {
                dispatch: DispatchPolicy::FixedTick { tick_ms: 1_000 },
                ..Default::default()
            },
            mock.clone(),
        )
        .unwrap();
        let t = Instant::now();

        let a = scheduler.submit_tracked(item("/a", t + Duration::from_millis(10))).unwrap();
        let b = scheduler.submit_tracked(item("/b", t + Duration::from_millis(1_500))).unwrap();

        a.await.unwrap();
        b.await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].target, "/a");
        assert!(calls[0].at >= t + Duration::from_millis(1_000));
        assert!(calls[1].at >= t + Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_pending_and_rejects_new_work() {
        let mock = Arc::new(MockExecutor::new());
        let scheduler = Scheduler::start(SchedulerConfig::default(), mock.clone()).unwrap();
        let later = Instant::now() + Duration::from_secs(3_600);

        let handle = scheduler.submit_tracked(item("/later", later)).unwrap();
        scheduler.submit(item("/later2", later)).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(scheduler.stop().await, 2);
        assert_eq!(scheduler.stop().await, 0);
        assert_eq!(scheduler.outstanding_count(), 0);
        assert!(!scheduler.is_running());
        assert!(handle.await.is_err());

        assert_eq!(
            scheduler.submit(item("/late", Instant::now())),
            Err(SchedulerError::Stopped)
        );
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_items_with_no_attempts_left() {
        let scheduler =
            Scheduler::start(SchedulerConfig::default(), Arc::new(MockExecutor::new())).unwrap();

        assert_err!(scheduler.submit(item("/x", Instant::now()).with_max_attempts(0)));
        assert_err!(scheduler.submit(
            item("/x", Instant::now())
                .with_max_attempts(3)
                .with_attempt_count(3)
        ));
        assert_eq!(scheduler.outstanding_count(), 0);

        // a caller-supplied attempt count below the ceiling is fine
        scheduler
            .submit(item("/x", Instant::now()).with_attempt_count(2))
            .unwrap();
        assert_eq!(scheduler.outstanding_count(), 1);
    }

    #[test]
    fn test_config_from_json() {
        let config = SchedulerConfig::from_json(
            r#"{
                "dispatch": { "kind": "fixed_tick" },
                "retry": { "retry_delay_ms": 2000 },
                "throttle": "ref_counted"
            }"#,
        )
        .unwrap();

        assert_eq!(config.dispatch, DispatchPolicy::FixedTick { tick_ms: 60_000 });
        assert_eq!(config.retry.retry_delay_ms, 2_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.throttle, ThrottleMode::RefCounted);
        assert_eq!(config.call_timeout_ms, 30_000);

        let defaults = SchedulerConfig::from_json("{}").unwrap();
        assert_eq!(defaults.dispatch, DispatchPolicy::TimerPerEarliest);
        assert_eq!(defaults.throttle, ThrottleMode::Sticky);
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            SchedulerConfig::from_json(r#"{ "retry": { "max_attempts": 0 } }"#),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_json(r#"{ "dispatch": { "kind": "fixed_tick", "tick_ms": 0 } }"#),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_json("not json"),
            Err(SchedulerError::Config(_))
        ));
        assert!(config(0, 3).validate().is_err());
    }
}

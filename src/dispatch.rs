// Dispatch Loop: owns the priority queue and the single wake-up timer.
//
// Everything that touches the queue (new submissions, drains, retries) runs
// inside the one task that owns a `DispatchLoop`. Producers reach it through an
// unbounded channel; the outstanding count and the owner throttle set are
// shared with them because they must be readable from outside the task.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Deserialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    executor::{guarded_perform, Executor, TransportError},
    owner_throttle::{OwnerThrottle, ThrottleMode},
    priority_queue::KeyedMinHeap,
    retry_policy::{RetryConfig, RetryDecision, RetryPolicy},
    scheduled_item::{ItemState, Outcome, ScheduledItem},
};

pub const DEFAULT_TICK_MS: u64 = 60_000;

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

// How the loop decides when to wake up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchPolicy {
    // one timer, re-armed for the earliest queued item
    #[default]
    TimerPerEarliest,
    // wake every `tick_ms` and drain whatever is due
    FixedTick {
        #[serde(default = "default_tick_ms")]
        tick_ms: u64,
    },
}

pub(crate) struct Pending {
    pub item: ScheduledItem,
    pub notify: Option<oneshot::Sender<Outcome>>,
    pub last_error: Option<TransportError>,
    // throttle entry generation taken at submission, for owned items
    pub owner_generation: Option<u64>,
}

impl Pending {
    pub fn new(
        item: ScheduledItem,
        notify: Option<oneshot::Sender<Outcome>>,
        owner_generation: Option<u64>,
    ) -> Self {
        Self {
            item,
            notify,
            last_error: None,
            owner_generation,
        }
    }
}

pub(crate) enum Command {
    Submit(Pending),
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub outstanding: AtomicUsize,
    pub owners: OwnerThrottle,
}

impl Shared {
    pub fn new(mode: ThrottleMode) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            owners: OwnerThrottle::new(mode),
        }
    }
}

fn eligible_key(p: &Pending) -> Instant {
    p.item.eligible_at
}

type ItemQueue = KeyedMinHeap<Pending, Instant, fn(&Pending) -> Instant>;

pub(crate) struct DispatchLoop {
    queue: ItemQueue,
    policy: DispatchPolicy,
    retry: RetryPolicy,
    call_timeout: Duration,
    executor: Arc<dyn Executor>,
    shared: Arc<Shared>,
    armed: Option<Instant>,
}

impl DispatchLoop {
    pub fn new(
        policy: DispatchPolicy,
        retry: &RetryConfig,
        call_timeout: Duration,
        executor: Arc<dyn Executor>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            queue: KeyedMinHeap::new(eligible_key as fn(&Pending) -> Instant),
            policy,
            retry: RetryPolicy::new(retry),
            call_timeout,
            executor,
            shared,
            armed: None,
        }
    }

    // Deadline of the wake-up timer, `None` when idle or in fixed-tick mode
    pub fn armed_deadline(&self) -> Option<Instant> {
        self.armed
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, pending: Pending) {
        debug!(
            id = %pending.item.id,
            attempt = pending.item.attempt_count,
            state = ?ItemState::Enqueued,
            "item enqueued"
        );
        self.queue.insert(pending);
        self.rearm();
    }

    fn rearm(&mut self) {
        if self.policy != DispatchPolicy::TimerPerEarliest {
            return;
        }
        let next = self.queue.peek_key().copied();
        if next != self.armed {
            match next {
                Some(at) => debug!(
                    in_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "timer armed"
                ),
                None => debug!("queue idle, timer disarmed"),
            }
        }
        self.armed = next;
    }

    /// Drains every item due at the moment of the call, one at a time and in
    /// eligible-time order, then re-arms for whatever is left. Returns the
    /// number of items executed.
    pub async fn on_timer_fire(&mut self) -> usize {
        let now = Instant::now();
        let mut drained = 0;

        while let Some(pending) = self.queue.pop_due(&now) {
            debug!(id = %pending.item.id, state = ?ItemState::Due, "item due");
            self.execute(pending).await;
            drained += 1;
        }

        self.rearm();
        if drained > 0 {
            debug!(
                drained,
                queued = self.queued(),
                next = ?self.armed_deadline(),
                "drain cycle complete"
            );
        }
        drained
    }

    async fn execute(&mut self, mut pending: Pending) {
        let attempt = pending.item.attempt_count;
        debug!(
            id = %pending.item.id,
            attempt,
            state = ?ItemState::Executing,
            processed_at = %Utc::now().to_rfc3339(),
            "executing request"
        );

        let result =
            guarded_perform(self.executor.as_ref(), &pending.item, self.call_timeout).await;
        match result {
            Ok(response) => {
                let remaining = self.finish(&pending.item, pending.owner_generation);
                info!(
                    id = %pending.item.id,
                    attempt,
                    status = response.status,
                    remaining,
                    "request executed successfully"
                );
                Self::notify(pending, ItemState::Succeeded);
            }
            Err(err) => {
                if let TransportError::Panicked(_) = &err {
                    error!(id = %pending.item.id, attempt, error = %err, "executor fault");
                }
                pending.last_error = Some(err);
                self.on_failure(pending);
            }
        }
    }

    fn on_failure(&mut self, pending: Pending) {
        let Pending {
            item,
            notify,
            last_error,
            owner_generation,
        } = pending;

        match self.retry.on_failure(item, Instant::now()) {
            RetryDecision::Retry(item) => {
                warn!(
                    id = %item.id,
                    attempt = item.attempt_count,
                    max_attempts = self.retry.attempt_ceiling(&item),
                    delay_ms = self.retry.retry_delay().as_millis() as u64,
                    error = ?last_error,
                    state = ?ItemState::RetryScheduled,
                    "request failed, retry scheduled"
                );
                self.enqueue(Pending {
                    item,
                    notify,
                    last_error,
                    owner_generation,
                });
            }
            RetryDecision::Exhausted(item) => {
                let remaining = self.finish(&item, owner_generation);
                error!(
                    id = %item.id,
                    attempts = item.attempt_count + 1,
                    error = ?last_error,
                    remaining,
                    "max retry attempts reached, dropping request"
                );
                Self::notify(
                    Pending {
                        item,
                        notify,
                        last_error,
                        owner_generation,
                    },
                    ItemState::Exhausted,
                );
            }
        }
    }

    // Terminal bookkeeping, returns the outstanding count afterwards
    fn finish(&self, item: &ScheduledItem, owner_generation: Option<u64>) -> usize {
        if let (Some(owner), Some(generation)) = (&item.owner_id, owner_generation) {
            self.shared.owners.release(owner, generation);
        }
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst) - 1
    }

    // Not a terminal transition; dropping `notify` tells a tracked caller
    fn discard(&self, pending: Pending) {
        debug!(id = %pending.item.id, attempt = pending.item.attempt_count, "discarding request");
        self.finish(&pending.item, pending.owner_generation);
    }

    fn notify(pending: Pending, state: ItemState) {
        if let Some(tx) = pending.notify {
            // receiver may have been dropped; nobody is waiting then
            let _ = tx.send(Outcome {
                id: pending.item.id,
                state,
                attempts: pending.item.attempt_count + 1,
                last_error: pending.last_error,
            });
        }
    }

    /// Runs until `shutdown` flips or every sender is gone. Whatever is still
    /// queued or buffered at that point is discarded; the count is returned.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        info!(policy = ?self.policy, "dispatch loop started");

        let sleep = tokio::time::sleep_until(Instant::now());
        tokio::pin!(sleep);

        let mut ticker = match self.policy {
            DispatchPolicy::FixedTick { tick_ms } => {
                let period = Duration::from_millis(tick_ms);
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(interval)
            }
            DispatchPolicy::TimerPerEarliest => None,
        };

        loop {
            if let Some(deadline) = self.armed {
                sleep.as_mut().reset(deadline);
            }

            // due work goes ahead of new submissions so a busy channel
            // cannot hold back the drain
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,
                _ = &mut sleep, if self.armed.is_some() => {
                    self.on_timer_fire().await;
                }
                _ = next_tick(&mut ticker) => {
                    self.on_timer_fire().await;
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Submit(pending)) => self.enqueue(pending),
                    None => break,
                },
            }
        }

        rx.close();
        let mut discarded = 0;
        while let Some(pending) = self.queue.remove_earliest() {
            self.discard(pending);
            discarded += 1;
        }
        while let Ok(Command::Submit(pending)) = rx.try_recv() {
            self.discard(pending);
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "dispatch loop stopped, pending requests discarded");
        } else {
            info!("dispatch loop stopped");
        }
        discarded
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

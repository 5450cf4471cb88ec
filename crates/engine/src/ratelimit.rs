// Priority-aware token bucket throttling all outbound API calls.
//
// Two lanes: interactive waiters always drain before background waiters,
// ties within a lane are FIFO. `pause` is the remote overload signal: it
// zeroes the bucket and blocks every grant until the deadline, and the
// drain timer fires again just after the pause window.
//
// One instance per process, passed in explicitly wherever it is needed.
// Known limitation: the bucket is process-local, so multi-process
// deployments need an external shared limiter in front of the API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_MAX_TOKENS: u32 = 3;
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

/// Scheduling priority for a rate-limiter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// User-facing reads and writes; always drained first.
    Interactive,
    /// Crawls, revalidation, batch jobs.
    Background,
}

struct State {
    tokens: u32,
    max_tokens: u32,
    refill_interval: Duration,
    last_refill: Instant,
    pause_until: Option<Instant>,
    interactive: VecDeque<oneshot::Sender<()>>,
    background: VecDeque<oneshot::Sender<()>>,
    drain_scheduled: bool,
}

impl State {
    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.pause_until {
            if now < until {
                return;
            }
            // Pause expired: the bucket restarts empty from the deadline.
            self.pause_until = None;
            self.last_refill = until;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos().max(1);
        if intervals == 0 {
            return;
        }
        if intervals >= u128::from(self.max_tokens) {
            // Long idle: the bucket is simply full again.
            self.tokens = self.max_tokens;
            self.last_refill = now;
        } else {
            let intervals = intervals as u32;
            self.tokens = self.tokens.saturating_add(intervals).min(self.max_tokens);
            self.last_refill += self.refill_interval * intervals;
        }
    }

    fn has_waiters(&self) -> bool {
        !self.interactive.is_empty() || !self.background.is_empty()
    }

    fn pop_next_waiter(&mut self) -> Option<oneshot::Sender<()>> {
        self.interactive.pop_front().or_else(|| self.background.pop_front())
    }

    /// Hand tokens to eligible waiters, interactive lane first.
    fn grant_waiters(&mut self) {
        if self.pause_until.is_some() {
            return;
        }
        while self.tokens > 0 {
            let Some(tx) = self.pop_next_waiter() else {
                break;
            };
            // A closed channel means the waiter gave up; its token stays.
            if tx.send(()).is_ok() {
                self.tokens -= 1;
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        if !self.has_waiters() {
            return None;
        }
        match self.pause_until {
            Some(until) => Some(until),
            None => Some(self.last_refill + self.refill_interval),
        }
    }
}

/// Token-bucket rate limiter with two priority lanes and a global pause.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<State>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    /// `max_tokens` per `window`, bucket starts full.
    pub fn new(max_tokens: u32, window: Duration) -> Self {
        let max_tokens = max_tokens.max(1);
        let refill_interval = (window / max_tokens).max(Duration::from_millis(1));
        Self {
            inner: Arc::new(Mutex::new(State {
                tokens: max_tokens,
                max_tokens,
                refill_interval,
                last_refill: Instant::now(),
                pause_until: None,
                interactive: VecDeque::new(),
                background: VecDeque::new(),
                drain_scheduled: false,
            })),
        }
    }

    /// Suspend until a slot is granted.
    pub async fn acquire(&self, priority: Priority) {
        let rx = {
            let mut state = self.inner.lock().expect("rate limiter lock poisoned");
            let now = Instant::now();
            state.refill(now);

            // Fast path only when nobody is queued, so a token freed while
            // waiters exist cannot let a newcomer jump the line.
            if state.pause_until.is_none() && state.tokens > 0 && !state.has_waiters() {
                state.tokens -= 1;
                return;
            }

            let (tx, rx) = oneshot::channel();
            match priority {
                Priority::Interactive => state.interactive.push_back(tx),
                Priority::Background => state.background.push_back(tx),
            }
            debug!(
                interactive = state.interactive.len(),
                background = state.background.len(),
                "rate limiter queueing caller"
            );
            self.schedule_drain_locked(&mut state);
            rx
        };

        // The drain task is the only sender; a closed channel only happens
        // when the limiter itself is torn down, in which case the grant is moot.
        let _ = rx.await;
    }

    /// Zero the bucket and block all grants for `duration`.
    ///
    /// Called when the remote API signals overload so concurrently running
    /// callers back off together. Extends but never shortens an existing pause.
    pub fn pause(&self, duration: Duration) {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        let until = Instant::now() + duration;
        state.tokens = 0;
        state.pause_until = Some(match state.pause_until {
            Some(existing) => existing.max(until),
            None => until,
        });
        warn!(pause_ms = duration.as_millis() as u64, "rate limiter paused by overload signal");
        if state.has_waiters() {
            self.schedule_drain_locked(&mut state);
        }
    }

    pub fn is_paused(&self) -> bool {
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        state.refill(Instant::now());
        state.pause_until.is_some()
    }

    /// Spawn the drain task if one is not already running. The task refills,
    /// grants eligible waiters, and sleeps until the next refill (or just
    /// past the pause deadline), exiting once the queues are empty.
    fn schedule_drain_locked(&self, state: &mut State) {
        if state.drain_scheduled {
            return;
        }
        state.drain_scheduled = true;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let wake_at = {
                    let mut state = inner.lock().expect("rate limiter lock poisoned");
                    state.refill(Instant::now());
                    state.grant_waiters();
                    match state.next_wake() {
                        Some(at) => at,
                        None => {
                            state.drain_scheduled = false;
                            return;
                        }
                    }
                };
                tokio::time::sleep_until(wake_at).await;
            }
        });
    }
}

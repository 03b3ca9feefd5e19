//! Admission control for the poll loop
//!
//! A [`Limiter`] decides whether one more job may start right now and, when it
//! may not, when it probably can. The poll loop records every start and every
//! finished attempt, so limiter state only changes through those calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait Limiter: Send + Sync {
    /// Whether one more job may start now. No side effects.
    async fn can_proceed(&self) -> bool;

    /// Called once per job handed to a consumer
    async fn record_job_start(&self);

    /// Called once per finished attempt, retried or not
    async fn record_job_completion(&self);

    /// Earliest time `can_proceed` is expected to flip to true
    async fn next_available_time(&self) -> DateTime<Utc>;

    /// Forget all recorded history
    async fn clear(&self);
}

fn to_delta(duration: Duration) -> chrono::Duration {
    // capped so that `now + delta` can never overflow
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration).map_or(cap, |delta| delta.min(cap))
}

/// Admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLimiter;

#[async_trait]
impl Limiter for NullLimiter {
    async fn can_proceed(&self) -> bool {
        true
    }

    async fn record_job_start(&self) {}

    async fn record_job_completion(&self) {}

    async fn next_available_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn clear(&self) {}
}

#[derive(Debug)]
struct ConcurrencyState {
    running: usize,
    next_start: DateTime<Utc>,
}

/// Caps jobs in flight and spaces out consecutive starts.
///
/// A cap of zero is treated as one.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    time_slice: chrono::Duration,
    state: Mutex<ConcurrencyState>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, time_slice: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            time_slice: to_delta(time_slice),
            state: Mutex::new(ConcurrencyState {
                running: 0,
                next_start: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }

    pub async fn running(&self) -> usize {
        self.state.lock().await.running
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    async fn can_proceed(&self) -> bool {
        let state = self.state.lock().await;
        state.running < self.max_concurrent && Utc::now() >= state.next_start
    }

    async fn record_job_start(&self) {
        let mut state = self.state.lock().await;
        state.running += 1;
        state.next_start = Utc::now() + self.time_slice;
    }

    async fn record_job_completion(&self) {
        let mut state = self.state.lock().await;
        state.running = state.running.saturating_sub(1);
    }

    async fn next_available_time(&self) -> DateTime<Utc> {
        let state = self.state.lock().await;
        let now = Utc::now();
        if state.running >= self.max_concurrent {
            // a slot frees on some completion; re-check after one slice
            return (now + self.time_slice).max(state.next_start);
        }
        state.next_start.max(now)
    }

    async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.running = 0;
        state.next_start = DateTime::<Utc>::MIN_UTC;
    }
}

/// Enforces a minimum gap between consecutive starts
#[derive(Debug)]
pub struct DelayLimiter {
    delay: chrono::Duration,
    next_start: Mutex<DateTime<Utc>>,
}

impl DelayLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: to_delta(delay),
            next_start: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }
}

#[async_trait]
impl Limiter for DelayLimiter {
    async fn can_proceed(&self) -> bool {
        Utc::now() >= *self.next_start.lock().await
    }

    async fn record_job_start(&self) {
        *self.next_start.lock().await = Utc::now() + self.delay;
    }

    async fn record_job_completion(&self) {}

    async fn next_available_time(&self) -> DateTime<Utc> {
        (*self.next_start.lock().await).max(Utc::now())
    }

    async fn clear(&self) {
        *self.next_start.lock().await = DateTime::<Utc>::MIN_UTC;
    }
}

/// At most `max_executions` starts inside any sliding `window`.
///
/// A `max_executions` of zero is treated as one.
#[derive(Debug)]
pub struct RateLimiter {
    max_executions: usize,
    window: chrono::Duration,
    starts: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(max_executions: usize, window: Duration) -> Self {
        Self {
            max_executions: max_executions.max(1),
            window: to_delta(window),
            starts: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, starts: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        while let Some(oldest) = starts.front() {
            if *oldest + self.window <= now {
                starts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    async fn can_proceed(&self) -> bool {
        let now = Utc::now();
        let starts = self.starts.lock().await;
        let in_window = starts.iter().filter(|at| **at + self.window > now).count();
        in_window < self.max_executions
    }

    async fn record_job_start(&self) {
        let now = Utc::now();
        let mut starts = self.starts.lock().await;
        self.prune(&mut starts, now);
        starts.push_back(now);
    }

    async fn record_job_completion(&self) {}

    async fn next_available_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut starts = self.starts.lock().await;
        self.prune(&mut starts, now);
        if starts.len() < self.max_executions {
            return now;
        }
        // the slot opens when enough old starts slide out of the window
        let idx = starts.len() - self.max_executions;
        starts[idx] + self.window
    }

    async fn clear(&self) {
        self.starts.lock().await.clear();
    }
}

/// Every held limiter must agree
#[derive(Default, Clone)]
pub struct CompositeLimiter {
    limiters: Vec<Arc<dyn Limiter>>,
}

impl CompositeLimiter {
    pub fn new(limiters: Vec<Arc<dyn Limiter>>) -> Self {
        Self { limiters }
    }

    pub fn add_limiter(&mut self, limiter: Arc<dyn Limiter>) {
        self.limiters.push(limiter);
    }

    pub fn with(mut self, limiter: impl Limiter + 'static) -> Self {
        self.limiters.push(Arc::new(limiter));
        self
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[async_trait]
impl Limiter for CompositeLimiter {
    async fn can_proceed(&self) -> bool {
        for limiter in &self.limiters {
            if !limiter.can_proceed().await {
                return false;
            }
        }
        true
    }

    async fn record_job_start(&self) {
        for limiter in &self.limiters {
            limiter.record_job_start().await;
        }
    }

    async fn record_job_completion(&self) {
        for limiter in &self.limiters {
            limiter.record_job_completion().await;
        }
    }

    async fn next_available_time(&self) -> DateTime<Utc> {
        let mut latest = Utc::now();
        for limiter in &self.limiters {
            latest = latest.max(limiter.next_available_time().await);
        }
        latest
    }

    async fn clear(&self) {
        for limiter in &self.limiters {
            limiter.clear().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed answers, counts how often it was consulted
    struct FixedLimiter {
        admit: bool,
        next: DateTime<Utc>,
        asked: AtomicUsize,
        starts: AtomicUsize,
    }

    impl FixedLimiter {
        fn new(admit: bool, next: DateTime<Utc>) -> Self {
            Self {
                admit,
                next,
                asked: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Limiter for FixedLimiter {
        async fn can_proceed(&self) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.admit
        }

        async fn record_job_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn record_job_completion(&self) {}

        async fn next_available_time(&self) -> DateTime<Utc> {
            self.next
        }

        async fn clear(&self) {}
    }

    #[tokio::test]
    async fn test_composite_denies_and_reports_latest_time() {
        let soon = Utc::now() + chrono::Duration::seconds(5);
        let later = Utc::now() + chrono::Duration::seconds(60);
        let denying = Arc::new(FixedLimiter::new(false, soon));
        let trailing = Arc::new(FixedLimiter::new(true, later));

        let composite =
            CompositeLimiter::new(vec![denying.clone() as Arc<dyn Limiter>, trailing.clone()]);

        assert!(!composite.can_proceed().await);
        // short-circuits on the first refusal
        assert_eq!(trailing.asked.load(Ordering::SeqCst), 0);
        assert_eq!(composite.next_available_time().await, later);

        composite.record_job_start().await;
        assert_eq!(denying.starts.load(Ordering::SeqCst), 1);
        assert_eq!(trailing.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_composite_admits() {
        let composite = CompositeLimiter::default();
        assert!(composite.is_empty());
        assert!(composite.can_proceed().await);
        assert!(composite.next_available_time().await <= Utc::now());
    }

    #[tokio::test]
    async fn test_concurrency_limiter_caps_in_flight() {
        let limiter = ConcurrencyLimiter::new(2, Duration::ZERO);

        assert!(limiter.can_proceed().await);
        limiter.record_job_start().await;
        assert!(limiter.can_proceed().await);
        limiter.record_job_start().await;
        assert!(!limiter.can_proceed().await);
        assert_eq!(limiter.running().await, 2);

        limiter.record_job_completion().await;
        assert!(limiter.can_proceed().await);

        limiter.clear().await;
        assert_eq!(limiter.running().await, 0);
    }

    #[tokio::test]
    async fn test_concurrency_limiter_spaces_starts() {
        let limiter = ConcurrencyLimiter::new(10, Duration::from_secs(30));
        limiter.record_job_start().await;

        assert!(!limiter.can_proceed().await);
        let next = limiter.next_available_time().await;
        assert!(next > Utc::now() + chrono::Duration::seconds(25));

        limiter.clear().await;
        assert!(limiter.can_proceed().await);
    }

    #[tokio::test]
    async fn test_delay_limiter() {
        let limiter = DelayLimiter::new(Duration::from_millis(50));
        assert!(limiter.can_proceed().await);

        limiter.record_job_start().await;
        assert!(!limiter.can_proceed().await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.can_proceed().await);
    }

    #[tokio::test]
    async fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        limiter.record_job_start().await;
        limiter.record_job_start().await;

        assert!(!limiter.can_proceed().await);
        assert!(limiter.next_available_time().await > Utc::now());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.can_proceed().await);
        assert!(limiter.next_available_time().await <= Utc::now());
    }

    #[tokio::test]
    async fn test_zero_limits_admit_one() {
        let rate = RateLimiter::new(0, Duration::from_secs(60));
        assert!(rate.can_proceed().await);
        assert!(rate.next_available_time().await <= Utc::now());
        rate.record_job_start().await;
        assert!(!rate.can_proceed().await);
        assert!(rate.next_available_time().await > Utc::now());

        let concurrency = ConcurrencyLimiter::new(0, Duration::ZERO);
        assert!(concurrency.can_proceed().await);
        concurrency.record_job_start().await;
        assert!(!concurrency.can_proceed().await);
        concurrency.record_job_completion().await;
        assert!(concurrency.can_proceed().await);
    }

    #[tokio::test]
    async fn test_null_limiter() {
        let limiter = NullLimiter;
        limiter.record_job_start().await;
        assert!(limiter.can_proceed().await);
    }
}

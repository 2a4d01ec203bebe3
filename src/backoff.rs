//! Bounded exponential backoff with jitter, deadline and cancellation.
//!
//! Waiting goes through a `Clock` so tests can run a whole retry ladder
//! without sleeping: `ManualClock` advances virtual time and records every
//! pause it was asked for.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Delay schedule for attempt `n` (1-based):
/// `min(max_delay, initial_delay * multiplier^(n-1))`, then scaled by a
/// factor drawn from `[1 - jitter, 1 + jitter]`
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before attempt `attempt`, with jitter applied
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_millis((base.as_millis() as f64 * factor).max(0.0) as u64)
    }
}

/// Random source for jitter, seeded for reproducible runs
pub fn jitter_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Source of time and pauses
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);

    /// Time since the clock was created
    fn elapsed(&self) -> Duration;
}

/// Wall clock backed by `std::thread::sleep`
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    sleeps: Vec<Duration>,
    cancel_after: Option<(usize, CancelToken)>,
}

/// Virtual clock: sleeping only advances time
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward, as a slow remote call would
    pub fn advance(&self, duration: Duration) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).now += duration;
    }

    /// Every pause requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }

    /// Total virtual time slept
    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }

    /// Fire `token` once `sleeps` pauses have completed
    pub fn cancel_after_sleeps(&self, sleeps: usize, token: CancelToken) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_after = Some((sleeps, token));
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.now += duration;
        state.sleeps.push(duration);
        if let Some((after, token)) = &state.cancel_after {
            if state.sleeps.len() >= *after {
                token.cancel();
            }
        }
    }

    fn elapsed(&self) -> Duration {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).now
    }
}

/// Why a paced wait did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// Waits on behalf of one retry loop, honoring its deadline and cancel token
pub struct Pacer<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancelToken,
    started: Duration,
    deadline: Option<Duration>,
}

impl<'a> Pacer<'a> {
    pub fn start(clock: &'a dyn Clock, cancel: &'a CancelToken, deadline: Option<Duration>) -> Self {
        Self {
            clock,
            cancel,
            started: clock.elapsed(),
            deadline,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed().saturating_sub(self.started)
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration` unless cancelled or the pause would cross the deadline
    pub fn wait(&self, duration: Duration) -> Result<(), Interrupt> {
        self.check()?;
        if let Some(deadline) = self.deadline {
            if self.elapsed() + duration > deadline {
                return Err(Interrupt::DeadlineExceeded);
            }
        }
        self.clock.sleep(duration);
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> Backoff {
        Backoff {
            jitter: 0.0,
            ..Backoff::default()
        }
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let backoff = Backoff {
            max_attempts: 6,
            ..no_jitter()
        };
        let delays: Vec<u64> = (1..=6)
            .map(|n| backoff.base_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        assert_eq!(
            no_jitter().base_delay(u32::MAX),
            Duration::from_millis(8000)
        );
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::default();
        let mut rng = jitter_rng(Some(7));
        for attempt in 1..=4 {
            let base = backoff.base_delay(attempt).as_millis() as f64;
            for _ in 0..200 {
                let d = backoff.delay(attempt, &mut rng).as_millis() as f64;
                assert!(d >= base * 0.8 - 1.0 && d <= base * 1.2 + 1.0);
            }
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let backoff = Backoff::default();
        let a: Vec<Duration> = {
            let mut rng = jitter_rng(Some(42));
            (1..=3).map(|n| backoff.delay(n, &mut rng)).collect()
        };
        let b: Vec<Duration> = {
            let mut rng = jitter_rng(Some(42));
            (1..=3).map(|n| backoff.delay(n, &mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_pacer_respects_deadline() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let pacer = Pacer::start(&clock, &cancel, Some(Duration::from_secs(5)));
        assert_eq!(pacer.wait(Duration::from_secs(3)), Ok(()));
        assert_eq!(
            pacer.wait(Duration::from_secs(3)),
            Err(Interrupt::DeadlineExceeded)
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(3)]);
    }

    #[test]
    fn test_pacer_measures_from_start() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(100));
        let cancel = CancelToken::new();
        let pacer = Pacer::start(&clock, &cancel, Some(Duration::from_secs(5)));
        assert_eq!(pacer.wait(Duration::from_secs(4)), Ok(()));
        assert_eq!(pacer.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_pacer_cancellation() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        clock.cancel_after_sleeps(1, cancel.clone());
        let pacer = Pacer::start(&clock, &cancel, None);
        assert_eq!(
            pacer.wait(Duration::from_secs(1)),
            Err(Interrupt::Cancelled)
        );
        assert_eq!(
            pacer.wait(Duration::from_secs(1)),
            Err(Interrupt::Cancelled)
        );
        assert_eq!(clock.sleeps().len(), 1);
    }
}

//! Virtual Time Manager
//!
//! Single source of "now" for every other exchange component. In `LIVE` mode
//! this returns wall-clock time; in `BACKTEST` mode it returns whatever time
//! the replay controller most recently set. No component outside this module
//! may call `SystemTime::now()` or `chrono::Utc::now()` directly.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Clock operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockMode {
    Live = 0,
    Backtest = 1,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("backtest time cannot move backward: current={current}ms requested={requested}ms")]
    BackwardJump { current: i64, requested: i64 },
}

/// Process-wide virtual clock.
///
/// Stored as atomics so it can be shared behind an `Arc` and read from any
/// worker thread without a lock on the hot timestamping path.
#[derive(Debug)]
pub struct TimeManager {
    mode: AtomicU8,
    virtual_now_ms: AtomicI64,
}

impl TimeManager {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode: AtomicU8::new(mode as u8),
            virtual_now_ms: AtomicI64::new(0),
        }
    }

    pub fn live() -> Self {
        Self::new(ClockMode::Live)
    }

    pub fn backtest(start_ms: i64) -> Self {
        let tm = Self::new(ClockMode::Backtest);
        tm.virtual_now_ms.store(start_ms, Ordering::SeqCst);
        tm
    }

    #[inline]
    pub fn mode(&self) -> ClockMode {
        match self.mode.load(Ordering::Acquire) {
            1 => ClockMode::Backtest,
            _ => ClockMode::Live,
        }
    }

    pub fn set_mode(&self, mode: ClockMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Current time in unix milliseconds.
    #[inline]
    pub fn now_ms(&self) -> i64 {
        match self.mode() {
            ClockMode::Live => wall_clock_ms(),
            ClockMode::Backtest => self.virtual_now_ms.load(Ordering::Acquire),
        }
    }

    /// Set the virtual clock. Only meaningful in `BACKTEST` mode, but is
    /// tracked regardless of mode so a mode switch mid-run resumes from the
    /// last value that was set. Rejects backward movement.
    pub fn set_backtest_time(&self, t_ms: i64) -> Result<(), TimeError> {
        let current = self.virtual_now_ms.load(Ordering::Acquire);
        if t_ms < current {
            return Err(TimeError::BackwardJump {
                current,
                requested: t_ms,
            });
        }
        self.virtual_now_ms.store(t_ms, Ordering::Release);
        Ok(())
    }

    /// Advance the virtual clock forward by `dt_seconds`. Convenience over
    /// `set_backtest_time` for monotonic forward steps.
    pub fn advance(&self, dt_seconds: f64) -> Result<(), TimeError> {
        let current = self.virtual_now_ms.load(Ordering::Acquire);
        let delta_ms = (dt_seconds * 1000.0).round() as i64;
        self.set_backtest_time(current + delta_ms)
    }
}

impl Default for TimeManager {
    fn default() -> Self {
        Self::live()
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtest_clock_holds_set_value() {
        let tm = TimeManager::backtest(1_000);
        assert_eq!(tm.now_ms(), 1_000);
        tm.set_backtest_time(2_500).unwrap();
        assert_eq!(tm.now_ms(), 2_500);
    }

    #[test]
    fn backtest_clock_rejects_backward_jump() {
        let tm = TimeManager::backtest(5_000);
        let err = tm.set_backtest_time(4_000).unwrap_err();
        assert_eq!(
            err,
            TimeError::BackwardJump {
                current: 5_000,
                requested: 4_000
            }
        );
        // Rejected jump must not mutate state.
        assert_eq!(tm.now_ms(), 5_000);
    }

    #[test]
    fn advance_moves_forward_by_seconds() {
        let tm = TimeManager::backtest(0);
        tm.advance(1.5).unwrap();
        assert_eq!(tm.now_ms(), 1_500);
    }

    #[test]
    fn live_mode_tracks_wall_clock() {
        let tm = TimeManager::live();
        let before = wall_clock_ms();
        let now = tm.now_ms();
        assert!(now >= before);
    }

    #[test]
    fn mode_switch_resumes_from_last_virtual_value() {
        let tm = TimeManager::backtest(10_000);
        tm.set_mode(ClockMode::Live);
        assert!(tm.now_ms() > 10_000); // wall clock, not virtual
        tm.set_mode(ClockMode::Backtest);
        assert_eq!(tm.now_ms(), 10_000);
    }
}

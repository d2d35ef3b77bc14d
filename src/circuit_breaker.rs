//! Failure breaker for one strategy run
//!
//! قطع زودهنگام: وقتی تعداد شکست‌ها به آستانه برسد، استراتژی کنار گذاشته می‌شود

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// حالت breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Probes may still be scheduled
    Closed,
    /// Strategy declared non-viable
    Open,
}

/// Counts probe failures for the active strategy. Once the count reaches the
/// threshold the breaker opens and stays open; a strategy is never retried
/// within the same run, so there is no half-open state.
#[derive(Debug)]
pub struct CircuitBreaker {
    open: AtomicBool,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    failure_threshold: u32,
}

impl CircuitBreaker {
    /// A threshold of 0 is treated as 1
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            open: AtomicBool::new(false),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// ثبت خطا; returns true when this failure opened the breaker
    pub fn record_failure(&self) -> bool {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold as u64 {
            return !self.open.swap(true, Ordering::SeqCst);
        }
        false
    }

    /// ثبت موفقیت
    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn get_state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

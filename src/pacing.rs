#[cfg(test)]
use std::cell::RefCell;
use std::time::Duration;

use tracing::debug;

/// Bounded retry: up to `attempts` tries, `delay` between consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        debug!("Pausing for {}s", duration.as_secs());
        std::thread::sleep(duration);
    }
}

/// Records requested pauses instead of blocking.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub fn pauses(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

use std::thread;
use std::time::{Duration, Instant};

/// Pacing accuracy requested for the transmit scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAccuracy {
    /// Busy-wait on the monotonic clock. Accurate to a few microseconds but
    /// burns a core while waiting.
    High,
    /// OS sleep. Cheap, accuracy limited by the scheduler tick.
    Low,
}

/// Microsecond delay primitive used by the transmit scheduler.
///
/// Arguments that are zero or negative are no-ops.
pub trait Pacer: Send {
    fn udelay(&self, usec: i64);
}

/// Spin on [`Instant`] until the target is reached.
#[derive(Debug, Default)]
pub struct BusyWait;

impl Pacer for BusyWait {
    fn udelay(&self, usec: i64) {
        if usec <= 0 {
            return;
        }
        let target = Duration::from_micros(usec as u64);
        let start = Instant::now();
        while start.elapsed() < target {}
    }
}

/// Delegate to the OS sleep.
#[derive(Debug, Default)]
pub struct OsSleep;

impl Pacer for OsSleep {
    fn udelay(&self, usec: i64) {
        if usec <= 0 {
            return;
        }
        thread::sleep(Duration::from_micros(usec as u64));
    }
}

pub fn pacer_for(accuracy: RateAccuracy) -> Box<dyn Pacer> {
    match accuracy {
        RateAccuracy::High => Box::new(BusyWait),
        RateAccuracy::Low => Box::new(OsSleep),
    }
}

/// Charge the accumulated overhead against a scheduled delay.
///
/// Returns `(sleep_usec, residual_overhead)`: the time actually to sleep, and
/// the overhead carried into the next scheduling decision. The residual is
/// always <= 0 — a positive combined value is fully consumed by sleeping.
pub fn settle_delay(delay_usec: i64, overhead: i64) -> (i64, i64) {
    debug_assert!(overhead <= 0);
    let combined = delay_usec + overhead;
    if combined > 0 {
        (combined, 0)
    } else {
        (0, combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_consumes_overhead_before_sleeping() {
        // No overhead: sleep the full delay.
        assert_eq!(settle_delay(100, 0), (100, 0));
        // Overhead smaller than the delay: sleep the difference.
        assert_eq!(settle_delay(100, -40), (60, 0));
        // Overhead swallows the delay entirely: no sleep, carry the rest.
        assert_eq!(settle_delay(100, -150), (0, -50));
        // Exact cancellation: no sleep, nothing carried.
        assert_eq!(settle_delay(100, -100), (0, 0));
        // Zero delay only accumulates.
        assert_eq!(settle_delay(0, -10), (0, -10));
    }

    #[test]
    fn busy_wait_reaches_target() {
        let start = Instant::now();
        BusyWait.udelay(2_000);
        assert!(start.elapsed() >= Duration::from_micros(2_000));
    }

    #[test]
    fn os_sleep_reaches_target() {
        let start = Instant::now();
        OsSleep.udelay(2_000);
        assert!(start.elapsed() >= Duration::from_micros(2_000));
    }

    #[test]
    fn non_positive_delays_are_noops() {
        let start = Instant::now();
        BusyWait.udelay(0);
        BusyWait.udelay(-5);
        OsSleep.udelay(0);
        OsSleep.udelay(-5);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}

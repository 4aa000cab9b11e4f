//! Settle timing for hub reset sequencing
//!
//! Reset and boot-select edges come with hardware settle requirements. The
//! bounds are minimums: a range `min..max` always waits at least `min`.

use embedded_hal::delay::DelayNs;

/// Delay source used for GPIO sequencing
pub struct SettleTimer<D> {
    delay: D,
}

impl<D: DelayNs> SettleTimer<D> {
    /// Create a new settle timer
    pub const fn new(delay: D) -> Self {
        Self { delay }
    }

    /// Sleep for somewhere in `min_us..=max_us`; never less than `min_us`.
    pub fn sleep_range_us(&mut self, min_us: u32, max_us: u32) {
        debug_assert!(min_us <= max_us);
        self.delay.delay_us(min_us);
    }

    /// Sleep for at least `ms` milliseconds
    pub fn sleep_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Access the underlying delay
    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingDelay;

    #[test]
    fn ranges_wait_the_lower_bound() {
        let delay = RecordingDelay::default();
        let mut timer = SettleTimer::new(delay.clone());
        timer.sleep_range_us(5_000, 10_000);
        timer.sleep_ms(400);
        assert_eq!(delay.total_us(), 405_000);
    }
}

//! CPU Clock.
use std::time::Instant;

use crate::vm::Hz;

/// Elapsed-time anchor used to pace the virtual CPU.
///
/// The driver re-anchors the clock after every executed instruction. The
/// time elapsed since then, multiplied by the clock rate, is the number of
/// instructions owed to the program at the next tick.
pub(crate) struct Clock(Instant);

impl Clock {
    /// Creates a new clock with the current time as internal state.
    pub(crate) fn new() -> Self {
        Self(Instant::now())
    }

    #[cfg(test)]
    pub(crate) fn new_at(instant: Instant) -> Self {
        Self(instant)
    }

    /// Set the clock state back to zero.
    pub(crate) fn reset(&mut self) {
        self.0 = Instant::now()
    }

    pub(crate) fn elapsed_secs(&self) -> f64 {
        self.0.elapsed().as_secs_f64()
    }

    /// Number of whole instructions that fit in the elapsed time at the given rate.
    ///
    /// Capped at one second worth of instructions. If the driver was
    /// stalled for a long time, it should simply continue at its usual
    /// speed rather than trying to catch up.
    pub(crate) fn budget(&self, rate: Hz) -> u64 {
        let owed = (self.elapsed_secs() * rate.0 as f64).floor() as u64;
        owed.min(rate.0)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_budget() {
        let clock = Clock(Instant::now() - Duration::from_millis(100));
        let budget = clock.budget(Hz(500));
        // 100ms at 500 Hz, plus whatever time the test itself took.
        assert!((50..=60).contains(&budget), "budget was {budget}");
    }

    #[test]
    fn test_budget_capped() {
        let clock = Clock(Instant::now() - Duration::from_secs(10));
        assert_eq!(clock.budget(Hz(60)), 60);
    }

    #[test]
    fn test_budget_reset() {
        let mut clock = Clock(Instant::now() - Duration::from_secs(2));
        clock.reset();
        assert_eq!(clock.budget(Hz(1)), 0);
    }
}

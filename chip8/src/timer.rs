//! Delay and sound timers.
//!
//! The timers are not decremented by a counter. Each timer remembers the
//! instant it was last written and the value written, and its current
//! value is derived from the wall-clock time elapsed since then. Pausing
//! instruction execution therefore never makes the timers drift.
use std::time::Instant;

use crate::constants::*;

/// A countdown register running at 60 Hz.
#[derive(Debug, Clone, Copy)]
pub struct CountdownTimer {
    /// Moment the timer was last written.
    set_at: Instant,
    /// Value the timer was last written with.
    set_value: u8,
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self {
            set_at: Instant::now(),
            set_value: 0,
        }
    }
}

impl CountdownTimer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Start counting down from the given value, anchored at the current time.
    pub fn set(&mut self, value: u8) {
        self.set_from(value, Instant::now())
    }

    /// Start counting down from the given value, anchored at `now`.
    pub fn set_from(&mut self, value: u8, now: Instant) {
        self.set_at = now;
        self.set_value = value;
    }

    /// Current value of the timer.
    #[inline]
    pub fn value(&self) -> u8 {
        self.value_at(Instant::now())
    }

    /// Value of the timer as observed at the given instant.
    ///
    /// `max(0, set_value - floor(60 * elapsed_seconds))`
    pub fn value_at(&self, now: Instant) -> u8 {
        let elapsed = now.saturating_duration_since(self.set_at);
        let ticks = elapsed.as_nanos() * DELAY_FREQUENCY as u128 / NANOS_IN_SECOND as u128;
        (self.set_value as u128).saturating_sub(ticks) as u8
    }
}

/// Timer subsystem of the machine.
#[derive(Debug, Default, Clone)]
pub struct Timers {
    /// (DT) Delay timer that counts down to 0.
    pub delay: CountdownTimer,
    /// (ST) Sound timer that counts down to 0. When it has a non-zero value, a beep is played.
    pub sound: CountdownTimer,
    /// Switch tracking whether the buzzer should be on or off.
    buzzer_state: bool,
}

impl Timers {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether the buzzer is currently switched on.
    #[inline]
    pub fn buzzer_state(&self) -> bool {
        self.buzzer_state
    }

    /// Evaluate the sound timer and report buzzer edges.
    ///
    /// Returns `Some(true)` when the tone must start, `Some(false)`
    /// when it must stop, and `None` when nothing changed.
    pub fn update(&mut self) -> Option<bool> {
        self.update_at(Instant::now())
    }

    pub fn update_at(&mut self, now: Instant) -> Option<bool> {
        let sound = self.sound.value_at(now);

        // Buzzer should be on while sound timer counts down,
        // then turned off when the timer reaches zero.
        if sound > 0 && !self.buzzer_state {
            self.buzzer_state = true;
            Some(true)
        } else if sound == 0 && self.buzzer_state {
            self.buzzer_state = false;
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_countdown_formula() {
        let start = Instant::now();
        let mut timer = CountdownTimer::new();
        timer.set_from(30, start);

        assert_eq!(timer.value_at(start), 30);
        // Less than one 60 Hz tick has passed.
        assert_eq!(timer.value_at(start + Duration::from_millis(16)), 30);
        assert_eq!(timer.value_at(start + Duration::from_millis(17)), 29);
        assert_eq!(timer.value_at(start + Duration::from_millis(250)), 15);
        // Exactly value / 60 seconds later the timer is spent.
        assert_eq!(timer.value_at(start + Duration::from_millis(500)), 0);
        // Never goes negative.
        assert_eq!(timer.value_at(start + Duration::from_secs(60)), 0);
    }

    #[test]
    fn test_countdown_monotonic() {
        let start = Instant::now();
        let mut timer = CountdownTimer::new();
        timer.set_from(255, start);

        let mut last = timer.value_at(start);
        for millis in (0..5000).step_by(7) {
            let value = timer.value_at(start + Duration::from_millis(millis));
            assert!(value <= last);
            last = value;
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn test_observed_before_set() {
        let start = Instant::now();
        let mut timer = CountdownTimer::new();
        timer.set_from(10, start + Duration::from_secs(1));

        // Instants before the anchor count as zero elapsed time.
        assert_eq!(timer.value_at(start), 10);
    }

    #[test]
    fn test_buzzer_edges() {
        let start = Instant::now();
        let mut timers = Timers::new();
        assert_eq!(timers.update_at(start), None);

        timers.sound.set_from(6, start);
        assert_eq!(timers.update_at(start), Some(true));
        assert!(timers.buzzer_state());
        assert_eq!(timers.update_at(start + Duration::from_millis(50)), None);

        // 6 ticks at 60 Hz is 100ms
        assert_eq!(
            timers.update_at(start + Duration::from_millis(100)),
            Some(false)
        );
        assert!(!timers.buzzer_state());
        assert_eq!(timers.update_at(start + Duration::from_millis(200)), None);
    }
}

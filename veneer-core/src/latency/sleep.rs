//! Precise absolute-time sleep.

use std::time::{Duration, Instant};

/// Portion of the sleep that is busy-waited for accuracy; OS timers
/// routinely overshoot by more than this.
const SPIN_WINDOW: Duration = Duration::from_micros(200);

/// Sleeps until `target`, measured against `now`. Uses the OS sleep for
/// the bulk of the wait and spins for the final stretch.
pub fn sleep_until(now: Instant, target: Instant) {
    if target <= now {
        return;
    }

    let duration = target - now;

    if duration > SPIN_WINDOW {
        std::thread::sleep(duration - SPIN_WINDOW);
    }

    while Instant::now() < target {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeps_at_least_until_target() {
        let now = Instant::now();
        let target = now + Duration::from_millis(2);

        sleep_until(now, target);
        assert!(Instant::now() >= target);
    }

    #[test]
    fn past_target_returns_immediately() {
        let now = Instant::now();
        sleep_until(now + Duration::from_millis(5), now);
        assert!(Instant::now() < now + Duration::from_millis(5));
    }
}

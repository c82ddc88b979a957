use crate::TimeNs;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A clock that starts at a recorded wall-clock time and then progresses as
/// a steady clock, optionally slowed down or sped up.
///
/// The returned time stays the same between `tick()` calls; the more often
/// `tick()` is called, the more precise the time is.
pub struct SimTime {
    speed: f64,
    wall_start: TimeNs,
    steady_start: Instant,
    steady_delta: AtomicI64,
}

impl SimTime {
    /// `speed` of 0 means "as fast as possible": `now()` is always far in
    /// the future so nothing ever waits on it.
    pub fn new(wall_start: TimeNs, speed: f64) -> Self {
        Self {
            speed,
            wall_start,
            steady_start: Instant::now(),
            steady_delta: AtomicI64::new(0),
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    fn speed_adjusted_delta(&self) -> i64 {
        let delta = self.steady_delta.load(Ordering::Acquire);
        if self.speed == 0.0 {
            i64::MAX / 2
        } else {
            (self.speed * delta as f64) as i64
        }
    }

    /// Simulated wall-clock time, in nanoseconds since the epoch.
    pub fn now(&self) -> TimeNs {
        self.wall_start.saturating_add(self.speed_adjusted_delta())
    }

    /// Duration since the start time.
    pub fn delta(&self) -> i64 {
        self.speed_adjusted_delta()
    }

    /// Advance the clock to the current steady time. Monotone even when
    /// ticked from several threads.
    pub fn tick(&self) -> &Self {
        let steady_delta = self.steady_start.elapsed().as_nanos() as i64;
        let mut expected = self.steady_delta.load(Ordering::Relaxed);
        while steady_delta > expected {
            match self.steady_delta.compare_exchange_weak(
                expected,
                steady_delta,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => expected = seen,
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_does_not_move_between_ticks() {
        let sim = SimTime::new(1_000_000, 1.0);
        sim.tick();
        let a = sim.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(sim.now(), a);
        sim.tick();
        assert!(sim.now() > a);
    }

    #[test]
    fn zero_speed_is_always_in_the_future() {
        let sim = SimTime::new(0, 0.0);
        sim.tick();
        assert!(sim.now() > crate::now_ns());
    }

    #[test]
    fn half_speed_lags_real_time() {
        let sim = SimTime::new(0, 0.5);
        std::thread::sleep(std::time::Duration::from_millis(10));
        sim.tick();
        let delta = sim.delta();
        assert!(delta > 0);
        assert!(delta < sim.steady_start.elapsed().as_nanos() as i64);
    }
}

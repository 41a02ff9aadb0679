//! Watchdog timers declaring silent peers dead.
//!
//! A [`Watchdog`] is a rearmable deadline on the monotonic clock: `feed()`
//! pushes the deadline out by the expected interval, `poll()` reports an
//! expiry exactly once per violation (edge-triggered, rearmed by the next
//! feed). Wall-clock jumps never restart a watchdog.
//!
//! The networking thread that owns many peers keeps their watchdogs in one
//! [`TimerWheel`] and polls it as part of its loop, so expiry is just
//! another suspension point rather than a separate timer thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Expected feed interval for a stream running at `fps`:
/// `ceil(1500 ms + 2 * 1000/fps)`.
///
/// The slack covers one-and-a-half seconds of scheduling jitter plus two
/// frame periods; a gap beyond it means the peer stopped sending.
pub fn expected_interval(fps: u8) -> Duration {
    let fps = fps.max(1) as u64;
    Duration::from_millis(1500 + (2000 + fps - 1) / fps)
}

/// A single rearmable timeout
#[derive(Debug)]
pub struct Watchdog {
    interval: Duration,
    deadline: Instant,
    armed: bool,
}

impl Watchdog {
    /// Create an armed watchdog expiring `interval` from `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            deadline: now + interval,
            armed: true,
        }
    }

    /// Change the expected interval and rearm from `now`
    pub fn set_expected_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        self.deadline = now + interval;
        self.armed = true;
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Rearm: the peer showed signs of life
    #[inline]
    pub fn feed(&mut self, now: Instant) {
        self.deadline = now + self.interval;
        self.armed = true;
    }

    /// Returns `true` exactly once per violated interval; disarmed until
    /// the next `feed`.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.armed && now >= self.deadline {
            self.armed = false;
            return true;
        }
        false
    }
}

/// A set of watchdogs owned and polled by a single thread.
///
/// Keys are whatever the owner uses to identify peers.
#[derive(Debug, Default)]
pub struct TimerWheel<K: Eq + Hash + Copy> {
    slots: HashMap<K, Watchdog>,
}

impl<K: Eq + Hash + Copy> TimerWheel<K> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, interval: Duration, now: Instant) {
        self.slots.insert(key, Watchdog::new(interval, now));
    }

    pub fn remove(&mut self, key: &K) {
        self.slots.remove(key);
    }

    pub fn feed(&mut self, key: &K, now: Instant) {
        if let Some(dog) = self.slots.get_mut(key) {
            dog.feed(now);
        }
    }

    pub fn set_interval(&mut self, key: &K, interval: Duration, now: Instant) {
        if let Some(dog) = self.slots.get_mut(key) {
            dog.set_expected_interval(interval, now);
        }
    }

    /// Collect every watchdog that expired since the last poll
    pub fn poll_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        for (key, dog) in self.slots.iter_mut() {
            if dog.poll(now) {
                expired.push(*key);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_interval_formula() {
        // 1500 + 2 * 1000/10 = 1700
        assert_eq!(expected_interval(10), Duration::from_millis(1700));
        // 1500 + ceil(2000/24) = 1500 + 84
        assert_eq!(expected_interval(24), Duration::from_millis(1584));
        // 1500 + ceil(2000/60) = 1500 + 34
        assert_eq!(expected_interval(60), Duration::from_millis(1534));
    }

    #[test]
    fn test_expiry_is_edge_triggered() {
        let t0 = Instant::now();
        let mut dog = Watchdog::new(Duration::from_millis(100), t0);

        assert!(!dog.poll(t0 + Duration::from_millis(99)));
        assert!(dog.poll(t0 + Duration::from_millis(100)));
        // Fires once per violation
        assert!(!dog.poll(t0 + Duration::from_millis(200)));

        dog.feed(t0 + Duration::from_millis(200));
        assert!(!dog.poll(t0 + Duration::from_millis(250)));
        assert!(dog.poll(t0 + Duration::from_millis(300)));
    }

    #[test]
    fn test_feed_pushes_deadline() {
        let t0 = Instant::now();
        let mut dog = Watchdog::new(Duration::from_millis(100), t0);

        // Feeds at a cadence shorter than the interval never expire
        for i in 1..=10 {
            let now = t0 + Duration::from_millis(i * 50);
            assert!(!dog.poll(now));
            dog.feed(now);
        }
        // A gap longer than the interval does
        assert!(dog.poll(t0 + Duration::from_millis(500 + 101)));
    }

    #[test]
    fn test_wheel_tracks_multiple_peers() {
        let t0 = Instant::now();
        let mut wheel: TimerWheel<u64> = TimerWheel::new();
        wheel.insert(1, Duration::from_millis(100), t0);
        wheel.insert(2, Duration::from_millis(300), t0);

        wheel.feed(&1, t0 + Duration::from_millis(90));

        let expired = wheel.poll_expired(t0 + Duration::from_millis(150));
        assert!(expired.is_empty());

        let expired = wheel.poll_expired(t0 + Duration::from_millis(200));
        assert_eq!(expired, vec![1]);

        let mut expired = wheel.poll_expired(t0 + Duration::from_millis(400));
        expired.sort_unstable();
        assert_eq!(expired, vec![2]);

        wheel.remove(&1);
        wheel.remove(&2);
        assert!(wheel.is_empty());
    }
}

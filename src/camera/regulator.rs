//! Adaptive resolution regulation.
//!
//! The camera lowers its stream resolution when stations visibly fail to
//! keep up (transmit watchdog timeouts, deep send queues) and raises it
//! again after a long quiet period. All decisions are pure functions of
//! injected timestamps, so the policy is testable without sleeping.
//!
//! Policy:
//! - >= 2 watchdog timeouts within the 10 s window, or an average send
//!   queue depth above 2 frames, steps the resolution **down** one level
//!   (never below QCIF);
//! - 30 s with zero timeouts and queue depth <= 1 steps **up** one level
//!   (never above the administrative ceiling);
//! - at most one change per 10 s window, preventing oscillation.

use crate::types::Resolution;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Congestion observation window
const WINDOW: Duration = Duration::from_secs(10);

/// Quiet time required before stepping back up
const UPGRADE_AFTER: Duration = Duration::from_secs(30);

/// EWMA smoothing for queue depth samples
const DEPTH_ALPHA: f32 = 0.2;

pub struct ResolutionRegulator {
    enabled: bool,
    ceiling: Resolution,
    timeouts: VecDeque<Instant>,
    depth_ewma: f32,
    last_change: Option<Instant>,
    calm_since: Instant,
}

impl ResolutionRegulator {
    pub fn new(enabled: bool, ceiling: Resolution, now: Instant) -> Self {
        Self {
            enabled,
            ceiling,
            timeouts: VecDeque::new(),
            depth_ewma: 0.0,
            last_change: None,
            calm_since: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled && !self.enabled {
            // Start the quiet clock fresh; history from the disabled period
            // must not trigger an immediate step
            self.timeouts.clear();
            self.depth_ewma = 0.0;
            self.calm_since = now;
        }
        self.enabled = enabled;
    }

    pub fn set_ceiling(&mut self, ceiling: Resolution) {
        self.ceiling = ceiling;
    }

    /// A peer's transmit watchdog expired
    pub fn record_timeout(&mut self, now: Instant) {
        self.timeouts.push_back(now);
        self.calm_since = now;
    }

    /// Sample the average send-queue depth across peers
    pub fn observe_queue_depth(&mut self, average_depth: f32, now: Instant) {
        self.depth_ewma += DEPTH_ALPHA * (average_depth - self.depth_ewma);
        if average_depth > 1.0 {
            self.calm_since = now;
        }
    }

    /// Decide whether the resolution should change. Returns the new level
    /// when a step is due.
    pub fn evaluate(&mut self, current: Resolution, now: Instant) -> Option<Resolution> {
        if !self.enabled {
            return None;
        }

        while let Some(&oldest) = self.timeouts.front() {
            if now.duration_since(oldest) > WINDOW {
                self.timeouts.pop_front();
            } else {
                break;
            }
        }

        // Monotonic per window: one change, then hold
        if let Some(changed) = self.last_change {
            if now.duration_since(changed) < WINDOW {
                return None;
            }
        }

        let congested = self.timeouts.len() >= 2 || self.depth_ewma > 2.0;
        if congested {
            let lower = current.step_down();
            if lower != current {
                self.last_change = Some(now);
                return Some(lower);
            }
            return None;
        }

        let quiet = self.timeouts.is_empty()
            && self.depth_ewma <= 1.0
            && now.duration_since(self.calm_since) >= UPGRADE_AFTER;
        if quiet && current < self.ceiling {
            let higher = current.step_up();
            self.last_change = Some(now);
            return Some(higher);
        }

        None
    }
}

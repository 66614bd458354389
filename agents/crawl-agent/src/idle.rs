//! Idle Tracker
//!
//! Active/idle state machine driven by user activity signals. The tracker is
//! pure: callers pass in the current instant and arm their own timer from
//! [`IdleTracker::deadline`].

use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default time without activity before the agent counts as idle
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Activity that resets the idle timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    PointerMove,
    PointerPress,
    KeyPress,
    Scroll,
    Touch,
    Wheel,
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pointer_move" | "mousemove" | "pointermove" => Ok(ActivityKind::PointerMove),
            "pointer_press" | "mousedown" | "pointerdown" | "click" => Ok(ActivityKind::PointerPress),
            "key_press" | "keydown" | "keypress" => Ok(ActivityKind::KeyPress),
            "scroll" => Ok(ActivityKind::Scroll),
            "touch" | "touchstart" | "touchmove" => Ok(ActivityKind::Touch),
            "wheel" => Ok(ActivityKind::Wheel),
            other => Err(format!("not a qualifying activity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTransition {
    BecameIdle { since: Instant },
    BecameActive { idle_for: Duration },
}

pub struct IdleTracker {
    is_idle: bool,
    idle_since: Option<Instant>,
    last_activity: Instant,
    threshold: Duration,
}

impl IdleTracker {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            is_idle: false,
            idle_since: None,
            last_activity: now,
            threshold,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// How long the agent has been idle, `None` while active
    pub fn idle_duration(&self, now: Instant) -> Option<Duration> {
        self.idle_since.map(|since| now.saturating_duration_since(since))
    }

    /// When the agent turns idle if nothing else happens. `None` while idle.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_idle {
            None
        } else {
            Some(self.last_activity + self.threshold)
        }
    }

    /// Register qualifying activity. Returns a transition only when leaving idle.
    pub fn record_activity(&mut self, now: Instant) -> Option<IdleTransition> {
        self.last_activity = now;

        if !self.is_idle {
            return None;
        }

        let idle_for = self.idle_duration(now).unwrap_or_default();
        self.is_idle = false;
        self.idle_since = None;
        info!(idle_secs = idle_for.as_secs(), "User active again");
        Some(IdleTransition::BecameActive { idle_for })
    }

    /// Check the threshold. Returns a transition only when entering idle.
    pub fn poll(&mut self, now: Instant) -> Option<IdleTransition> {
        if self.is_idle || now.saturating_duration_since(self.last_activity) < self.threshold {
            return None;
        }

        self.is_idle = true;
        self.idle_since = Some(now);
        info!(threshold_secs = self.threshold.as_secs(), "User idle");
        Some(IdleTransition::BecameIdle { since: now })
    }

    /// Change the threshold; the running countdown is measured against the new value
    pub fn set_threshold(&mut self, threshold: Duration) -> bool {
        if threshold.is_zero() {
            warn!("Ignoring zero idle threshold");
            return false;
        }
        debug!(
            old_ms = self.threshold.as_millis() as u64,
            new_ms = threshold.as_millis() as u64,
            "Idle threshold changed"
        );
        self.threshold = threshold;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(300);

    #[test]
    fn test_stays_active_before_threshold() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(T, start);

        assert_eq!(tracker.poll(start + T - Duration::from_millis(1)), None);
        assert!(!tracker.is_idle());
    }

    #[test]
    fn test_becomes_idle_once_at_threshold() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(T, start);

        assert_eq!(
            tracker.poll(start + T),
            Some(IdleTransition::BecameIdle { since: start + T })
        );
        // Repeated checks and status queries do not notify again
        assert_eq!(tracker.poll(start + T * 2), None);
        assert!(tracker.is_idle());
        assert_eq!(tracker.idle_duration(start + T * 2), Some(T));
    }

    #[test]
    fn test_activity_resets_timer() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(T, start);

        let touch = start + Duration::from_secs(200);
        assert_eq!(tracker.record_activity(touch), None);
        assert_eq!(tracker.poll(start + T), None);
        assert_eq!(tracker.deadline(), Some(touch + T));
    }

    #[test]
    fn test_activity_while_idle_flips_once() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(T, start);
        tracker.poll(start + T);

        let back = start + T + Duration::from_secs(10);
        assert_eq!(
            tracker.record_activity(back),
            Some(IdleTransition::BecameActive {
                idle_for: Duration::from_secs(10)
            })
        );
        assert_eq!(tracker.record_activity(back + Duration::from_secs(1)), None);
        assert!(tracker.idle_duration(back).is_none());
    }

    #[test]
    fn test_no_deadline_while_idle() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(T, start);
        tracker.poll(start + T);
        assert_eq!(tracker.deadline(), None);
    }

    #[test]
    fn test_threshold_change() {
        let start = Instant::now();
        let mut tracker = IdleTracker::new(T, start);

        assert!(!tracker.set_threshold(Duration::ZERO));
        assert!(tracker.set_threshold(Duration::from_secs(60)));
        assert_eq!(tracker.deadline(), Some(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_activity_kind_parsing() {
        assert_eq!("mousemove".parse::<ActivityKind>(), Ok(ActivityKind::PointerMove));
        assert_eq!("wheel".parse::<ActivityKind>(), Ok(ActivityKind::Wheel));
        assert!("focus".parse::<ActivityKind>().is_err());
    }
}

//! # Congestion Throttle
//!
//! A send-probability scale for unreliable-class traffic.
//!
//! The throttle holds an integer value between 0 (worst) and a fixed ceiling
//! (best). Once per interval window the reliable loss ratio is inspected:
//! above the threshold the value drops multiplicatively, below it the value
//! rises additively. Unreliable sends are admitted with probability
//! `value / scale`, so sustained loss sheds best-effort traffic first while
//! reliable delivery keeps retransmitting.

use std::time::Duration;

use quanta::Instant;
use rand::Rng;

use crate::wire::ThrottleBody;

/// Default interval between throttle adjustments.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(5000);
/// Default additive step on a clean window.
pub const DEFAULT_THROTTLE_ACCELERATION: u32 = 2;
/// Default divisor on a lossy window.
pub const DEFAULT_THROTTLE_DECELERATION: u32 = 2;
/// Default scale ceiling.
pub const DEFAULT_THROTTLE_SCALE: u32 = 32;
/// Default loss threshold in permille (5%).
pub const DEFAULT_THROTTLE_THRESHOLD_PERMILLE: u32 = 50;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tunable throttle parameters. Also travels on the wire so both sides of a
/// connection agree on the remote's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Window length between adjustments.
    pub interval: Duration,
    /// Additive increase applied after a window under the loss threshold.
    pub acceleration: u32,
    /// Divisor applied after a window over the loss threshold.
    pub deceleration: u32,
    /// Ceiling of the throttle value.
    pub scale: u32,
    /// Loss ratio, in permille, separating clean windows from lossy ones.
    pub threshold_permille: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            interval: DEFAULT_THROTTLE_INTERVAL,
            acceleration: DEFAULT_THROTTLE_ACCELERATION,
            deceleration: DEFAULT_THROTTLE_DECELERATION,
            scale: DEFAULT_THROTTLE_SCALE,
            threshold_permille: DEFAULT_THROTTLE_THRESHOLD_PERMILLE,
        }
    }
}

impl ThrottleConfig {
    /// Wire form for the `ThrottleConfigure` command.
    pub(crate) fn to_wire(self) -> ThrottleBody {
        ThrottleBody {
            interval_ms: self.interval.as_millis() as u32,
            acceleration: self.acceleration,
            deceleration: self.deceleration,
            threshold_permille: self.threshold_permille,
        }
    }

    /// Apply a remote `ThrottleConfigure`, keeping the local scale ceiling.
    pub(crate) fn apply_wire(&mut self, body: ThrottleBody) {
        self.interval = Duration::from_millis(u64::from(body.interval_ms));
        self.acceleration = body.acceleration;
        self.deceleration = body.deceleration;
        self.threshold_permille = body.threshold_permille;
    }
}

// ─── Throttle ────────────────────────────────────────────────────────────────

/// Windowed loss tracker plus the probabilistic gate.
#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    value: u32,
    window_start: Instant,
    window_sent: u32,
    window_lost: u32,
}

impl Throttle {
    pub fn new(config: ThrottleConfig, now: Instant) -> Self {
        Throttle {
            value: config.scale,
            config,
            window_start: now,
            window_sent: 0,
            window_lost: 0,
        }
    }

    /// Current throttle value, `0..=scale`.
    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config
    }

    /// Replace the parameters, clamping the current value to the new ceiling.
    pub fn configure(&mut self, config: ThrottleConfig) {
        self.config = config;
        self.value = self.value.min(config.scale);
    }

    pub(crate) fn apply_wire(&mut self, body: ThrottleBody) {
        self.config.apply_wire(body);
        self.value = self.value.min(self.config.scale);
    }

    /// Record one reliable command entering flight this window.
    pub fn record_sent(&mut self) {
        self.window_sent = self.window_sent.saturating_add(1);
    }

    /// Record one reliable retransmission this window.
    pub fn record_lost(&mut self) {
        self.window_lost = self.window_lost.saturating_add(1);
    }

    /// Close the window if the interval has elapsed and adjust the value.
    /// Returns `true` when an adjustment was made.
    pub fn tick(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) < self.config.interval {
            return false;
        }
        let loss_permille = if self.window_sent == 0 {
            0
        } else {
            (u64::from(self.window_lost) * 1000 / u64::from(self.window_sent)) as u32
        };
        if loss_permille > self.config.threshold_permille {
            self.value /= self.config.deceleration.max(1);
        } else {
            self.value = self
                .value
                .saturating_add(self.config.acceleration)
                .min(self.config.scale);
        }
        self.window_start = now;
        self.window_sent = 0;
        self.window_lost = 0;
        true
    }

    /// Probabilistically admit one unreliable-class send.
    pub fn gate(&self, rng: &mut impl Rng) -> bool {
        if self.value >= self.config.scale {
            return true;
        }
        if self.value == 0 {
            return false;
        }
        rng.random_range(0..self.config.scale) < self.value
    }
}

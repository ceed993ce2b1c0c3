// Circuit breaker for flaky external processes
//
// Three states. CLOSED passes calls through and counts consecutive
// failures; at the threshold the breaker OPENs for a cool-down. When
// the cool-down lapses one probe is allowed (HALF_OPEN): success closes
// the breaker, failure re-opens it with the cool-down doubled, up to a
// cap.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    cooldown: Duration,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, base_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            base_cooldown,
            max_cooldown,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            cooldown: base_cooldown,
            open_until: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may proceed right now. An expired cool-down
    /// transitions to HALF_OPEN and admits exactly one probe.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.open_until.map(|t| Instant::now() >= t).unwrap_or(true) {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.cooldown = self.base_cooldown;
        self.open_until = None;
    }

    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => {
                // Failed probe: back open with a doubled cool-down
                self.cooldown = (self.cooldown * 2).min(self.max_cooldown);
                self.trip();
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.open_until = Some(Instant::now() + self.cooldown);
    }
}

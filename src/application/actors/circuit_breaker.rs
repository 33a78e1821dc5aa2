use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed passes before the breaker opens
    pub failure_threshold: u32,
    /// Successful trial passes needed to close again
    pub success_threshold: u32,
    /// Time spent open before a trial pass is allowed
    pub timeout_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            timeout_duration: Duration::from_secs(300),
        }
    }
}

/// Per-broker breaker around reconciliation passes
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    open_time: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            open_time: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn should_attempt(&mut self) -> bool {
        self.should_attempt_at(Instant::now())
    }

    /// Whether a pass may start at `now`. Once the cooldown has elapsed a
    /// single trial pass is let through.
    pub fn should_attempt_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .open_time
                    .map_or(true, |t| now.duration_since(t) >= self.config.timeout_duration);
                if cooled {
                    self.transition_to(CircuitState::HalfOpen, now);
                    self.trial_in_flight = true;
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count += 1;
        match self.state {
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.transition_to(CircuitState::Open, now);
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.transition_to(CircuitState::Open, now);
            }
            _ => {}
        }
    }

    fn transition_to(&mut self, new_state: CircuitState, now: Instant) {
        if self.state == new_state {
            return;
        }
        match new_state {
            CircuitState::Open => {
                self.open_time = Some(now);
                warn!(
                    "Circuit for {} opened after {} consecutive failures",
                    self.name, self.failure_count
                );
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.open_time = None;
                info!("Circuit for {} closed", self.name);
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                info!("Circuit for {} half-open, allowing a trial pass", self.name);
            }
        }
        self.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "paper",
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                timeout_duration: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure_at(t0);
        assert!(cb.is_open());
        assert!(!cb.should_attempt_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);

        let later = t0 + Duration::from_secs(61);
        assert!(cb.should_attempt_at(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.should_attempt_at(later));

        cb.record_success_at(later);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_attempt_at(later));
    }

    #[test]
    fn test_failed_trial_reopens() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);

        let later = t0 + Duration::from_secs(61);
        assert!(cb.should_attempt_at(later));
        cb.record_failure_at(later);
        assert!(cb.is_open());
        assert!(!cb.should_attempt_at(later + Duration::from_secs(30)));
        assert!(cb.should_attempt_at(later + Duration::from_secs(61)));
    }
}

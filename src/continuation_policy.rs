use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::models::{AttemptStatus, ContinuationLimits};

/// Gate on how often a user may attempt a quiz: a fixed attempt budget
/// per rolling window, a cooldown after failed attempts, and a full
/// reset once the window expires. All evaluation takes `now` as a
/// parameter so callers (and tests) control the clock.
#[derive(Debug, Clone)]
pub struct ContinuationPolicy {
    pub max_attempts: i32,
    pub cooldown: Duration,
    pub reset_window: Duration,
}

/// Result of a status check. `updated` carries a rewritten limits row
/// when the check itself changed state (window expiry reset); the
/// service layer persists it.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub status: AttemptStatus,
    pub updated: Option<ContinuationLimits>,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        ContinuationPolicy {
            max_attempts: 3,
            cooldown: Duration::hours(24),
            reset_window: Duration::days(7),
        }
    }
}

impl ContinuationPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        ContinuationPolicy {
            max_attempts: config.max_attempts,
            cooldown: Duration::hours(config.cooldown_hours),
            reset_window: Duration::days(config.reset_days),
        }
    }

    /// Decide whether an attempt is currently allowed, in precedence
    /// order: fresh user, expired window, active cooldown, exhausted
    /// budget, re-derived cooldown, allowed.
    pub fn evaluate(
        &self,
        limits: Option<&ContinuationLimits>,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        let Some(limits) = limits else {
            return PolicyDecision {
                status: self.fresh_status(),
                updated: None,
            };
        };

        // Window expired: zero the counter and start a new window.
        if now > limits.reset_at {
            let reset = ContinuationLimits {
                user_id: limits.user_id,
                quiz_id: limits.quiz_id,
                attempts_used: 0,
                last_attempt_at: None,
                blocked_until: None,
                reset_at: now + self.reset_window,
            };
            let status = AttemptStatus {
                can_attempt: true,
                attempts_remaining: self.max_attempts,
                total_attempts: self.max_attempts,
                attempts_used: 0,
                next_attempt_available_at: None,
                reset_at: Some(reset.reset_at),
                blocked_until: None,
                message: "Attempts have been reset".to_string(),
            };
            return PolicyDecision {
                status,
                updated: Some(reset),
            };
        }

        // Active cooldown from the last failed attempt.
        if let Some(blocked_until) = limits.blocked_until {
            if now < blocked_until {
                return PolicyDecision {
                    status: self.blocked_status(
                        limits,
                        blocked_until,
                        format!(
                            "You can try again after {}",
                            blocked_until.format("%Y-%m-%d %H:%M UTC")
                        ),
                    ),
                    updated: None,
                };
            }
        }

        // Budget exhausted: blocked until the window rolls over, even
        // if a stale cooldown already lies in the past.
        if limits.attempts_used >= self.max_attempts {
            return PolicyDecision {
                status: self.blocked_status(
                    limits,
                    limits.reset_at,
                    format!(
                        "You've used all {} attempts. Attempts reset on {}",
                        self.max_attempts,
                        limits.reset_at.format("%Y-%m-%d %H:%M UTC")
                    ),
                ),
                updated: None,
            };
        }

        // A failure cooldown recorded under an older, shorter cooldown
        // setting is re-derived against the current policy. Rows with
        // no cooldown on record are never re-blocked here.
        if limits.blocked_until.is_some() {
            if let Some(last) = limits.last_attempt_at {
                let cooldown_end = last + self.cooldown;
                if now < cooldown_end {
                    return PolicyDecision {
                        status: self.blocked_status(
                            limits,
                            cooldown_end,
                            format!(
                                "You can try again after {}",
                                cooldown_end.format("%Y-%m-%d %H:%M UTC")
                            ),
                        ),
                        updated: None,
                    };
                }
            }
        }

        let remaining = self.max_attempts - limits.attempts_used;
        PolicyDecision {
            status: AttemptStatus {
                can_attempt: true,
                attempts_remaining: remaining,
                total_attempts: self.max_attempts,
                attempts_used: limits.attempts_used,
                next_attempt_available_at: None,
                reset_at: Some(limits.reset_at),
                blocked_until: None,
                message: format!(
                    "You have {} attempt{} remaining",
                    remaining,
                    if remaining == 1 { "" } else { "s" }
                ),
            },
            updated: None,
        }
    }

    /// Consume one attempt. Failed attempts start a cooldown; passing
    /// attempts only spend budget, leaving the user free to retake for
    /// a better score. Creates the row on first use and rolls the
    /// window first when it has already expired.
    pub fn record_attempt(
        &self,
        limits: Option<ContinuationLimits>,
        user_id: Uuid,
        quiz_id: Uuid,
        passed: bool,
        now: DateTime<Utc>,
    ) -> ContinuationLimits {
        let mut limits = match limits {
            Some(mut limits) => {
                if now > limits.reset_at {
                    limits.attempts_used = 0;
                    limits.blocked_until = None;
                    limits.reset_at = now + self.reset_window;
                }
                limits
            }
            None => ContinuationLimits {
                user_id,
                quiz_id,
                attempts_used: 0,
                last_attempt_at: None,
                blocked_until: None,
                reset_at: now + self.reset_window,
            },
        };
        limits.attempts_used = (limits.attempts_used + 1).min(self.max_attempts);
        limits.last_attempt_at = Some(now);
        // A pass never starts a cooldown, but it does not erase one
        // already running from an earlier failure either.
        if !passed {
            limits.blocked_until = Some(now + self.cooldown);
        }
        limits
    }

    /// Staff override: zero everything and start a fresh window.
    pub fn reset_attempts(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
        now: DateTime<Utc>,
    ) -> ContinuationLimits {
        ContinuationLimits {
            user_id,
            quiz_id,
            attempts_used: 0,
            last_attempt_at: None,
            blocked_until: None,
            reset_at: now + self.reset_window,
        }
    }

    fn fresh_status(&self) -> AttemptStatus {
        AttemptStatus {
            can_attempt: true,
            attempts_remaining: self.max_attempts,
            total_attempts: self.max_attempts,
            attempts_used: 0,
            next_attempt_available_at: None,
            reset_at: None,
            blocked_until: None,
            message: format!("You have {} attempts available", self.max_attempts),
        }
    }

    fn blocked_status(
        &self,
        limits: &ContinuationLimits,
        next_available: DateTime<Utc>,
        message: String,
    ) -> AttemptStatus {
        AttemptStatus {
            can_attempt: false,
            attempts_remaining: (self.max_attempts - limits.attempts_used).max(0),
            total_attempts: self.max_attempts,
            attempts_used: limits.attempts_used,
            next_attempt_available_at: Some(next_available),
            reset_at: Some(limits.reset_at),
            blocked_until: limits.blocked_until,
            message,
        }
    }
}

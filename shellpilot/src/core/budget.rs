//! Deadline arithmetic shared by the shell read loop and the controller.

use std::time::{Duration, Instant};

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Resolve a requested step timeout against the configured default and ceiling.
///
/// A missing or zero request uses `default`; anything above `max` is clamped.
pub fn resolve_step_timeout(
    requested_secs: Option<u64>,
    default: Duration,
    max: Duration,
) -> Duration {
    let requested = match requested_secs {
        Some(0) | None => default,
        Some(secs) => Duration::from_secs(secs),
    };
    requested.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_deadline_has_no_budget() {
        let deadline = Instant::now() - Duration::from_millis(1);
        assert_eq!(remaining_budget(deadline), None);
    }

    #[test]
    fn future_deadline_has_budget() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let remaining = remaining_budget(deadline).expect("budget");
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
    }

    #[test]
    fn step_timeout_defaults_and_clamps() {
        let default = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        assert_eq!(resolve_step_timeout(None, default, max), default);
        assert_eq!(resolve_step_timeout(Some(0), default, max), default);
        assert_eq!(resolve_step_timeout(Some(5), default, max), Duration::from_secs(5));
        assert_eq!(resolve_step_timeout(Some(9_999), default, max), max);
    }
}

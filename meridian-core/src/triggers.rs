//! # Failover Triggers
//!
//! Predicates deciding whether a particular failure should cause the router
//! to fail over to the next candidate, as opposed to being surfaced directly
//! to the caller.

use crate::error::ProviderError;

/// A named failover predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fires when the upstream status is in `{429, 500, 502, 503, 504}`.
    StatusCode,
    /// Fires when the error wraps a deadline-exceeded/timeout condition.
    Timeout,
    /// Fires when the error is, or wraps, a network/transport failure.
    Connection,
}

impl Trigger {
    /// The default trigger set used when no explicit configuration overrides it.
    pub const DEFAULT: [Trigger; 3] = [Trigger::StatusCode, Trigger::Timeout, Trigger::Connection];

    fn matches(self, err: &ProviderError) -> bool {
        match self {
            Trigger::StatusCode => matches!(
                err.status_code(),
                Some(429) | Some(500) | Some(502) | Some(503) | Some(504)
            ),
            Trigger::Timeout => err.is_timeout(),
            Trigger::Connection => err.is_connection_error(),
        }
    }
}

/// Whether any trigger in `triggers` fires for `err`. An empty trigger list
/// never fails over.
pub fn should_failover(triggers: &[Trigger], err: &ProviderError) -> bool {
    triggers.iter().any(|t| t.matches(err))
}

/// The first trigger in `triggers` that fires for `err`, for logging.
pub fn find_matching_trigger(triggers: &[Trigger], err: &ProviderError) -> Option<Trigger> {
    triggers.iter().copied().find(|t| t.matches(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trigger_list_never_fails_over() {
        let err = ProviderError::Timeout;
        assert!(!should_failover(&[], &err));
    }

    #[test]
    fn default_set_fires_on_rate_limit_status() {
        let err = ProviderError::RateLimit;
        assert!(should_failover(&Trigger::DEFAULT, &err));
        assert_eq!(find_matching_trigger(&Trigger::DEFAULT, &err), Some(Trigger::StatusCode));
    }

    #[test]
    fn default_set_fires_on_timeout() {
        let err = ProviderError::Timeout;
        assert_eq!(find_matching_trigger(&Trigger::DEFAULT, &err), Some(Trigger::Timeout));
    }

    #[test]
    fn non_retryable_validation_errors_do_not_fail_over() {
        let err = ProviderError::ModelNotFound {
            model: "unknown".to_string(),
        };
        assert!(!should_failover(&Trigger::DEFAULT, &err));
    }
}

use std::time::{Duration, Instant};

use chatgate_contracts::UNKNOWN_CLIENT;

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub processing_timeout: Duration,
}

/// The part of a chat session the admission decision looks at.
#[derive(Debug, Clone, Copy)]
pub struct LockState<'a> {
    pub processing: bool,
    pub owner: &'a str,
    pub owner_user: &'a str,
    pub last_activity: Instant,
}

/// Who is asking for the chat.
#[derive(Debug, Clone, Copy)]
pub struct Requester<'a> {
    pub client: &'a str,
    pub user: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    Created,
    Idle,
    Reentrant,
    StaleOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Admit(AdmitReason),
    Deny { reason_code: &'static str },
}

pub fn evaluate_gate(
    state: Option<&LockState<'_>>,
    requester: Requester<'_>,
    now: Instant,
    cfg: &GateConfig,
) -> GateDecision {
    let Some(state) = state else {
        return GateDecision::Admit(AdmitReason::Created);
    };
    if !state.processing {
        return GateDecision::Admit(AdmitReason::Idle);
    }
    // A client id alone is not proof of identity; it must come from the same user.
    if state.owner == requester.client && state.owner_user == requester.user {
        return GateDecision::Admit(AdmitReason::Reentrant);
    }
    if is_stale(state.last_activity, now, cfg.processing_timeout) {
        return GateDecision::Admit(AdmitReason::StaleOverride);
    }
    GateDecision::Deny {
        reason_code: "chat_busy",
    }
}

pub fn is_stale(last_activity: Instant, now: Instant, processing_timeout: Duration) -> bool {
    now.saturating_duration_since(last_activity) > processing_timeout
}

pub fn is_inactive(last_activity: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(last_activity) > threshold
}

pub fn client_instance_or_default(header: Option<&str>) -> String {
    match header.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => UNKNOWN_CLIENT.to_string(),
    }
}

pub fn admit_reason_name(reason: AdmitReason) -> &'static str {
    match reason {
        AdmitReason::Created => "created",
        AdmitReason::Idle => "idle",
        AdmitReason::Reentrant => "reentrant",
        AdmitReason::StaleOverride => "stale_override",
    }
}

/// Bounded exponential backoff applied by callers after a conflict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_500),
            factor: 1.5,
            max_delay: Duration::from_secs(10),
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). `None` once retries are exhausted.
    pub fn delay_for(&self, retry: usize) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(capped.max(0.0)))
    }

    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries)
            .filter_map(|retry| self.delay_for(retry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>(client: &'a str, user: &'a str) -> Requester<'a> {
        Requester { client, user }
    }

    fn cfg() -> GateConfig {
        GateConfig {
            processing_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn absent_session_is_created() {
        let now = Instant::now();
        assert_eq!(
            evaluate_gate(None, req("a", "u1"), now, &cfg()),
            GateDecision::Admit(AdmitReason::Created)
        );
    }

    #[test]
    fn idle_session_admits_any_client() {
        let now = Instant::now();
        let state = LockState {
            processing: false,
            owner: "a",
            owner_user: "u1",
            last_activity: now,
        };
        assert_eq!(
            evaluate_gate(Some(&state), req("b", "u1"), now, &cfg()),
            GateDecision::Admit(AdmitReason::Idle)
        );
    }

    #[test]
    fn same_client_is_reentrant_while_processing() {
        let now = Instant::now();
        let state = LockState {
            processing: true,
            owner: "a",
            owner_user: "u1",
            last_activity: now,
        };
        assert_eq!(
            evaluate_gate(Some(&state), req("a", "u1"), now, &cfg()),
            GateDecision::Admit(AdmitReason::Reentrant)
        );
    }

    #[test]
    fn borrowed_client_id_from_another_user_is_denied() {
        let now = Instant::now();
        let state = LockState {
            processing: true,
            owner: "a",
            owner_user: "u1",
            last_activity: now,
        };
        assert_eq!(
            evaluate_gate(Some(&state), req("a", "u2"), now, &cfg()),
            GateDecision::Deny {
                reason_code: "chat_busy"
            }
        );
    }

    #[test]
    fn other_client_is_denied_while_fresh() {
        let start = Instant::now();
        let state = LockState {
            processing: true,
            owner: "a",
            owner_user: "u1",
            last_activity: start,
        };
        let now = start + Duration::from_secs(30);
        assert_eq!(
            evaluate_gate(Some(&state), req("b", "u1"), now, &cfg()),
            GateDecision::Deny {
                reason_code: "chat_busy"
            }
        );
    }

    #[test]
    fn other_client_overrides_stale_holder() {
        let start = Instant::now();
        let state = LockState {
            processing: true,
            owner: "a",
            owner_user: "u1",
            last_activity: start,
        };
        let now = start + Duration::from_secs(31);
        assert_eq!(
            evaluate_gate(Some(&state), req("b", "u1"), now, &cfg()),
            GateDecision::Admit(AdmitReason::StaleOverride)
        );
    }

    #[test]
    fn clock_skew_never_counts_as_stale() {
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        assert!(!is_stale(later, now, Duration::from_secs(1)));
        assert!(!is_inactive(later, now, Duration::from_secs(1)));
    }

    #[test]
    fn missing_or_blank_client_header_maps_to_sentinel() {
        assert_eq!(client_instance_or_default(None), UNKNOWN_CLIENT);
        assert_eq!(client_instance_or_default(Some("   ")), UNKNOWN_CLIENT);
        assert_eq!(client_instance_or_default(Some(" tab-1 ")), "tab-1");
    }

    #[test]
    fn default_retry_schedule_grows_by_half_each_time() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_millis(1_500),
                Duration::from_millis(2_250),
                Duration::from_millis(3_375),
                Duration::from_micros(5_062_500),
            ]
        );
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(5), None);
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Some(Duration::from_secs(10)));
    }
}

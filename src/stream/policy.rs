use crate::types::{Identity, Role};

const MIN_DELAY_MS: u64 = 250;
const JITTER_RATIO: f64 = 0.2;

/// Only sessions carrying the privileged role get a push connection.
pub(crate) fn should_connect(identity: Option<&Identity>, privileged: &Role) -> bool {
    *privileged != Role::Unknown && identity.is_some_and(|i| i.role == *privileged)
}

fn compute_backoff_ms_with_nanos(base_ms: u64, failures: u32, max_ms: u64, nanos: i128) -> u64 {
    let exp = base_ms.saturating_mul(1_u64 << failures.min(16));
    let capped = exp.min(max_ms.max(base_ms)) as f64;
    let frac = ((nanos % 1000) as f64) / 1000.0;
    let delta = (frac * 2.0 - 1.0) * (capped * JITTER_RATIO);
    ((capped + delta).max(MIN_DELAY_MS as f64)) as u64
}

/// Delay before reconnect attempt `failures + 1`, with jitter.
pub(crate) fn compute_backoff_ms(base_ms: u64, failures: u32, max_ms: u64) -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    compute_backoff_ms_with_nanos(base_ms, failures, max_ms, nanos)
}

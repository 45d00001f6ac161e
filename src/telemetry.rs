//! Counters for session activity.
//!
//! Recorded through the `metrics` facade; the embedding application decides
//! whether and where to export them. Without an installed recorder every call
//! is a no-op.

use metrics::{counter, describe_counter};

// Metric names as constants for consistency
pub const REVALIDATIONS_TOTAL: &str = "session_revalidations_total";
pub const REVALIDATIONS_SKIPPED_TOTAL: &str = "session_revalidations_skipped_total";
pub const PROFILE_FETCH_ATTEMPTS_TOTAL: &str = "session_profile_fetch_attempts_total";
pub const PROFILE_FETCHES_TOTAL: &str = "session_profile_fetches_total";
pub const STALE_RESULTS_TOTAL: &str = "session_stale_results_discarded_total";
pub const SIGN_INS_TOTAL: &str = "session_sign_ins_total";
pub const SIGN_OUTS_TOTAL: &str = "session_sign_outs_total";

/// Register metric descriptions. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        REVALIDATIONS_TOTAL,
        "Session revalidations by outcome (refreshed/invalidated/deferred)"
    );
    describe_counter!(
        REVALIDATIONS_SKIPPED_TOTAL,
        "Revalidation triggers skipped by the activity gate, by reason"
    );
    describe_counter!(
        PROFILE_FETCH_ATTEMPTS_TOTAL,
        "Individual profile fetch calls, retries included"
    );
    describe_counter!(
        PROFILE_FETCHES_TOTAL,
        "Completed profile fetches by outcome (found/missing/failed)"
    );
    describe_counter!(
        STALE_RESULTS_TOTAL,
        "Asynchronous results discarded because the session moved on"
    );
    describe_counter!(SIGN_INS_TOTAL, "Sign-in attempts by status");
    describe_counter!(SIGN_OUTS_TOTAL, "Sign-outs by remote status");
}

pub fn record_revalidation(outcome: &'static str) {
    counter!(REVALIDATIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_revalidation_skipped(reason: &'static str) {
    counter!(REVALIDATIONS_SKIPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_profile_fetch_attempt() {
    counter!(PROFILE_FETCH_ATTEMPTS_TOTAL).increment(1);
}

pub fn record_profile_fetch(outcome: &'static str) {
    counter!(PROFILE_FETCHES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_stale_result(kind: &'static str) {
    counter!(STALE_RESULTS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_sign_in(success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(SIGN_INS_TOTAL, "status" => status).increment(1);
}

pub fn record_sign_out(remote_ok: bool) {
    let status = if remote_ok { "success" } else { "remote_failed" };
    counter!(SIGN_OUTS_TOTAL, "status" => status).increment(1);
}

//! # Status
//!
//! Builds the next `KMSSecret` status from the previous one and the outcome of
//! a reconcile pass.
//!
//! Condition `lastTransitionTime` only moves when the condition's status
//! flips, so rebuilding the status for an unchanged outcome yields an equal
//! value and no write.

use crate::crd::{Condition, FieldStatus, KMSSecretStatus};
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_SYNCED: &str = "Synced";

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_RETRYABLE: &str = "Retryable";

/// Current time in the format written to conditions
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Status after a pass that converged the Secret
pub fn converged_status(
    previous: Option<&KMSSecretStatus>,
    generation: i64,
    fields: BTreeMap<String, FieldStatus>,
    secret_name: &str,
    now: &str,
) -> KMSSecretStatus {
    let mut status = previous.cloned().unwrap_or_default();
    status.observed_generation = Some(generation);
    status.fields = fields;
    status.secret_name = Some(secret_name.to_string());

    let message = format!("Secret {secret_name} is up to date");
    set_condition(&mut status, CONDITION_READY, true, REASON_RECONCILED, &message, now);
    set_condition(&mut status, CONDITION_SYNCED, true, REASON_RECONCILED, &message, now);
    status
}

/// Status after a failed pass
///
/// Everything describing the last converged Secret is kept, since that Secret
/// is left untouched.
pub fn failed_status(
    previous: Option<&KMSSecretStatus>,
    reason: &str,
    message: &str,
    now: &str,
) -> KMSSecretStatus {
    let mut status = previous.cloned().unwrap_or_default();
    set_condition(&mut status, CONDITION_READY, false, reason, message, now);
    set_condition(&mut status, CONDITION_SYNCED, false, reason, message, now);
    status
}

fn set_condition(
    status: &mut KMSSecretStatus,
    type_: &str,
    ok: bool,
    reason: &str,
    message: &str,
    now: &str,
) {
    let value = if ok { "True" } else { "False" };
    let existing = status.conditions.iter_mut().find(|c| c.r#type == type_);

    let transitioned = match existing {
        Some(condition) => {
            let flipped = condition.status != value;
            if flipped {
                condition.status = value.to_string();
                condition.last_transition_time = Some(now.to_string());
            }
            condition.reason = Some(reason.to_string());
            condition.message = Some(message.to_string());
            flipped
        }
        None => {
            status.conditions.push(Condition {
                r#type: type_.to_string(),
                status: value.to_string(),
                last_transition_time: Some(now.to_string()),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            });
            true
        }
    };

    if transitioned && type_ == CONDITION_READY {
        status.last_transition_time = Some(now.to_string());
    }
}
